//! ABOUTME: SecurityPermissions, ResourceLimits and ExecutionStats owned by a ScriptContext
//! ABOUTME: Grounded on the teacher's SecurityContext/EngineFeatures shape (engine/bridge.rs) (§3, §4.8)

use serde::{Deserialize, Serialize};
use zigllms_core::config::{PanicRecoveryStrategy, SandboxLevel};

/// Per-context security posture. `sandbox_level` selects a bundle; the
/// individual flags let a caller tighten (never loosen) that bundle further.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPermissions {
    pub sandbox_level: SandboxLevel,
    pub allow_file_read: bool,
    pub allow_file_write: bool,
    pub allow_process_execute: bool,
    pub allow_network: bool,
    pub allow_env_access: bool,
    pub allow_native_modules: bool,
    /// Module names a context may `import_module`/`register_module`. Empty
    /// means "no restriction" only when `sandbox_level == None`; under
    /// `Restricted`/`Strict` an empty list denies every module.
    pub module_allow_list: Vec<String>,
    pub max_stack_depth: usize,
}

impl Default for SecurityPermissions {
    fn default() -> Self {
        Self::for_level(SandboxLevel::Restricted)
    }
}

impl SecurityPermissions {
    /// Builds the permission bundle a sandbox level implies. `Restricted`
    /// denies filesystem/process/network and bytecode loading; `Strict`
    /// additionally denies native modules and environment access.
    #[must_use]
    pub fn for_level(level: SandboxLevel) -> Self {
        match level {
            SandboxLevel::None => Self {
                sandbox_level: level,
                allow_file_read: true,
                allow_file_write: true,
                allow_process_execute: true,
                allow_network: true,
                allow_env_access: true,
                allow_native_modules: true,
                module_allow_list: Vec::new(),
                max_stack_depth: 200,
            },
            SandboxLevel::Restricted => Self {
                sandbox_level: level,
                allow_file_read: false,
                allow_file_write: false,
                allow_process_execute: false,
                allow_network: false,
                allow_env_access: true,
                allow_native_modules: true,
                module_allow_list: Vec::new(),
                max_stack_depth: 200,
            },
            SandboxLevel::Strict => Self {
                sandbox_level: level,
                allow_file_read: false,
                allow_file_write: false,
                allow_process_execute: false,
                allow_network: false,
                allow_env_access: false,
                allow_native_modules: false,
                module_allow_list: Vec::new(),
                max_stack_depth: 100,
            },
        }
    }

    /// Under `None` an empty allow-list means unrestricted; otherwise a
    /// module must be named explicitly.
    #[must_use]
    pub fn module_allowed(&self, name: &str) -> bool {
        if matches!(self.sandbox_level, SandboxLevel::None) && self.module_allow_list.is_empty() {
            return true;
        }
        self.module_allow_list.iter().any(|m| m == name)
    }
}

/// Resource caps enforced at script entry and, where the engine supports it,
/// from an allocator callback or instruction hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// 0 = unlimited.
    pub max_memory_bytes: u64,
    /// 0 = unlimited.
    pub max_execution_time_ms: u64,
    pub max_allocations: u64,
    pub max_output_bytes: u64,
    /// Instruction-hook stride; smaller catches timeouts sooner at higher overhead.
    pub hook_stride: u32,
    /// Strategy the Panic Wrapper applies when an engine call panics (§4.10).
    pub panic_recovery_strategy: PanicRecoveryStrategy,
    /// Max stack frames the Panic Wrapper captures on a caught panic
    /// (§4.10 step 2: "a stack trace of configurable depth").
    pub panic_stack_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 50_000_000,
            max_execution_time_ms: 30_000,
            max_allocations: 0,
            max_output_bytes: 0,
            hook_stride: 1000,
            panic_recovery_strategy: PanicRecoveryStrategy::ResetState,
            panic_stack_depth: 16,
        }
    }
}

/// Cumulative and point-in-time counters for one Context. Every field is
/// monotonic except `memory_current`, which a GC pass may lower;
/// `memory_peak` tracks the high-water mark separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub cumulative_time_ms: u64,
    pub memory_current: u64,
    pub memory_peak: u64,
    pub allocation_count: u64,
    pub gc_count: u64,
    pub function_calls: u64,
}

impl ExecutionStats {
    pub fn record_memory(&mut self, current: u64) {
        self.memory_current = current;
        self.memory_peak = self.memory_peak.max(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_denies_fs_process_network() {
        let perms = SecurityPermissions::for_level(SandboxLevel::Restricted);
        assert!(!perms.allow_file_read);
        assert!(!perms.allow_process_execute);
        assert!(!perms.allow_network);
    }

    #[test]
    fn strict_also_denies_native_modules_and_env() {
        let perms = SecurityPermissions::for_level(SandboxLevel::Strict);
        assert!(!perms.allow_native_modules);
        assert!(!perms.allow_env_access);
    }

    #[test]
    fn none_level_with_empty_list_allows_any_module() {
        let perms = SecurityPermissions::for_level(SandboxLevel::None);
        assert!(perms.module_allowed("anything"));
    }

    #[test]
    fn restricted_with_empty_list_denies_every_module() {
        let perms = SecurityPermissions::for_level(SandboxLevel::Restricted);
        assert!(!perms.module_allowed("agent"));
    }

    #[test]
    fn explicit_allow_list_is_honored_regardless_of_level() {
        let mut perms = SecurityPermissions::for_level(SandboxLevel::Strict);
        perms.module_allow_list.push("agent".to_string());
        assert!(perms.module_allowed("agent"));
        assert!(!perms.module_allowed("tool"));
    }

    #[test]
    fn memory_peak_tracks_high_water_mark() {
        let mut stats = ExecutionStats::default();
        stats.record_memory(100);
        stats.record_memory(50);
        assert_eq!(stats.memory_current, 50);
        assert_eq!(stats.memory_peak, 100);
    }
}
