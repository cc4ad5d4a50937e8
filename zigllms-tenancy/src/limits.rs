//! ABOUTME: TenantLimits, TenantConfig and the usage counters a Tenant enforces against them
//! ABOUTME: Grounded on the teacher's TenantConfig/TenantLimits shape (llmspell-tenancy/tests/integration_tests.rs) (§3 Tenant/TenantLimits)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Per-tenant resource caps and sandbox shape (§3). `0` means unlimited for
/// every numeric quota, matching `ResourceLimits`' convention elsewhere in
/// this workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimits {
    pub memory_bytes: u64,
    pub cpu_instruction_quota: u64,
    pub function_call_quota: u64,
    pub max_stack_size: usize,
    /// Module names this tenant's environment may import. Empty denies all.
    pub allowed_modules: Vec<String>,
    /// Global names shadowed to `nil` in the tenant's environment on creation.
    pub denied_globals: Vec<String>,
    /// Always `false` by default; malformed bytecode is a known escape vector.
    pub allow_bytecode_loading: bool,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 0,
            cpu_instruction_quota: 0,
            function_call_quota: 0,
            max_stack_size: 200,
            allowed_modules: Vec::new(),
            denied_globals: default_denied_globals(),
            allow_bytecode_loading: false,
        }
    }
}

/// Globals that are dangerous to leave reachable under an isolated tenant:
/// bytecode/dynamic loaders, raw file and process access, and `os`/`io`
/// escape hatches (named after Lua's stdlib, the first-class engine target).
fn default_denied_globals() -> Vec<String> {
    ["load", "loadstring", "dofile", "loadfile", "os", "io", "require"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Descriptive record a `TenantManager` keeps alongside the tenant's live
/// `Tenant` handle, matching the teacher's `TenantConfig` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub name: String,
    pub limits: TenantLimits,
    pub active: bool,
    pub metadata: HashMap<String, String>,
    #[serde(skip, default = "SystemTime::now")]
    pub created_at: SystemTime,
    #[serde(skip, default = "SystemTime::now")]
    pub last_accessed: SystemTime,
}

impl TenantConfig {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, limits: TenantLimits) -> Self {
        let now = SystemTime::now();
        Self {
            tenant_id: tenant_id.into(),
            name: name.into(),
            limits,
            active: true,
            metadata: HashMap::new(),
            created_at: now,
            last_accessed: now,
        }
    }
}

/// Live, monotonically accumulating counters checked against `TenantLimits`.
/// Populated either by the `Tenant` itself (function calls, via the
/// wrapped `ScriptContext`'s own stats) or by an engine-level integration
/// point (`Tenant::charge_instructions`, meant to be driven by a host
/// instruction hook such as `mlua::Lua::set_hook`).
#[derive(Debug, Default)]
pub struct TenantUsage {
    instructions_used: AtomicU64,
    function_calls_used: AtomicU64,
}

impl TenantUsage {
    #[must_use]
    pub fn instructions_used(&self) -> u64 {
        self.instructions_used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn function_calls_used(&self) -> u64 {
        self.function_calls_used.load(Ordering::Relaxed)
    }

    pub(crate) fn add_instructions(&self, n: u64) -> u64 {
        self.instructions_used.fetch_add(n, Ordering::Relaxed) + n
    }

    pub(crate) fn record_call(&self) -> u64 {
        self.function_calls_used.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deny_bytecode_loading_and_common_escape_hatches() {
        let limits = TenantLimits::default();
        assert!(!limits.allow_bytecode_loading);
        assert!(limits.denied_globals.contains(&"os".to_string()));
        assert!(limits.denied_globals.contains(&"load".to_string()));
    }

    #[test]
    fn usage_counters_accumulate() {
        let usage = TenantUsage::default();
        assert_eq!(usage.add_instructions(10), 10);
        assert_eq!(usage.add_instructions(5), 15);
        assert_eq!(usage.record_call(), 1);
        assert_eq!(usage.function_calls_used(), 1);
    }
}
