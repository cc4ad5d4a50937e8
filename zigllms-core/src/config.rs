//! ABOUTME: EngineConfig, the configuration envelope read at engine/context creation
//! ABOUTME: Recognized keys mirror the teacher's RuntimeConfig `#[serde(default)]` builder pattern

use serde::{Deserialize, Serialize};

/// Coarse security tier selecting a bundle of permission and environment
/// policies (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    /// Allows everything.
    None,
    /// Denies filesystem, process, network, and bytecode loading.
    Restricted,
    /// `Restricted` plus a per-context shadow global environment.
    Strict,
}

/// Recovery strategy dispatched by the Panic Wrapper (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicRecoveryStrategy {
    ResetState,
    NewState,
    Propagate,
}

/// Configuration envelope read at engine or context creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `0` means unlimited.
    pub max_memory_bytes: u64,
    /// `0` means unlimited.
    pub max_execution_time_ms: u64,
    pub enable_debugging: bool,
    pub sandbox_level: SandboxLevel,
    pub enable_snapshots: bool,
    pub max_snapshots: usize,
    pub max_snapshot_size_bytes: u64,
    pub enable_panic_handler: bool,
    pub panic_recovery_strategy: PanicRecoveryStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 50_000_000,
            max_execution_time_ms: 30_000,
            enable_debugging: false,
            sandbox_level: SandboxLevel::Restricted,
            enable_snapshots: true,
            max_snapshots: 10,
            max_snapshot_size_bytes: 10_000_000,
            enable_panic_handler: true,
            panic_recovery_strategy: PanicRecoveryStrategy::ResetState,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for `EngineConfig`, following the teacher's `LuaConfigBuilder`
/// fluent-setter convention.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { config: EngineConfig::default() }
    }

    #[must_use]
    pub const fn max_memory_bytes(mut self, bytes: u64) -> Self {
        self.config.max_memory_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn max_execution_time_ms(mut self, ms: u64) -> Self {
        self.config.max_execution_time_ms = ms;
        self
    }

    #[must_use]
    pub const fn sandbox_level(mut self, level: SandboxLevel) -> Self {
        self.config.sandbox_level = level;
        self
    }

    #[must_use]
    pub const fn panic_recovery_strategy(mut self, strategy: PanicRecoveryStrategy) -> Self {
        self.config.panic_recovery_strategy = strategy;
        self
    }

    #[must_use]
    pub const fn enable_snapshots(mut self, enable: bool) -> Self {
        self.config.enable_snapshots = enable;
        self
    }

    #[must_use]
    pub const fn max_snapshots(mut self, max: usize) -> Self {
        self.config.max_snapshots = max;
        self
    }

    #[must_use]
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_recommended_values() {
        let config = EngineConfig::default();
        assert_eq!(config.sandbox_level, SandboxLevel::Restricted);
        assert_eq!(config.panic_recovery_strategy, PanicRecoveryStrategy::ResetState);
        assert!(config.enable_snapshots);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::builder()
            .sandbox_level(SandboxLevel::Strict)
            .max_execution_time_ms(100)
            .build();
        assert_eq!(config.sandbox_level, SandboxLevel::Strict);
        assert_eq!(config.max_execution_time_ms, 100);
    }

    #[test]
    fn serializes_sandbox_level_lowercase() {
        let json = serde_json::to_value(SandboxLevel::Strict).unwrap();
        assert_eq!(json, serde_json::json!("strict"));
    }
}
