//! ABOUTME: ScriptEngine trait, EngineFeatures and the process-wide EngineRegistry
//! ABOUTME: Grounded on the teacher's ScriptEngineBridge/EngineFactory (engine/bridge.rs, engine/factory.rs) (§4.3, §4.5)

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::module::ScriptModule;
use zigllms_core::value::ScriptValue;

/// Opaque handle to one context hosted inside an engine implementation.
pub type EngineContextId = u64;

/// Capability vector an engine declares so callers can pick an engine (or
/// reject a required feature) without downcasting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineFeatures {
    pub async_support: bool,
    pub debugging: bool,
    pub sandboxing: bool,
    pub hot_reload: bool,
    pub native_json: bool,
    pub native_regex: bool,
}

/// A captured native stack trace for a suspended or erroring context.
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    pub frames: Vec<zigllms_core::error::StackFrame>,
}

/// The fixed operation set every embedded language implements (§4.3).
///
/// Implementations are free in *how* each operation is carried out;
/// required behaviors: load failures surface as `Syntax` or `Module`,
/// runtime failures use the matching taxonomy code, and every operation
/// that runs script code is expected to be called from inside a
/// `zigllms_state::protected_call` shell by the owning `ScriptContext`.
pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn features(&self) -> EngineFeatures;
    fn supported_extensions(&self) -> &[&'static str];

    /// Creates a new engine-native context and returns its opaque id.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot allocate native state.
    fn create_context(&self) -> Result<EngineContextId, ScriptError>;

    /// Destroys a context. Idempotent on an unknown id.
    fn destroy_context(&self, context: EngineContextId);

    /// Parses and registers `source` under `name` without executing it.
    ///
    /// # Errors
    ///
    /// `Syntax` on a parse failure.
    fn load_script(&self, context: EngineContextId, source: &str, name: &str) -> Result<(), ScriptError>;

    /// Reads and loads a script from `path`.
    ///
    /// # Errors
    ///
    /// `Syntax` on a parse failure, `Module` if the file cannot be read.
    fn load_file(&self, context: EngineContextId, path: &std::path::Path) -> Result<(), ScriptError>;

    /// Executes `source` to completion and returns its result value.
    ///
    /// # Errors
    ///
    /// Any taxonomy code depending on failure mode; always passes through
    /// protected execution, so a host-language panic surfaces as `Runtime`
    /// rather than unwinding past this call.
    fn execute_script(&self, context: EngineContextId, source: &str) -> Result<ScriptValue, ScriptError>;

    /// Calls a previously loaded/registered function by name.
    ///
    /// # Errors
    ///
    /// `Reference` if the name is unbound, otherwise the matching code.
    fn execute_function(
        &self,
        context: EngineContextId,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError>;

    /// Makes `module`'s functions/constants callable under its own name.
    ///
    /// # Errors
    ///
    /// `Permission` if the module is outside the context's allow-list.
    fn register_module(&self, context: EngineContextId, module: &ScriptModule) -> Result<(), ScriptError>;

    /// Imports an already-registered module into the executing namespace.
    ///
    /// # Errors
    ///
    /// `Module` if the name has not been registered.
    fn import_module(&self, context: EngineContextId, name: &str) -> Result<(), ScriptError>;

    /// Deep-clones `value` across the boundary and binds it as a global.
    ///
    /// # Errors
    ///
    /// `Type` if `value` cannot be represented in the engine's native system.
    fn set_global(&self, context: EngineContextId, name: &str, value: &ScriptValue) -> Result<(), ScriptError>;

    /// Reads a global, deep-cloning it out of the engine.
    ///
    /// # Errors
    ///
    /// `Reference` if the global is unbound.
    fn get_global(&self, context: EngineContextId, name: &str) -> Result<ScriptValue, ScriptError>;

    fn last_error(&self, context: EngineContextId) -> Option<ScriptError>;
    fn clear_errors(&self, context: EngineContextId);

    fn collect_garbage(&self, context: EngineContextId);
    fn memory_usage(&self, context: EngineContextId) -> u64;

    /// Arms whatever native enforcement the engine has for `limits`
    /// (§4.8, §4.11): a memory-allocator cap and/or an instruction hook
    /// that raises `Timeout` once its budget is exhausted. Called once
    /// per context, right after creation. Engines with no such native
    /// primitive keep the default no-op; `ScriptContext`'s own
    /// entry/wall-time checks (§4.4) still apply regardless.
    ///
    /// # Errors
    ///
    /// Whatever the engine's own limit-configuration call returns.
    fn configure_limits(&self, _context: EngineContextId, _limits: &crate::permissions::ResourceLimits) -> Result<(), ScriptError> {
        Ok(())
    }

    /// Returns `Module` error "breakpoints not supported" unless overridden.
    fn set_breakpoint(&self, _context: EngineContextId, _file: &str, _line: u32) -> Result<(), ScriptError> {
        Err(unsupported_debug_op("set_breakpoint"))
    }

    fn remove_breakpoint(&self, _context: EngineContextId, _file: &str, _line: u32) -> Result<(), ScriptError> {
        Err(unsupported_debug_op("remove_breakpoint"))
    }

    fn stack_trace(&self, _context: EngineContextId) -> Result<StackTrace, ScriptError> {
        Err(unsupported_debug_op("stack_trace"))
    }
}

fn unsupported_debug_op(op: &str) -> ScriptError {
    ScriptError::new(ScriptErrorCode::Module, format!("{op} is not supported by this engine"))
}

/// Catalog entry for one registered engine.
#[derive(Clone)]
pub struct EngineInfo {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub extensions: Vec<String>,
    pub features: EngineFeatures,
    pub description: String,
}

/// `(EngineConfig) -> ScriptEngine`. Factories must be side-effect-free apart
/// from allocating the engine, and safe to call concurrently (§6).
pub type EngineFactory = Arc<dyn Fn(&zigllms_core::config::EngineConfig) -> Result<Box<dyn ScriptEngine>, ScriptError> + Send + Sync>;

struct Registration {
    info: EngineInfo,
    factory: EngineFactory,
}

/// Process-wide engine catalog. Never holds engine instances — it vends
/// them through each registration's factory. All operations are
/// thread-safe via an internal `RwLock` (§4.5, §5).
pub struct EngineRegistry {
    registrations: RwLock<HashMap<String, Registration>>,
    default_name: RwLock<Option<String>>,
}

static REGISTRY: LazyLock<EngineRegistry> = LazyLock::new(EngineRegistry::empty);

impl EngineRegistry {
    fn empty() -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            default_name: RwLock::new(None),
        }
    }

    /// The process-wide singleton instance.
    pub fn global() -> &'static EngineRegistry {
        &REGISTRY
    }

    pub fn register_engine(&self, info: EngineInfo, factory: EngineFactory) {
        let name = info.name.clone();
        self.registrations
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name, Registration { info, factory });
    }

    pub fn unregister_engine(&self, name: &str) {
        self.registrations
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
    }

    /// # Errors
    ///
    /// `Module` if no engine is registered under `name`, or whatever the
    /// factory returns.
    pub fn create_engine(
        &self,
        name: &str,
        config: &zigllms_core::config::EngineConfig,
    ) -> Result<Box<dyn ScriptEngine>, ScriptError> {
        let factory = {
            let registrations = self.registrations.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            registrations
                .get(name)
                .map(|r| r.factory.clone())
                .ok_or_else(|| ScriptError::new(ScriptErrorCode::Module, format!("unknown engine: {name}")))?
        };
        factory(config)
    }

    /// Dispatches by file extension, first registered match wins.
    ///
    /// # Errors
    ///
    /// `Module` if no engine declares `extension`.
    pub fn create_by_extension(
        &self,
        extension: &str,
        config: &zigllms_core::config::EngineConfig,
    ) -> Result<Box<dyn ScriptEngine>, ScriptError> {
        let name = {
            let registrations = self.registrations.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            registrations
                .values()
                .find(|r| r.info.extensions.iter().any(|e| e == extension))
                .map(|r| r.info.name.clone())
                .ok_or_else(|| ScriptError::new(ScriptErrorCode::Module, format!("no engine registered for .{extension}")))?
        };
        self.create_engine(&name, config)
    }

    /// # Errors
    ///
    /// `Module` if `name` is not registered.
    pub fn set_default(&self, name: &str) -> Result<(), ScriptError> {
        if !self.registrations.read().unwrap_or_else(std::sync::PoisonError::into_inner).contains_key(name) {
            return Err(ScriptError::new(ScriptErrorCode::Module, format!("unknown engine: {name}")));
        }
        *self.default_name.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(name.to_string());
        Ok(())
    }

    /// # Errors
    ///
    /// `Module` if no default has been set, or if creation fails.
    pub fn create_default(&self, config: &zigllms_core::config::EngineConfig) -> Result<Box<dyn ScriptEngine>, ScriptError> {
        let name = self
            .default_name
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ScriptError::new(ScriptErrorCode::Module, "no default engine configured"))?;
        self.create_engine(&name, config)
    }

    #[must_use]
    pub fn list_engines(&self) -> Vec<EngineInfo> {
        self.registrations
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|r| r.info.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEngine;

    impl ScriptEngine for NullEngine {
        fn name(&self) -> &'static str {
            "null"
        }
        fn features(&self) -> EngineFeatures {
            EngineFeatures::default()
        }
        fn supported_extensions(&self) -> &[&'static str] {
            &["null"]
        }
        fn create_context(&self) -> Result<EngineContextId, ScriptError> {
            Ok(1)
        }
        fn destroy_context(&self, _context: EngineContextId) {}
        fn load_script(&self, _context: EngineContextId, _source: &str, _name: &str) -> Result<(), ScriptError> {
            Ok(())
        }
        fn load_file(&self, _context: EngineContextId, _path: &std::path::Path) -> Result<(), ScriptError> {
            Ok(())
        }
        fn execute_script(&self, _context: EngineContextId, _source: &str) -> Result<ScriptValue, ScriptError> {
            Ok(ScriptValue::Nil)
        }
        fn execute_function(
            &self,
            _context: EngineContextId,
            _name: &str,
            _args: &[ScriptValue],
        ) -> Result<ScriptValue, ScriptError> {
            Ok(ScriptValue::Nil)
        }
        fn register_module(&self, _context: EngineContextId, _module: &ScriptModule) -> Result<(), ScriptError> {
            Ok(())
        }
        fn import_module(&self, _context: EngineContextId, _name: &str) -> Result<(), ScriptError> {
            Ok(())
        }
        fn set_global(&self, _context: EngineContextId, _name: &str, _value: &ScriptValue) -> Result<(), ScriptError> {
            Ok(())
        }
        fn get_global(&self, _context: EngineContextId, _name: &str) -> Result<ScriptValue, ScriptError> {
            Ok(ScriptValue::Nil)
        }
        fn last_error(&self, _context: EngineContextId) -> Option<ScriptError> {
            None
        }
        fn clear_errors(&self, _context: EngineContextId) {}
        fn collect_garbage(&self, _context: EngineContextId) {}
        fn memory_usage(&self, _context: EngineContextId) -> u64 {
            0
        }
    }

    fn registry_with_null() -> EngineRegistry {
        // Each test builds its own registry rather than touching the process
        // singleton, which would race across the test binary's threads.
        EngineRegistry::empty()
    }

    #[test]
    fn create_by_extension_dispatches_to_first_match() {
        let registry = registry_with_null();
        registry.register_engine(
            EngineInfo {
                name: "null".to_string(),
                display_name: "Null".to_string(),
                version: "0.0".to_string(),
                extensions: vec!["null".to_string()],
                features: EngineFeatures::default(),
                description: String::new(),
            },
            Arc::new(|_config| Ok(Box::new(NullEngine) as Box<dyn ScriptEngine>)),
        );
        let engine = registry.create_by_extension("null", &zigllms_core::config::EngineConfig::default()).unwrap();
        assert_eq!(engine.name(), "null");
    }

    #[test]
    fn unknown_engine_name_is_a_module_error() {
        let registry = registry_with_null();
        let err = registry.create_engine("nope", &zigllms_core::config::EngineConfig::default()).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Module);
    }

    #[test]
    fn default_engine_must_be_set_before_use() {
        let registry = registry_with_null();
        let err = registry.create_default(&zigllms_core::config::EngineConfig::default()).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Module);
    }

    #[test]
    fn unsupported_debug_ops_return_module_error() {
        let engine = NullEngine;
        let err = engine.set_breakpoint(1, "main.lua", 1).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Module);
    }
}
