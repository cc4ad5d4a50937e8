//! ABOUTME: ModuleRegistry - APIBridge catalog, lazy/cached resolution and per-context injection
//! ABOUTME: Grounded on the teacher's GlobalRegistry (globals/registry.rs) and GlobalInjector (globals/injection.rs) (§4.6)

use crate::engine::{EngineContextId, ScriptEngine};
use crate::permissions::SecurityPermissions;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::module::{APIBridge, ScriptModule};

/// Catalog of `APIBridge`s available to be injected into a context. Holds
/// bridges in registration order; `get_module` is invoked at most once per
/// bridge and the materialized, prefix-renamed module is cached for reuse
/// across contexts.
pub struct ModuleRegistry {
    prefix: String,
    bridges: RwLock<Vec<Arc<dyn APIBridge>>>,
    cache: RwLock<HashMap<String, ScriptModule>>,
    auto_imports: RwLock<Vec<String>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            bridges: RwLock::new(Vec::new()),
            cache: RwLock::new(HashMap::new()),
            auto_imports: RwLock::new(Vec::new()),
        }
    }

    pub fn register_bridge(&self, bridge: Arc<dyn APIBridge>) {
        self.bridges.write().push(bridge);
    }

    /// Modules imported into every context after the main injection pass,
    /// in the order given.
    pub fn set_auto_imports(&self, names: Vec<String>) {
        *self.auto_imports.write() = names;
    }

    fn qualified_name(&self, bridge_name: &str) -> String {
        format!("{}.{}", self.prefix, bridge_name)
    }

    /// Resolves (building and caching on first use) the prefix-renamed
    /// module for one bridge.
    fn resolve(&self, bridge: &Arc<dyn APIBridge>) -> Result<ScriptModule, ScriptError> {
        let qualified = self.qualified_name(bridge.name());
        if let Some(cached) = self.cache.read().get(&qualified) {
            return Ok(cached.clone());
        }
        let mut module = bridge.get_module()?;
        module.name = qualified.clone();
        self.cache.write().insert(qualified, module.clone());
        Ok(module)
    }

    /// Injects every registered bridge into `context`, in registration
    /// order: resolve (cached), permission-check the bare bridge name,
    /// `engine.register_module`, then `bridge.init`. Auto-imports are
    /// applied last.
    ///
    /// # Errors
    ///
    /// `Permission` for a bridge whose bare name is outside
    /// `permissions.module_allow_list`; otherwise whatever `get_module`,
    /// `register_module` or `bridge.init` returns.
    pub fn inject(
        &self,
        engine: &dyn ScriptEngine,
        engine_context: EngineContextId,
        permissions: &SecurityPermissions,
    ) -> Result<(), ScriptError> {
        let bridges = self.bridges.read().clone();
        for bridge in &bridges {
            if !permissions.module_allowed(bridge.name()) {
                return Err(ScriptError::for_field(
                    ScriptErrorCode::Permission,
                    bridge.name(),
                    format!("module '{}' is not in the allow-list for this context", bridge.name()),
                ));
            }
            let module = self.resolve(bridge)?;
            engine.register_module(engine_context, &module)?;
            bridge.init(engine_context)?;
        }
        for name in self.auto_imports.read().iter() {
            engine.import_module(engine_context, name)?;
        }
        Ok(())
    }
}
