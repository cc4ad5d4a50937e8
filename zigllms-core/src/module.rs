//! ABOUTME: ScriptModule description and the APIBridge contract external subsystems implement
//! ABOUTME: Grounded on the teacher's GlobalObject trait (llmspell-bridge/src/globals/types.rs)

use crate::error::ScriptError;
use crate::value::ScriptValue;
use std::sync::Arc;

/// A module function callback: `(context-opaque args) -> ScriptValue`.
///
/// The `ctx` parameter is an opaque `u64` context id rather than a concrete
/// `ScriptContext` reference so this crate does not depend on `zigllms-engine`;
/// callbacks that need context services look them up through whatever
/// side-channel the engine crate wires in (see `zigllms-engine::context`).
pub type NativeCallback =
    Arc<dyn Fn(u64, &[ScriptValue]) -> Result<ScriptValue, ScriptError> + Send + Sync>;

/// Arity a module function accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic,
}

/// One function exposed by a `ScriptModule`.
#[derive(Clone)]
pub struct ModuleFunction {
    pub name: String,
    pub arity: Arity,
    pub callback: NativeCallback,
    pub description: String,
}

impl std::fmt::Debug for ModuleFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("description", &self.description)
            .finish()
    }
}

/// One constant exposed by a `ScriptModule`.
#[derive(Debug, Clone)]
pub struct ModuleConstant {
    pub name: String,
    pub value: ScriptValue,
    pub description: String,
}

/// A fully described module: functions plus constants, registered into a
/// `ScriptContext` by name. The context owns the string keys; the module
/// body itself may be shared/cached across contexts.
#[derive(Debug, Clone)]
pub struct ScriptModule {
    pub name: String,
    pub version: String,
    pub description: String,
    pub functions: Vec<ModuleFunction>,
    pub constants: Vec<ModuleConstant>,
}

impl ScriptModule {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            functions: Vec::new(),
            constants: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn function(
        &mut self,
        name: impl Into<String>,
        arity: Arity,
        description: impl Into<String>,
        callback: NativeCallback,
    ) -> &mut Self {
        self.functions.push(ModuleFunction {
            name: name.into(),
            arity,
            callback,
            description: description.into(),
        });
        self
    }

    pub fn constant(&mut self, name: impl Into<String>, value: ScriptValue, description: impl Into<String>) -> &mut Self {
        self.constants.push(ModuleConstant { name: name.into(), value, description: description.into() });
        self
    }
}

/// A per-subsystem module provider that exposes host capabilities to
/// scripts. The core invokes `get_module` at most once per cache lifetime
/// and `init` once per context, matching the teacher's `GlobalObject`
/// (`initialize` / `inject_*` / `cleanup`) contract.
pub trait APIBridge: Send + Sync {
    /// Stable name used to resolve this bridge's module (e.g. `"agent"`
    /// resolves to the script-visible `zigllms.agent` module).
    fn name(&self) -> &str;

    /// Builds the fully described module. Called at most once per cache
    /// lifetime; the returned `ScriptModule` may be shared across contexts.
    ///
    /// # Errors
    ///
    /// Returns an error if the module description cannot be constructed.
    fn get_module(&self) -> Result<ScriptModule, ScriptError>;

    /// Wires any native bindings (callbacks already captured in the module's
    /// functions are enough for most bridges; `init` exists for bridges that
    /// need to register engine-specific userdata types). Called once per
    /// context.
    fn init(&self, _context_id: u64) -> Result<(), ScriptError> {
        Ok(())
    }

    fn deinit(&self, _context_id: u64) {}
}
