//! ABOUTME: Polymorphic script engine interface, per-context lifecycle, registry and module system
//! ABOUTME: Engines are feature-gated: enable `lua` and/or `javascript` to pull in a concrete implementation

pub mod context;
pub mod engine;
pub mod modules;
pub mod permissions;

#[cfg(feature = "lua")]
pub mod lua;

#[cfg(feature = "javascript")]
pub mod javascript;

pub use context::{ContextState, EngineState, ScriptContext};
pub use engine::{EngineContextId, EngineFactory, EngineFeatures, EngineInfo, EngineRegistry, ScriptEngine, StackTrace};
pub use modules::ModuleRegistry;
pub use permissions::{ExecutionStats, ResourceLimits, SecurityPermissions};
