//! ABOUTME: Core value, error and host-record types shared by every engine, context and bridge
//! ABOUTME: Foundation layer for the universal scripting runtime core

pub mod config;
pub mod error;
pub mod marshal;
pub mod module;
pub mod value;

pub use error::{ScriptError, ScriptErrorCode, SourceLocation, StackFrame};
pub use module::{APIBridge, ModuleConstant, ModuleFunction, NativeCallback, ScriptModule};
pub use value::{ScriptFunction, ScriptObject, ScriptValue, UserData, UserDataHeader};

/// Convenience result alias used throughout the core crates.
pub type Result<T> = std::result::Result<T, ScriptError>;
