//! ABOUTME: Lua 5.4 ScriptEngine implementation, feature-gated behind `lua`

mod conversion;
mod engine;
mod registry;

pub use engine::LuaScriptEngine;
