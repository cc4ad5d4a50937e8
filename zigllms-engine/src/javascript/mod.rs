//! ABOUTME: JavaScript (ES2020-subset) ScriptEngine implementation, feature-gated behind `javascript`

mod conversion;
mod engine;

pub use engine::JsScriptEngine;
