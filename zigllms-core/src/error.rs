//! ABOUTME: ScriptError taxonomy, source locations and stack frames
//! ABOUTME: Every failure surfaced by the core carries a code from this fixed taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed error taxonomy. Engine-specific numeric codes are folded into one
/// of these at the boundary so callers can match without knowing which
/// engine produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptErrorCode {
    Syntax,
    Runtime,
    Type,
    Reference,
    Range,
    Memory,
    Timeout,
    Permission,
    Module,
    Unknown,
}

impl fmt::Display for ScriptErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Syntax => "Syntax",
            Self::Runtime => "Runtime",
            Self::Type => "Type",
            Self::Reference => "Reference",
            Self::Range => "Range",
            Self::Memory => "Memory",
            Self::Timeout => "Timeout",
            Self::Permission => "Permission",
            Self::Module => "Module",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// A source position in script text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    #[must_use]
    pub const fn new(file: &'static str, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }
}

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function_name: String,
    pub location: Option<StackLocation>,
    pub is_native: bool,
}

/// Owned variant of `SourceLocation` suitable for stack frames built at
/// runtime from engine-reported strings rather than `&'static str` literals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A categorized script error with an optional source location, an
/// innermost-first stack trace, and optional engine-native diagnostic text.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{}", self.format())]
pub struct ScriptError {
    pub code: ScriptErrorCode,
    pub message: String,
    pub location: Option<StackLocation>,
    /// Innermost-first.
    pub frames: Vec<StackFrame>,
    pub native_text: Option<String>,
    /// Structured context (e.g. the offending field name for a `Type`
    /// error raised by the marshaler). Not rendered by `format()`; present
    /// in `to_json()` for programmatic inspection.
    pub context: Option<serde_json::Value>,
}

impl ScriptError {
    #[must_use]
    pub fn new(code: ScriptErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            location: None,
            frames: Vec::new(),
            native_text: None,
            context: None,
        }
    }

    /// Attaches structured context, e.g. `{"field": "temperature"}` for a
    /// marshaling failure.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Convenience for the common "missing/invalid field" marshaling case.
    #[must_use]
    pub fn for_field(code: ScriptErrorCode, field: &str, message: impl Into<String>) -> Self {
        Self::new(code, message).with_context(serde_json::json!({ "field": field }))
    }

    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.location = Some(StackLocation { file: file.into(), line, column });
        self
    }

    /// Pushes a frame; frames accumulate innermost-first, so the first call
    /// after construction should be the frame closest to the fault.
    pub fn push_frame(&mut self, frame: StackFrame) -> &mut Self {
        self.frames.push(frame);
        self
    }

    #[must_use]
    pub fn with_native_text(mut self, text: impl Into<String>) -> Self {
        self.native_text = Some(text.into());
        self
    }

    /// Deterministic multi-line rendering:
    /// `"<Code>: <message>"`, then `"    at <file>:<line>:<col>"` if a
    /// location is set, then `"Stack trace:"` followed by one line per frame.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = format!("{}: {}", self.code, self.message);
        if let Some(loc) = &self.location {
            out.push_str(&format!("\n    at {}:{}:{}", loc.file, loc.line, loc.column));
        }
        if !self.frames.is_empty() {
            out.push_str("\nStack trace:");
            for frame in &self.frames {
                if frame.is_native {
                    out.push_str(&format!("\n  at {} (native)", frame.function_name));
                } else if let Some(loc) = &frame.location {
                    out.push_str(&format!(
                        "\n  at {} ({}:{}:{})",
                        frame.function_name, loc.file, loc.line, loc.column
                    ));
                } else {
                    out.push_str(&format!("\n  at {}", frame.function_name));
                }
            }
        }
        out
    }

    /// Stable JSON form with every field present.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
