//! ABOUTME: ScriptValue, the universal tagged value bridged into every embedded engine
//! ABOUTME: Deep clone/equality, JSON interop, and the function/userdata handle types

use crate::error::{ScriptError, ScriptErrorCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque identifier for the `ScriptContext` that owns a `ScriptFunction` or a
/// per-state weak-reference table. Contexts hand these out; a handle is only
/// valid while its owning context's generation counter has not advanced past
/// the value stamped into the handle (see `ScriptFunction::is_valid`).
pub type ContextId = u64;

static NEXT_USERDATA_ID: AtomicU64 = AtomicU64::new(1);

/// The universal tagged value used across the host/script boundary.
///
/// Containers own their contents: cloning an `Array` or `Object` recursively
/// clones every element, while `Function` and `UserData` are identity handles
/// — cloning copies the handle, not the underlying engine-side object.
#[derive(Debug, Clone)]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    /// 64-bit signed integer. Kept distinct from `Number` so that integers
    /// round-trip through the bridge without precision loss.
    Integer(i64),
    /// 64-bit float.
    Number(f64),
    /// Owned byte sequence; may contain interior nulls, so this is not `String`.
    String(Vec<u8>),
    Array(Vec<ScriptValue>),
    Object(ScriptObject),
    /// Handle to a callable bound to an owning context; never copies the callee.
    Function(ScriptFunction),
    UserData(UserData),
}

impl ScriptValue {
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into().into_bytes())
    }

    /// Returns the string contents if this value is valid UTF-8 `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::UserData(_) => "userdata",
        }
    }

    /// Converts to a `serde_json::Value`. Integers and floats both become
    /// JSON numbers; functions and userdata have no JSON representation.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if the value (or a nested value) is a
    /// `Function` or `UserData`.
    pub fn to_json(&self) -> crate::Result<serde_json::Value> {
        Ok(match self {
            Self::Nil => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Integer(n) => serde_json::json!(n),
            Self::Number(n) => serde_json::json!(n),
            Self::String(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            Self::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.to_json()?);
                }
                serde_json::Value::Array(out)
            }
            Self::Object(obj) => {
                let mut map = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj.iter() {
                    map.insert(k.to_string(), v.to_json()?);
                }
                serde_json::Value::Object(map)
            }
            Self::Function(_) | Self::UserData(_) => {
                return Err(ScriptError::new(
                    ScriptErrorCode::Type,
                    format!("{} values cannot be converted to JSON", self.type_name()),
                ))
            }
        })
    }

    /// Converts from a `serde_json::Value`. Numbers that are exactly integral
    /// become `Integer`; all other numbers become `Number`. This is the
    /// documented silent-widening rule: re-serializing an `Integer` that came
    /// from JSON always normalizes it back to the same JSON number.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i)
                } else {
                    Self::Number(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Self::string(s.clone()),
            serde_json::Value::Array(arr) => Self::Array(arr.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(obj) => {
                let mut out = ScriptObject::new();
                for (k, v) in obj {
                    out.insert(k.clone(), Self::from_json(v));
                }
                Self::Object(out)
            }
        }
    }

    /// Deep, cycle-free copy. `Function` and `UserData` copy the handle only
    /// (they are identity-compared, not structurally compared), so the
    /// returned value shares no allocation with `self` for any container or
    /// string, but does share identity for functions/userdata — which is the
    /// whole point of those variants.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        match self {
            Self::Array(items) => Self::Array(items.iter().map(Self::deep_clone).collect()),
            Self::Object(obj) => {
                let mut out = ScriptObject::new();
                for (k, v) in obj.iter() {
                    out.insert(k.to_string(), v.deep_clone());
                }
                Self::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Structural equality for primitives/containers; identity for
    /// `Function`/`UserData`.
    #[must_use]
    pub fn values_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Integer(a), Self::Number(b)) | (Self::Number(b), Self::Integer(a)) => {
                (*a as f64) == *b
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.values_equal(y))
            }
            (Self::Object(a), Self::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|bv| v.values_equal(bv)))
            }
            (Self::Function(a), Self::Function(b)) => a.identity() == b.identity(),
            (Self::UserData(a), Self::UserData(b)) => a.identity() == b.identity(),
            _ => false,
        }
    }

    /// Converts a serializable host value into a `ScriptValue` via its JSON
    /// projection. Optionals map `None -> Nil`; records map to `Object`.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if `value` cannot be serialized to JSON.
    pub fn from_host<T: Serialize>(value: &T) -> crate::Result<Self> {
        let json = serde_json::to_value(value).map_err(|e| {
            ScriptError::new(ScriptErrorCode::Type, format!("host value not serializable: {e}"))
        })?;
        Ok(Self::from_json(&json))
    }

    /// Converts this value back into a host type `T`.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if the shape does not match `T`, including
    /// lossy numeric coercions the target type cannot represent.
    pub fn to_host<T: DeserializeOwned>(&self) -> crate::Result<T> {
        let json = self.to_json()?;
        serde_json::from_value(json)
            .map_err(|e| ScriptError::new(ScriptErrorCode::Type, format!("value does not match expected shape: {e}")))
    }
}

/// Insertion-order-preserving string-keyed map with unique keys, the
/// representation backing `ScriptValue::Object`.
#[derive(Debug, Clone, Default)]
pub struct ScriptObject {
    entries: Vec<(String, ScriptValue)>,
    index: std::collections::HashMap<String, usize>,
}

impl ScriptObject {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key, preserving first-seen order; re-inserting an existing
    /// key updates its value in place without moving its position.
    pub fn insert(&mut self, key: impl Into<String>, value: ScriptValue) {
        let key = key.into();
        if let Some(&idx) = self.index.get(&key) {
            self.entries[idx].1 = value;
        } else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, value));
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.index.get(key).map(|&idx| &self.entries[idx].1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScriptValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Non-owning handle to a function bound to an engine-side registry slot.
///
/// A `ScriptFunction` must not outlive its owning `ScriptContext`; callers
/// validate `context_generation` against the context's current generation
/// counter before every call so a stale handle fails fast instead of
/// dereferencing a freed engine slot.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub owning_context: ContextId,
    pub context_generation: u64,
    pub engine_ref: u64,
}

impl ScriptFunction {
    #[must_use]
    pub const fn identity(&self) -> (ContextId, u64) {
        (self.owning_context, self.engine_ref)
    }
}

/// Type tag identifying a userdata's registered Rust type, carried alongside
/// a version so a stale handle from a previous registration generation can be
/// rejected rather than transmuted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    pub type_id: std::any::TypeId,
    pub version: u32,
}

/// Header shared by full userdata allocations: type identity plus an
/// optional destructor run when the last reference is dropped.
pub struct UserDataHeader {
    pub tag: TypeTag,
    pub type_name: &'static str,
}

impl fmt::Debug for UserDataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDataHeader").field("type_name", &self.type_name).finish()
    }
}

struct FullUserDataInner {
    header: UserDataHeader,
    id: u64,
    data: Box<dyn Any + Send + Sync>,
}

/// Either a *light* userdata (a raw pointer + type tag with no lifetime —
/// the host vouches the pointee outlives every handle) or a *full* userdata
/// (an owned, reference-counted allocation with header and type version).
#[derive(Clone)]
pub enum UserData {
    Light { ptr: usize, tag: TypeTag },
    Full(Arc<FullUserDataInner>),
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Light { ptr, tag } => f
                .debug_struct("UserData::Light")
                .field("ptr", ptr)
                .field("tag", tag)
                .finish(),
            Self::Full(inner) => f
                .debug_struct("UserData::Full")
                .field("type_name", &inner.header.type_name)
                .field("id", &inner.id)
                .finish(),
        }
    }
}

impl UserData {
    /// Allocates a full userdata, pinning `value` behind an `Arc` so cloning
    /// the `ScriptValue` never duplicates the payload.
    pub fn new_full<T: Any + Send + Sync + 'static>(type_name: &'static str, version: u32, value: T) -> Self {
        let tag = TypeTag {
            type_id: std::any::TypeId::of::<T>(),
            version,
        };
        Self::Full(Arc::new(FullUserDataInner {
            header: UserDataHeader { tag, type_name },
            id: NEXT_USERDATA_ID.fetch_add(1, Ordering::Relaxed),
            data: Box::new(value),
        }))
    }

    #[must_use]
    pub fn new_light(ptr: usize, type_id: std::any::TypeId, version: u32) -> Self {
        Self::Light {
            ptr,
            tag: TypeTag { type_id, version },
        }
    }

    /// Downcasts a full userdata's payload. Returns `None` for light
    /// userdata, a type mismatch, or a stale `version`.
    #[must_use]
    pub fn downcast_ref<T: Any + Send + Sync + 'static>(&self, version: u32) -> Option<&T> {
        match self {
            Self::Full(inner) => {
                if inner.header.tag.type_id == std::any::TypeId::of::<T>()
                    && inner.header.tag.version == version
                {
                    inner.data.downcast_ref::<T>()
                } else {
                    None
                }
            }
            Self::Light { .. } => None,
        }
    }

    #[must_use]
    pub fn identity(&self) -> usize {
        match self {
            Self::Light { ptr, .. } => *ptr,
            Self::Full(inner) => Arc::as_ptr(inner).cast::<()>() as usize,
        }
    }
}
