//! ABOUTME: SerializedValue tree plus the persisted binary layout (§6): tag-byte values, length-prefixed strings
//! ABOUTME: Grounded on the teacher's CircularReferenceDetector, adapted to ScriptValue's already-acyclic ownership

use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::value::{ScriptObject, ScriptValue};

/// `ScriptValue` trees are owned end-to-end (a `Vec`/`ScriptObject` cannot
/// reference itself), so they cannot carry a true cycle the way an
/// engine-native table graph can. This bounds recursion depth instead,
/// which is the practical failure mode the teacher's cycle-tracking visit
/// stack exists to prevent - a runaway structure blowing the stack.
const MAX_DEPTH: usize = 200;

/// A recursively serialized value tree (§4.12). Primitives round-trip
/// exactly; functions, userdata and coroutines are not representable across
/// a snapshot boundary and serialize as `Placeholder`.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(Vec<u8>),
    Array(Vec<SerializedValue>),
    /// Ordered key/value list, preserving the insertion order of the
    /// `ScriptObject` it was built from.
    Object(Vec<(String, SerializedValue)>),
    /// Stands in for a value that has no representation outside its owning
    /// engine. `kind` is the `ScriptValue::type_name()` it replaced.
    Placeholder { kind: &'static str },
}

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_NUM: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_ARR: u8 = 5;
const TAG_OBJ: u8 = 6;
const TAG_PLACEHOLDER: u8 = 7;

fn truncated() -> ScriptError {
    ScriptError::new(ScriptErrorCode::Type, "truncated or corrupt snapshot data")
}

/// Recursively converts a live `ScriptValue` into its serialized form.
///
/// # Errors
///
/// `Range` if nesting exceeds the depth guard.
pub fn serialize_value(value: &ScriptValue, depth: usize, path: &str) -> Result<SerializedValue, ScriptError> {
    if depth > MAX_DEPTH {
        return Err(ScriptError::for_field(
            ScriptErrorCode::Range,
            path,
            format!("snapshot nesting exceeded {MAX_DEPTH} levels at '{path}'"),
        ));
    }
    Ok(match value {
        ScriptValue::Nil => SerializedValue::Nil,
        ScriptValue::Boolean(b) => SerializedValue::Boolean(*b),
        ScriptValue::Integer(n) => SerializedValue::Integer(*n),
        ScriptValue::Number(n) => SerializedValue::Number(*n),
        ScriptValue::String(bytes) => SerializedValue::String(bytes.clone()),
        ScriptValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(serialize_value(item, depth + 1, &format!("{path}[{i}]"))?);
            }
            SerializedValue::Array(out)
        }
        ScriptValue::Object(obj) => {
            let mut out = Vec::with_capacity(obj.len());
            for (k, v) in obj.iter() {
                out.push((k.to_string(), serialize_value(v, depth + 1, &format!("{path}.{k}"))?));
            }
            SerializedValue::Object(out)
        }
        ScriptValue::Function(_) => SerializedValue::Placeholder { kind: "function" },
        ScriptValue::UserData(_) => SerializedValue::Placeholder { kind: "userdata" },
    })
}

/// Recursively converts a serialized tree back into a live `ScriptValue`.
/// A `Placeholder` restores as `Nil`; its path is appended to `non_restored`
/// so the caller can report it (§4.12 partial restorability).
pub fn deserialize_value(serialized: &SerializedValue, path: &str, non_restored: &mut Vec<String>) -> ScriptValue {
    match serialized {
        SerializedValue::Nil => ScriptValue::Nil,
        SerializedValue::Boolean(b) => ScriptValue::Boolean(*b),
        SerializedValue::Integer(n) => ScriptValue::Integer(*n),
        SerializedValue::Number(n) => ScriptValue::Number(*n),
        SerializedValue::String(bytes) => ScriptValue::String(bytes.clone()),
        SerializedValue::Array(items) => ScriptValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| deserialize_value(item, &format!("{path}[{i}]"), non_restored))
                .collect(),
        ),
        SerializedValue::Object(fields) => {
            let mut obj = ScriptObject::new();
            for (k, v) in fields {
                obj.insert(k.clone(), deserialize_value(v, &format!("{path}.{k}"), non_restored));
            }
            ScriptValue::Object(obj)
        }
        SerializedValue::Placeholder { .. } => {
            non_restored.push(path.to_string());
            ScriptValue::Nil
        }
    }
}

pub(crate) fn write_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

pub(crate) fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, ScriptError> {
    let slice = bytes.get(*pos..*pos + 4).ok_or_else(truncated)?;
    *pos += 4;
    Ok(u32::from_le_bytes(slice.try_into().expect("length checked above")))
}

pub(crate) fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64, ScriptError> {
    let slice = bytes.get(*pos..*pos + 8).ok_or_else(truncated)?;
    *pos += 8;
    Ok(u64::from_le_bytes(slice.try_into().expect("length checked above")))
}

fn read_i64(bytes: &[u8], pos: &mut usize) -> Result<i64, ScriptError> {
    Ok(read_u64(bytes, pos)? as i64)
}

fn read_f64(bytes: &[u8], pos: &mut usize) -> Result<f64, ScriptError> {
    Ok(f64::from_bits(read_u64(bytes, pos)?))
}

fn read_bytes(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>, ScriptError> {
    let len = read_u32(bytes, pos)? as usize;
    let slice = bytes.get(*pos..*pos + len).ok_or_else(truncated)?;
    *pos += len;
    Ok(slice.to_vec())
}

pub(crate) fn read_string(bytes: &[u8], pos: &mut usize) -> Result<String, ScriptError> {
    String::from_utf8(read_bytes(bytes, pos)?).map_err(|_| truncated())
}

/// Tag byte then payload per variant (§6).
pub fn encode_value(value: &SerializedValue, out: &mut Vec<u8>) {
    match value {
        SerializedValue::Nil => out.push(TAG_NIL),
        SerializedValue::Boolean(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        SerializedValue::Integer(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        SerializedValue::Number(n) => {
            out.push(TAG_NUM);
            out.extend_from_slice(&n.to_bits().to_le_bytes());
        }
        SerializedValue::String(bytes) => {
            out.push(TAG_STR);
            write_string(out, bytes);
        }
        SerializedValue::Array(items) => {
            out.push(TAG_ARR);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
        SerializedValue::Object(fields) => {
            out.push(TAG_OBJ);
            out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
            for (k, v) in fields {
                write_string(out, k.as_bytes());
                encode_value(v, out);
            }
        }
        SerializedValue::Placeholder { kind } => {
            out.push(TAG_PLACEHOLDER);
            write_string(out, kind.as_bytes());
        }
    }
}

/// Inverse of `encode_value`.
///
/// # Errors
///
/// `Type` if `bytes` is truncated or carries an unrecognized tag byte.
pub fn decode_value(bytes: &[u8], pos: &mut usize) -> Result<SerializedValue, ScriptError> {
    let tag = *bytes.get(*pos).ok_or_else(truncated)?;
    *pos += 1;
    Ok(match tag {
        TAG_NIL => SerializedValue::Nil,
        TAG_BOOL => {
            let b = *bytes.get(*pos).ok_or_else(truncated)?;
            *pos += 1;
            SerializedValue::Boolean(b != 0)
        }
        TAG_INT => SerializedValue::Integer(read_i64(bytes, pos)?),
        TAG_NUM => SerializedValue::Number(read_f64(bytes, pos)?),
        TAG_STR => SerializedValue::String(read_bytes(bytes, pos)?),
        TAG_ARR => {
            let count = read_u32(bytes, pos)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(bytes, pos)?);
            }
            SerializedValue::Array(items)
        }
        TAG_OBJ => {
            let count = read_u32(bytes, pos)?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key = read_string(bytes, pos)?;
                let value = decode_value(bytes, pos)?;
                fields.push((key, value));
            }
            SerializedValue::Object(fields)
        }
        TAG_PLACEHOLDER => {
            let kind = read_string(bytes, pos)?;
            let kind = match kind.as_str() {
                "function" => "function",
                "userdata" => "userdata",
                _ => "unknown",
            };
            SerializedValue::Placeholder { kind }
        }
        other => return Err(ScriptError::new(ScriptErrorCode::Type, format!("unrecognized snapshot value tag {other}"))),
    })
}

/// Encodes an ordered global-name/value list as `u32 count` followed by
/// `(string key, tagged value)` pairs.
pub fn encode_value_tree(entries: &[(String, SerializedValue)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, value) in entries {
        write_string(&mut out, key.as_bytes());
        encode_value(value, &mut out);
    }
    out
}

/// Inverse of `encode_value_tree`.
///
/// # Errors
///
/// `Type` if `bytes` is truncated or carries a malformed entry.
pub fn decode_value_tree(bytes: &[u8], pos: &mut usize) -> Result<Vec<(String, SerializedValue)>, ScriptError> {
    let count = read_u32(bytes, pos)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_string(bytes, pos)?;
        let value = decode_value(bytes, pos)?;
        entries.push((key, value));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_primitive_variant() {
        let values = vec![
            SerializedValue::Nil,
            SerializedValue::Boolean(true),
            SerializedValue::Integer(-7),
            SerializedValue::Number(3.5),
            SerializedValue::String(b"hi".to_vec()),
            SerializedValue::Array(vec![SerializedValue::Integer(1), SerializedValue::Integer(2)]),
            SerializedValue::Object(vec![("x".to_string(), SerializedValue::Integer(1))]),
            SerializedValue::Placeholder { kind: "function" },
        ];
        for value in values {
            let mut bytes = Vec::new();
            encode_value(&value, &mut bytes);
            let mut pos = 0;
            let decoded = decode_value(&bytes, &mut pos).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(pos, bytes.len());
        }
    }

    #[test]
    fn function_value_serializes_as_placeholder_and_restores_as_nil() {
        let value = ScriptValue::Function(zigllms_core::value::ScriptFunction {
            owning_context: 1,
            context_generation: 0,
            engine_ref: 1,
        });
        let serialized = serialize_value(&value, 0, "f").unwrap();
        assert_eq!(serialized, SerializedValue::Placeholder { kind: "function" });

        let mut non_restored = Vec::new();
        let restored = deserialize_value(&serialized, "f", &mut non_restored);
        assert!(restored.values_equal(&ScriptValue::Nil));
        assert_eq!(non_restored, vec!["f".to_string()]);
    }

    #[test]
    fn truncated_buffer_errors_instead_of_panicking() {
        let err = decode_value(&[TAG_STR, 0xFF, 0xFF, 0xFF, 0xFF], &mut 0).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Type);
    }
}
