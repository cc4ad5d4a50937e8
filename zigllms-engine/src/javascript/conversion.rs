//! ABOUTME: ScriptValue <-> boa_engine::JsValue conversion
//! ABOUTME: Functions/userdata are out of scope for this engine (§4.1 "free in how they implement")

use boa_engine::object::builtins::JsArray;
use boa_engine::{Context, JsResult, JsValue};
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::value::{ScriptObject, ScriptValue};

/// Converts a `ScriptValue` into a `JsValue`.
///
/// # Errors
///
/// `Type` for `Function`/`UserData` — this engine only bridges the
/// JSON-representable subset of `ScriptValue`.
pub fn to_js_value(ctx: &mut Context<'_>, value: &ScriptValue) -> Result<JsValue, ScriptError> {
    Ok(match value {
        ScriptValue::Nil => JsValue::null(),
        ScriptValue::Boolean(b) => JsValue::from(*b),
        ScriptValue::Integer(n) => JsValue::from(*n as f64),
        ScriptValue::Number(n) => JsValue::from(*n),
        ScriptValue::String(bytes) => JsValue::from(String::from_utf8_lossy(bytes).into_owned()),
        ScriptValue::Array(items) => {
            let array = JsArray::new(ctx);
            for item in items {
                array
                    .push(to_js_value(ctx, item)?, ctx)
                    .map_err(|e| js_error(&e, ctx))?;
            }
            array.into()
        }
        ScriptValue::Object(obj) => {
            let target = boa_engine::object::JsObject::with_object_proto(ctx.intrinsics());
            for (key, item) in obj.iter() {
                target
                    .set(boa_engine::js_string!(key), to_js_value(ctx, item)?, true, ctx)
                    .map_err(|e| js_error(&e, ctx))?;
            }
            JsValue::from(target)
        }
        ScriptValue::Function(_) | ScriptValue::UserData(_) => {
            return Err(ScriptError::new(
                ScriptErrorCode::Type,
                format!("{} values cannot cross into the javascript engine", value.type_name()),
            ))
        }
    })
}

/// Converts a `JsValue` back into a `ScriptValue`.
///
/// # Errors
///
/// `Type` for a callable or a value whose own-property enumeration fails.
pub fn from_js_value(ctx: &mut Context<'_>, value: &JsValue) -> Result<ScriptValue, ScriptError> {
    Ok(match value {
        JsValue::Null | JsValue::Undefined => ScriptValue::Nil,
        JsValue::Boolean(b) => ScriptValue::Boolean(*b),
        JsValue::Rational(n) => ScriptValue::Number(*n),
        JsValue::Integer(n) => ScriptValue::Integer(i64::from(*n)),
        JsValue::String(s) => ScriptValue::string(s.to_std_string_escaped()),
        JsValue::Object(obj) => {
            if obj.is_callable() {
                return Err(ScriptError::new(
                    ScriptErrorCode::Type,
                    "javascript functions cannot be bridged to ScriptValue by this engine",
                ));
            }
            if let Some(array) = JsArray::from_object(obj.clone()) {
                let len = array.length(ctx).map_err(|e| js_error(&e, ctx))?;
                let mut items = Vec::with_capacity(len as usize);
                for idx in 0..len {
                    let item = array.get(idx, ctx).map_err(|e| js_error(&e, ctx))?;
                    items.push(from_js_value(ctx, &item)?);
                }
                ScriptValue::Array(items)
            } else {
                let mut out = ScriptObject::new();
                let keys = obj.own_property_keys(ctx).map_err(|e| js_error(&e, ctx))?;
                for key in keys {
                    if let Some(name) = key.as_string() {
                        let item = obj.get(key.clone(), ctx).map_err(|e| js_error(&e, ctx))?;
                        out.insert(name.to_std_string_escaped(), from_js_value(ctx, &item)?);
                    }
                }
                ScriptValue::Object(out)
            }
        }
        _ => {
            return Err(ScriptError::new(
                ScriptErrorCode::Type,
                "javascript value has no ScriptValue projection",
            ))
        }
    })
}

fn js_error(err: &boa_engine::JsError, ctx: &mut Context<'_>) -> ScriptError {
    ScriptError::new(ScriptErrorCode::Runtime, err.to_opaque(ctx).display().to_string())
}

/// Convenience used by callers that already have a fallible boa call.
pub fn map_js_result<T>(result: JsResult<T>, ctx: &mut Context<'_>) -> Result<T, ScriptError> {
    result.map_err(|e| js_error(&e, ctx))
}
