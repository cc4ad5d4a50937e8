//! ABOUTME: ScriptValue <-> mlua::Value conversion, including registry-backed function/userdata handles
//! ABOUTME: Grounded on the teacher's lua_value_to_json (lua/engine.rs) generalized to the full ScriptValue bridge (§4.1, §9)

use crate::engine::EngineContextId;
use crate::lua::registry::LuaHandleRegistry;
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::value::{ScriptFunction, ScriptObject, ScriptValue, UserData};

/// Converts a `ScriptValue` into an `mlua::Value` bound to `lua`. `Function`
/// and `UserData` round-trip only when they originated from this same
/// `context` via `handles` (stamped `owning_context`/`engine_ref`); a handle
/// from a different context is rejected rather than silently producing a
/// dangling reference.
///
/// # Errors
///
/// `Type` if a `Function`/`UserData` handle cannot be resolved in `handles`,
/// or if `lua` fails to allocate a table/string.
pub fn to_lua_value<'lua>(
    lua: &'lua mlua::Lua,
    value: &ScriptValue,
    context: EngineContextId,
    handles: &LuaHandleRegistry,
) -> Result<mlua::Value<'lua>, ScriptError> {
    let mapped = match value {
        ScriptValue::Nil => mlua::Value::Nil,
        ScriptValue::Boolean(b) => mlua::Value::Boolean(*b),
        ScriptValue::Integer(n) => mlua::Value::Integer(*n),
        ScriptValue::Number(n) => mlua::Value::Number(*n),
        ScriptValue::String(bytes) => mlua::Value::String(
            lua.create_string(bytes)
                .map_err(|e| ScriptError::new(ScriptErrorCode::Memory, format!("could not allocate lua string: {e}")))?,
        ),
        ScriptValue::Array(items) => {
            let table = lua
                .create_table()
                .map_err(|e| ScriptError::new(ScriptErrorCode::Memory, format!("could not allocate lua table: {e}")))?;
            for (idx, item) in items.iter().enumerate() {
                table
                    .set(idx + 1, to_lua_value(lua, item, context, handles)?)
                    .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            }
            mlua::Value::Table(table)
        }
        ScriptValue::Object(obj) => {
            let table = lua
                .create_table()
                .map_err(|e| ScriptError::new(ScriptErrorCode::Memory, format!("could not allocate lua table: {e}")))?;
            for (key, item) in obj.iter() {
                table
                    .set(key, to_lua_value(lua, item, context, handles)?)
                    .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            }
            mlua::Value::Table(table)
        }
        ScriptValue::Function(handle) => {
            if handle.owning_context != context {
                return Err(ScriptError::new(
                    ScriptErrorCode::Type,
                    "function handle does not belong to this context",
                ));
            }
            mlua::Value::Function(
                handles
                    .resolve_function(lua, handle.engine_ref)
                    .ok_or_else(|| ScriptError::new(ScriptErrorCode::Reference, "stale function handle"))?,
            )
        }
        ScriptValue::UserData(ud) => match ud {
            UserData::Full(_) => mlua::Value::UserData(
                handles
                    .resolve_userdata(lua, ud.identity() as u64)
                    .ok_or_else(|| ScriptError::new(ScriptErrorCode::Reference, "stale userdata handle"))?,
            ),
            UserData::Light { .. } => {
                return Err(ScriptError::new(ScriptErrorCode::Type, "light userdata cannot cross into lua"))
            }
        },
    };
    Ok(mapped)
}

/// Converts an `mlua::Value` back into a `ScriptValue`. A Lua table is
/// treated as an `Array` when it is a contiguous 1-based integer sequence
/// with no other keys, and as an `Object` otherwise. Functions and userdata
/// are registered in `handles` under a fresh `engine_ref` and returned as
/// handles bound to `context`.
///
/// # Errors
///
/// `Type` for a Lua value with no `ScriptValue` projection (e.g. `Thread`).
pub fn from_lua_value(
    lua: &mlua::Lua,
    value: &mlua::Value<'_>,
    context: EngineContextId,
    handles: &LuaHandleRegistry,
) -> Result<ScriptValue, ScriptError> {
    Ok(match value {
        mlua::Value::Nil => ScriptValue::Nil,
        mlua::Value::Boolean(b) => ScriptValue::Boolean(*b),
        mlua::Value::Integer(n) => ScriptValue::Integer(*n),
        mlua::Value::Number(n) => ScriptValue::Number(*n),
        mlua::Value::String(s) => ScriptValue::String(s.as_bytes().to_vec()),
        mlua::Value::Table(table) => {
            if is_array_like(table) {
                let mut items = Vec::new();
                for pair in table.clone().sequence_values::<mlua::Value>() {
                    let item = pair.map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
                    items.push(from_lua_value(lua, &item, context, handles)?);
                }
                ScriptValue::Array(items)
            } else {
                let mut obj = ScriptObject::new();
                for pair in table.clone().pairs::<String, mlua::Value>() {
                    let (key, item) = pair.map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
                    obj.insert(key, from_lua_value(lua, &item, context, handles)?);
                }
                ScriptValue::Object(obj)
            }
        }
        mlua::Value::Function(f) => {
            let engine_ref = handles
                .register_function(lua, f.clone())
                .map_err(|e| ScriptError::new(ScriptErrorCode::Memory, format!("could not register lua function: {e}")))?;
            ScriptValue::Function(ScriptFunction { owning_context: context, context_generation: 0, engine_ref })
        }
        mlua::Value::UserData(ud) => {
            let engine_ref = handles
                .register_userdata(lua, ud.clone())
                .map_err(|e| ScriptError::new(ScriptErrorCode::Memory, format!("could not register lua userdata: {e}")))?;
            ScriptValue::UserData(UserData::new_light(engine_ref as usize, std::any::TypeId::of::<()>(), 0))
        }
        other => {
            return Err(ScriptError::new(
                ScriptErrorCode::Type,
                format!("lua value '{}' has no ScriptValue projection", other.type_name()),
            ))
        }
    })
}

fn is_array_like(table: &mlua::Table<'_>) -> bool {
    let len = table.raw_len();
    if len == 0 {
        return table.pairs::<mlua::Value, mlua::Value>().next().is_none();
    }
    table.clone().pairs::<mlua::Value, mlua::Value>().count() as i64 == len
}
