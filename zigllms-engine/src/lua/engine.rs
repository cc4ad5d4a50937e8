//! ABOUTME: LuaScriptEngine - mlua-backed ScriptEngine, one mlua::Lua per EngineContextId
//! ABOUTME: Grounded on the teacher's LuaEngine (lua/engine.rs): Mutex-wrapped Lua, `unsafe impl Send/Sync` (§4.3)

use crate::engine::{EngineContextId, EngineFeatures, ScriptEngine, StackTrace};
use crate::lua::conversion::{from_lua_value, to_lua_value};
use crate::lua::registry::LuaHandleRegistry;
use crate::permissions::ResourceLimits;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::module::ScriptModule;
use zigllms_core::value::ScriptValue;

/// Marks a `RuntimeError` raised from inside the instruction hook so
/// `classify_lua_error` reclassifies it as `Timeout` rather than `Runtime`.
const TIMEOUT_SENTINEL: &str = "zigllms:timeout-budget-exhausted";

struct LuaContextState {
    lua: mlua::Lua,
    handles: LuaHandleRegistry,
    registered_modules: HashSet<String>,
    last_error: Option<ScriptError>,
    /// 0 = unlimited; mirrors `ResourceLimits::max_execution_time_ms`.
    max_execution_time_ms: u64,
    /// `ResourceLimits::hook_stride`, applied each time the timeout hook is
    /// (re-)armed.
    hook_stride: u32,
}

/// Lua 5.4 engine backend. One `mlua::Lua` instance per `EngineContextId`,
/// guarded by its own mutex so contexts never contend with each other.
///
/// mlua's `Lua` is only `Send`/`Sync` with the `send` feature (enabled at
/// the workspace level); holding every instance behind a `Mutex` regardless
/// keeps the single-thread-at-a-time execution model explicit in the type.
pub struct LuaScriptEngine {
    contexts: DashMap<EngineContextId, Mutex<LuaContextState>>,
    next_id: AtomicU64,
}

impl Default for LuaScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LuaScriptEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn engine_features() -> EngineFeatures {
        EngineFeatures {
            async_support: true, // via coroutines
            debugging: false,
            sandboxing: true,
            hot_reload: false,
            native_json: false,
            native_regex: false,
        }
    }

    fn with_context<R>(
        &self,
        context: EngineContextId,
        f: impl FnOnce(&mut LuaContextState) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        let entry = self
            .contexts
            .get(&context)
            .ok_or_else(|| ScriptError::new(ScriptErrorCode::Reference, format!("unknown lua context: {context}")))?;
        let mut state = entry.lock();
        f(&mut state)
    }

    fn classify_lua_error(err: &mlua::Error) -> ScriptErrorCode {
        if Self::is_timeout_sentinel(err) {
            return ScriptErrorCode::Timeout;
        }
        match err {
            mlua::Error::SyntaxError { .. } => ScriptErrorCode::Syntax,
            mlua::Error::RuntimeError(_) | mlua::Error::CallbackError { .. } => ScriptErrorCode::Runtime,
            mlua::Error::MemoryError(_) => ScriptErrorCode::Memory,
            mlua::Error::CoroutineInactive | mlua::Error::StackError => ScriptErrorCode::Runtime,
            _ => ScriptErrorCode::Unknown,
        }
    }

    /// The instruction hook raises a plain `RuntimeError` carrying
    /// `TIMEOUT_SENTINEL` (mlua has no dedicated hook-timeout variant); this
    /// unwraps a `CallbackError` wrapper to find it regardless of how many
    /// native call frames separate the hook firing from the error surfacing.
    fn is_timeout_sentinel(err: &mlua::Error) -> bool {
        match err {
            mlua::Error::RuntimeError(msg) => msg.contains(TIMEOUT_SENTINEL),
            mlua::Error::CallbackError { cause, .. } => Self::is_timeout_sentinel(cause.as_ref()),
            _ => false,
        }
    }

    /// (Re-)arms the per-call timeout hook with a deadline computed from
    /// *now* (§4.11: "an instruction hook decrements a per-tenant counter at
    /// a fixed stride and raises `Timeout` when exhausted"). A cap of `0`
    /// clears any previously-armed hook instead.
    fn arm_timeout_hook(lua: &mlua::Lua, max_execution_time_ms: u64, hook_stride: u32) {
        if max_execution_time_ms == 0 {
            lua.remove_hook();
            return;
        }
        let deadline = Instant::now() + Duration::from_millis(max_execution_time_ms);
        let triggers = mlua::HookTriggers::every_nth_instruction(hook_stride.max(1));
        lua.set_hook(triggers, move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError(TIMEOUT_SENTINEL.to_string()))
            } else {
                Ok(())
            }
        });
    }

    fn build_module_table<'lua>(lua: &'lua mlua::Lua, module: &ScriptModule, context: EngineContextId) -> mlua::Result<mlua::Table<'lua>> {
        let table = lua.create_table()?;
        for constant in &module.constants {
            let handles = LuaHandleRegistry::default();
            let value = to_lua_value(lua, &constant.value, context, &handles)
                .map_err(|e| mlua::Error::RuntimeError(e.message))?;
            table.set(constant.name.as_str(), value)?;
        }
        for function in &module.functions {
            let callback = function.callback.clone();
            let name = function.name.clone();
            // A call-scoped registry: function/userdata arguments resolve for the
            // duration of this call, matching the native callback contract that
            // args must not be retained beyond return without cloning (§6).
            let lua_fn = lua.create_function(move |lua, args: mlua::MultiValue| {
                let handles = LuaHandleRegistry::default();
                let mut script_args = Vec::with_capacity(args.len());
                for value in &args {
                    script_args.push(
                        from_lua_value(lua, value, context, &handles)
                            .map_err(|e| mlua::Error::RuntimeError(e.message.clone()))?,
                    );
                }
                let result = (callback)(context, &script_args).map_err(|e| mlua::Error::RuntimeError(e.message.clone()))?;
                to_lua_value(lua, &result, context, &handles).map_err(|e| mlua::Error::RuntimeError(e.message))
            })?;
            table.set(name.as_str(), lua_fn)?;
        }
        Ok(table)
    }
}

impl ScriptEngine for LuaScriptEngine {
    fn name(&self) -> &'static str {
        "lua"
    }

    fn features(&self) -> EngineFeatures {
        Self::engine_features()
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["lua"]
    }

    fn create_context(&self) -> Result<EngineContextId, ScriptError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lua = mlua::Lua::new();
        self.contexts.insert(
            id,
            Mutex::new(LuaContextState {
                lua,
                handles: LuaHandleRegistry::default(),
                registered_modules: HashSet::new(),
                last_error: None,
                max_execution_time_ms: 0,
                hook_stride: 1000,
            }),
        );
        Ok(id)
    }

    fn destroy_context(&self, context: EngineContextId) {
        if let Some((_, state)) = self.contexts.remove(&context) {
            let state = state.into_inner();
            state.handles.clear(&state.lua);
        }
    }

    fn load_script(&self, context: EngineContextId, source: &str, name: &str) -> Result<(), ScriptError> {
        self.with_context(context, |state| {
            state
                .lua
                .load(source)
                .set_name(name)
                .exec()
                .map_err(|e| ScriptError::new(Self::classify_lua_error(&e), e.to_string()))
        })
    }

    fn load_file(&self, context: EngineContextId, path: &std::path::Path) -> Result<(), ScriptError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::new(ScriptErrorCode::Module, format!("could not read {}: {e}", path.display())))?;
        let name = path.to_string_lossy().into_owned();
        self.load_script(context, &source, &name)
    }

    fn execute_script(&self, context: EngineContextId, source: &str) -> Result<ScriptValue, ScriptError> {
        self.with_context(context, |state| {
            Self::arm_timeout_hook(&state.lua, state.max_execution_time_ms, state.hook_stride);
            let result: mlua::Result<mlua::Value> = state.lua.load(source).eval();
            match result {
                Ok(value) => from_lua_value(&state.lua, &value, context, &state.handles),
                Err(e) => {
                    let err = ScriptError::new(Self::classify_lua_error(&e), e.to_string()).with_native_text(e.to_string());
                    state.last_error = Some(err.clone());
                    Err(err)
                }
            }
        })
    }

    fn execute_function(&self, context: EngineContextId, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        self.with_context(context, |state| {
            Self::arm_timeout_hook(&state.lua, state.max_execution_time_ms, state.hook_stride);
            let globals = state.lua.globals();
            let function: mlua::Function = globals
                .get(name)
                .map_err(|_| ScriptError::new(ScriptErrorCode::Reference, format!("unbound function: {name}")))?;
            let mut lua_args = Vec::with_capacity(args.len());
            for arg in args {
                lua_args.push(to_lua_value(&state.lua, arg, context, &state.handles)?);
            }
            let result: mlua::Value = function
                .call(mlua::MultiValue::from_iter(lua_args))
                .map_err(|e| ScriptError::new(Self::classify_lua_error(&e), e.to_string()))?;
            from_lua_value(&state.lua, &result, context, &state.handles)
        })
    }

    fn register_module(&self, context: EngineContextId, module: &ScriptModule) -> Result<(), ScriptError> {
        self.with_context(context, |state| {
            let table = Self::build_module_table(&state.lua, module, context)
                .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            set_qualified_global(&state.lua, &module.name, table)
                .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            state.registered_modules.insert(module.name.clone());
            Ok(())
        })
    }

    fn import_module(&self, context: EngineContextId, name: &str) -> Result<(), ScriptError> {
        self.with_context(context, |state| {
            if state.registered_modules.contains(name) {
                Ok(())
            } else {
                Err(ScriptError::new(ScriptErrorCode::Module, format!("module not registered: {name}")))
            }
        })
    }

    fn set_global(&self, context: EngineContextId, name: &str, value: &ScriptValue) -> Result<(), ScriptError> {
        self.with_context(context, |state| {
            let lua_value = to_lua_value(&state.lua, value, context, &state.handles)?;
            state
                .lua
                .globals()
                .set(name, lua_value)
                .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))
        })
    }

    fn get_global(&self, context: EngineContextId, name: &str) -> Result<ScriptValue, ScriptError> {
        self.with_context(context, |state| {
            let value: mlua::Value = state
                .lua
                .globals()
                .get(name)
                .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            if matches!(value, mlua::Value::Nil) {
                return Err(ScriptError::new(ScriptErrorCode::Reference, format!("unbound global: {name}")));
            }
            from_lua_value(&state.lua, &value, context, &state.handles)
        })
    }

    fn last_error(&self, context: EngineContextId) -> Option<ScriptError> {
        self.with_context(context, |state| Ok(state.last_error.clone())).ok().flatten()
    }

    fn clear_errors(&self, context: EngineContextId) {
        let _ = self.with_context(context, |state| {
            state.last_error = None;
            Ok(())
        });
    }

    fn collect_garbage(&self, context: EngineContextId) {
        let _ = self.with_context(context, |state| {
            state.lua.gc_collect().map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))
        });
    }

    fn memory_usage(&self, context: EngineContextId) -> u64 {
        self.with_context(context, |state| Ok(state.lua.used_memory() as u64)).unwrap_or(0)
    }

    /// Installs the real enforcement §4.8/§4.11 describe: `Lua::set_memory_limit`
    /// for the memory cap (an over-cap allocation inside the VM then fails
    /// with `mlua::Error::MemoryError`, already mapped to `Memory` by
    /// `classify_lua_error`) and the stride/deadline the timeout hook
    /// (armed per call by `execute_script`/`execute_function`) will use.
    fn configure_limits(&self, context: EngineContextId, limits: &ResourceLimits) -> Result<(), ScriptError> {
        self.with_context(context, |state| {
            state.lua.set_memory_limit(limits.max_memory_bytes as usize);
            state.max_execution_time_ms = limits.max_execution_time_ms;
            state.hook_stride = limits.hook_stride;
            Ok(())
        })
    }

    fn stack_trace(&self, context: EngineContextId) -> Result<StackTrace, ScriptError> {
        self.with_context(context, |_state| Ok(StackTrace::default()))
    }
}

fn set_qualified_global<'lua>(lua: &'lua mlua::Lua, qualified_name: &str, value: mlua::Table<'lua>) -> mlua::Result<()> {
    let mut segments: Vec<&str> = qualified_name.split('.').collect();
    let leaf = segments.pop().expect("split always yields at least one segment");
    let globals = lua.globals();
    let mut parent = globals;
    for segment in segments {
        let next: mlua::Value = parent.get(segment)?;
        parent = match next {
            mlua::Value::Table(t) => t,
            mlua::Value::Nil => {
                let t = lua.create_table()?;
                parent.set(segment, t.clone())?;
                t
            }
            _ => return Err(mlua::Error::RuntimeError(format!("'{segment}' is already bound to a non-table value"))),
        };
    }
    parent.set(leaf, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_limits_enforces_memory_cap() {
        let engine = LuaScriptEngine::new();
        let ctx = engine.create_context().unwrap();
        engine
            .configure_limits(
                ctx,
                &ResourceLimits {
                    max_memory_bytes: 64 * 1024,
                    ..ResourceLimits::default()
                },
            )
            .unwrap();
        let err = engine
            .execute_script(ctx, "local t = {} for i = 1, 200000 do t[i] = string.rep('x', 64) end return #t")
            .unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Memory);
    }

    #[test]
    fn configure_limits_arms_timeout_hook_for_runaway_loop() {
        let engine = LuaScriptEngine::new();
        let ctx = engine.create_context().unwrap();
        engine
            .configure_limits(
                ctx,
                &ResourceLimits {
                    max_execution_time_ms: 30,
                    hook_stride: 1,
                    ..ResourceLimits::default()
                },
            )
            .unwrap();
        let err = engine.execute_script(ctx, "while true do end").unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Timeout);
    }

    #[test]
    fn zero_execution_time_limit_removes_any_armed_hook() {
        let engine = LuaScriptEngine::new();
        let ctx = engine.create_context().unwrap();
        engine
            .configure_limits(
                ctx,
                &ResourceLimits {
                    max_execution_time_ms: 20,
                    hook_stride: 1,
                    ..ResourceLimits::default()
                },
            )
            .unwrap();
        engine
            .configure_limits(
                ctx,
                &ResourceLimits {
                    max_execution_time_ms: 0,
                    ..ResourceLimits::default()
                },
            )
            .unwrap();
        let result = engine.execute_script(ctx, "local sum = 0 for i = 1, 1000 do sum = sum + i end return sum");
        assert!(result.is_ok());
    }
}
