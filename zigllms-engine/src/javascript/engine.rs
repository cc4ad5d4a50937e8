//! ABOUTME: JsScriptEngine - boa_engine-backed ScriptEngine, one Context per EngineContextId
//! ABOUTME: Supplements the Lua-first teacher with the pack's boa_engine usage for a second language (§4.3)

use crate::engine::{EngineContextId, EngineFeatures, ScriptEngine, StackTrace};
use crate::javascript::conversion::{from_js_value, to_js_value};
use boa_engine::object::FunctionObjectBuilder;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsError, JsNativeError, JsValue, NativeFunction, Source};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::module::ScriptModule;
use zigllms_core::value::ScriptValue;

struct JsContextState {
    context: Context<'static>,
    registered_modules: HashSet<String>,
    last_error: Option<ScriptError>,
}

/// JavaScript (ES2020-subset) engine backend built on `boa_engine`. Scoped
/// to the JSON-representable subset of `ScriptValue`: functions and
/// userdata do not cross this boundary (see `javascript::conversion`).
pub struct JsScriptEngine {
    contexts: DashMap<EngineContextId, Mutex<JsContextState>>,
    next_id: AtomicU64,
}

impl Default for JsScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl JsScriptEngine {
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
            async_support: false,
            debugging: false,
            sandboxing: false,
            hot_reload: false,
            native_json: true,
            native_regex: true,
        }
    }

    fn with_context<R>(
        &self,
        context: EngineContextId,
        f: impl FnOnce(&mut JsContextState) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        let entry = self
            .contexts
            .get(&context)
            .ok_or_else(|| ScriptError::new(ScriptErrorCode::Reference, format!("unknown javascript context: {context}")))?;
        let mut state = entry.lock();
        f(&mut state)
    }

    fn classify_js_error(err: &JsError) -> ScriptErrorCode {
        if err.as_native().is_some_and(JsNativeError::is_syntax) {
            ScriptErrorCode::Syntax
        } else if err.as_native().is_some_and(JsNativeError::is_range) {
            ScriptErrorCode::Range
        } else if err.as_native().is_some_and(JsNativeError::is_reference) {
            ScriptErrorCode::Reference
        } else {
            ScriptErrorCode::Runtime
        }
    }
}

impl ScriptEngine for JsScriptEngine {
    fn name(&self) -> &'static str {
        "javascript"
    }

    fn features(&self) -> EngineFeatures {
        Self::engine_features()
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["js", "mjs"]
    }

    fn create_context(&self) -> Result<EngineContextId, ScriptError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.contexts.insert(
            id,
            Mutex::new(JsContextState {
                context: Context::default(),
                registered_modules: HashSet::new(),
                last_error: None,
            }),
        );
        Ok(id)
    }

    fn destroy_context(&self, context: EngineContextId) {
        self.contexts.remove(&context);
    }

    fn load_script(&self, context: EngineContextId, source: &str, _name: &str) -> Result<(), ScriptError> {
        self.with_context(context, |state| {
            state
                .context
                .parse(Source::from_bytes(source))
                .map(|_| ())
                .map_err(|e| ScriptError::new(Self::classify_js_error(&e), e.to_string()))
        })
    }

    fn load_file(&self, context: EngineContextId, path: &std::path::Path) -> Result<(), ScriptError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::new(ScriptErrorCode::Module, format!("could not read {}: {e}", path.display())))?;
        self.load_script(context, &source, &path.to_string_lossy())
    }

    fn execute_script(&self, context: EngineContextId, source: &str) -> Result<ScriptValue, ScriptError> {
        self.with_context(context, |state| {
            let result = state.context.eval(Source::from_bytes(source));
            match result {
                Ok(value) => from_js_value(&mut state.context, &value),
                Err(e) => {
                    let err = ScriptError::new(Self::classify_js_error(&e), e.to_string());
                    state.last_error = Some(err.clone());
                    Err(err)
                }
            }
        })
    }

    fn execute_function(&self, context: EngineContextId, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        self.with_context(context, |state| {
            let function = state
                .context
                .global_object()
                .get(js_string!(name), &mut state.context)
                .map_err(|e| ScriptError::new(ScriptErrorCode::Reference, e.to_string()))?;
            let mut js_args = Vec::with_capacity(args.len());
            for arg in args {
                js_args.push(to_js_value(&mut state.context, arg)?);
            }
            let result = function
                .as_callable()
                .ok_or_else(|| ScriptError::new(ScriptErrorCode::Reference, format!("unbound function: {name}")))?
                .call(&JsValue::undefined(), &js_args, &mut state.context)
                .map_err(|e| ScriptError::new(Self::classify_js_error(&e), e.to_string()))?;
            from_js_value(&mut state.context, &result)
        })
    }

    fn register_module(&self, context: EngineContextId, module: &ScriptModule) -> Result<(), ScriptError> {
        self.with_context(context, |state| {
            let object = boa_engine::object::JsObject::with_object_proto(state.context.intrinsics());
            for constant in &module.constants {
                let value = to_js_value(&mut state.context, &constant.value)?;
                object
                    .set(js_string!(constant.name.clone()), value, true, &mut state.context)
                    .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            }
            for function in &module.functions {
                let callback = function.callback.clone();
                let native = NativeFunction::from_closure(move |_this, args, ctx| {
                    let mut script_args = Vec::with_capacity(args.len());
                    for arg in args {
                        script_args.push(from_js_value(ctx, arg).map_err(to_js_native_error)?);
                    }
                    let result = (callback)(context, &script_args).map_err(to_js_native_error)?;
                    to_js_value(ctx, &result).map_err(to_js_native_error)
                });
                let js_function = FunctionObjectBuilder::new(state.context.realm(), native).build();
                object
                    .set(js_string!(function.name.clone()), js_function, true, &mut state.context)
                    .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            }
            state
                .context
                .global_object()
                .set(js_string!(module.name.clone()), object, true, &mut state.context)
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
            let js_value = to_js_value(&mut state.context, value)?;
            state
                .context
                .register_global_property(js_string!(name), js_value, Attribute::all())
                .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))
        })
    }

    fn get_global(&self, context: EngineContextId, name: &str) -> Result<ScriptValue, ScriptError> {
        self.with_context(context, |state| {
            let value = state
                .context
                .global_object()
                .get(js_string!(name), &mut state.context)
                .map_err(|e| ScriptError::new(ScriptErrorCode::Runtime, e.to_string()))?;
            if value.is_undefined() {
                return Err(ScriptError::new(ScriptErrorCode::Reference, format!("unbound global: {name}")));
            }
            from_js_value(&mut state.context, &value)
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

    fn collect_garbage(&self, _context: EngineContextId) {
        // boa's garbage collector is global, not per-Context; nothing to do here.
    }

    fn memory_usage(&self, _context: EngineContextId) -> u64 {
        0
    }

    fn stack_trace(&self, _context: EngineContextId) -> Result<StackTrace, ScriptError> {
        Ok(StackTrace::default())
    }

    // boa_engine exposes no allocator hook or per-instruction callback to
    // arm a memory cap or timeout against, so `configure_limits` keeps the
    // trait's no-op default; `ScriptContext`'s own entry/wall-time checks
    // (§4.4) remain the enforcement for this engine.
}

fn to_js_native_error(err: ScriptError) -> JsError {
    JsNativeError::error().with_message(err.message).into()
}
