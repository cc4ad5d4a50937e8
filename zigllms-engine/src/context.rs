//! ABOUTME: ScriptContext - one per-script execution environment and its EngineState pooling glue
//! ABOUTME: Grounded on the teacher's GlobalContext/RuntimeConfig shapes (runtime.rs, globals/types.rs) (§3, §4.4)

use crate::engine::{EngineContextId, ScriptEngine};
use crate::modules::ModuleRegistry;
use crate::permissions::{ExecutionStats, ResourceLimits, SecurityPermissions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::module::ScriptModule;
use zigllms_core::value::{ContextId, ScriptFunction, ScriptValue};
use zigllms_state::{protected_call, PoolableState, PooledState, StatePool};

/// The engine-native handle a `ScriptContext` acquires from a `StatePool`.
/// Implements `PoolableState` so the pool's reset/health-check policy
/// applies uniformly across every scripting language.
pub struct EngineState {
    pub engine: Arc<dyn ScriptEngine>,
    pub engine_context: EngineContextId,
}

impl PoolableState for EngineState {
    fn reset(&mut self) -> Result<(), ScriptError> {
        self.engine.clear_errors(self.engine_context);
        self.engine.collect_garbage(self.engine_context);
        Ok(())
    }

    fn memory_usage(&self) -> usize {
        usize::try_from(self.engine.memory_usage(self.engine_context)).unwrap_or(usize::MAX)
    }
}

impl Drop for EngineState {
    fn drop(&mut self) {
        self.engine.destroy_context(self.engine_context);
    }
}

/// One execution environment's state. `Ready`/`Suspended` accept new
/// execution; `Error` must be cleared before reuse; `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Ready,
    Executing,
    Suspended,
    Error,
    Terminated,
}

struct ContextInner {
    modules: HashMap<String, ScriptModule>,
    globals: HashMap<String, ScriptValue>,
    function_cache: HashMap<String, ScriptFunction>,
    last_error: Option<ScriptError>,
    state: ContextState,
    stats: ExecutionStats,
}

/// Per-script execution environment (§3, §4.4). Wraps exactly one
/// `PooledState<EngineState>`; dropping a `ScriptContext` releases that
/// state back to its pool automatically through `PooledState`'s own drop
/// glue rather than destroying it directly.
pub struct ScriptContext {
    pub id: ContextId,
    /// Behind a `Mutex` (rather than requiring `&mut self` on every
    /// execution method) so the Panic Wrapper can take exclusive access to
    /// the underlying `ManagedState` for the duration of one engine call,
    /// per §4.10.
    pooled: Mutex<PooledState<EngineState>>,
    permissions: SecurityPermissions,
    limits: ResourceLimits,
    created_at: SystemTime,
    inner: Mutex<ContextInner>,
}

fn require_executable(state: ContextState) -> Result<(), ScriptError> {
    match state {
        ContextState::Ready | ContextState::Suspended => Ok(()),
        ContextState::Executing => Err(ScriptError::new(ScriptErrorCode::Reference, "context is already executing")),
        ContextState::Error => Err(ScriptError::new(ScriptErrorCode::Reference, "context is in Error state; call clear_errors first")),
        ContextState::Terminated => Err(ScriptError::new(ScriptErrorCode::Reference, "context has been terminated")),
    }
}

/// Whether a failure code that aborts execution also moves the context to
/// `Error` (§4.8, §7). `Permission` violations from module/global access
/// leave the context unchanged; resource and runtime failures move to
/// `Error`; `Unknown` — the Panic Wrapper's `Propagate` strategy (§4.10) —
/// moves straight to the terminal `Terminated` state, since `Propagate`
/// leaves no healthy pooled state behind to resume on.
fn transition_for_failure(code: ScriptErrorCode) -> ContextState {
    match code {
        ScriptErrorCode::Permission => ContextState::Ready,
        ScriptErrorCode::Unknown => ContextState::Terminated,
        _ => ContextState::Error,
    }
}

impl ScriptContext {
    /// Acquires a state from `pool`, injects every bridge in `modules`, and
    /// returns a `Ready` context.
    ///
    /// # Errors
    ///
    /// Whatever the pool's factory or the module injection pass returns.
    pub fn new(
        id: ContextId,
        pool: &StatePool<EngineState>,
        modules: &ModuleRegistry,
        permissions: SecurityPermissions,
        limits: ResourceLimits,
    ) -> Result<Self, ScriptError> {
        let pooled = pool.acquire()?;
        let engine_context = pooled.native.engine_context;
        let engine = pooled.native.engine.clone();
        modules.inject(engine.as_ref(), engine_context, &permissions)?;
        engine.configure_limits(engine_context, &limits)?;
        Ok(Self {
            id,
            pooled: Mutex::new(pooled),
            permissions,
            limits,
            created_at: SystemTime::now(),
            inner: Mutex::new(ContextInner {
                modules: HashMap::new(),
                globals: HashMap::new(),
                function_cache: HashMap::new(),
                last_error: None,
                state: ContextState::Ready,
                stats: ExecutionStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn permissions(&self) -> &SecurityPermissions {
        &self.permissions
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    #[must_use]
    pub fn stats(&self) -> ExecutionStats {
        self.inner.lock().stats.clone()
    }

    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[must_use]
    pub fn last_error(&self) -> Option<ScriptError> {
        self.inner.lock().last_error.clone()
    }

    /// Clears the last error and, if in `Error`, returns to `Ready` (§3
    /// invariant: entering `Error` requires clearing before re-use).
    pub fn clear_errors(&self) {
        let mut inner = self.inner.lock();
        inner.last_error = None;
        if inner.state == ContextState::Error {
            inner.state = ContextState::Ready;
        }
    }

    fn engine(&self) -> Arc<dyn ScriptEngine> {
        self.pooled.lock().native.engine.clone()
    }

    fn engine_context(&self) -> EngineContextId {
        self.pooled.lock().native.engine_context
    }

    /// Limits checked on entry, before the engine call runs (§4.4, §4.8):
    /// memory already over `max_memory_bytes` refuses with `Memory`. A cap
    /// of `0` means unlimited.
    ///
    /// # Errors
    ///
    /// `Memory` if the engine's current usage already exceeds the cap.
    fn check_entry_limits(&self) -> Result<(), ScriptError> {
        let cap = self.limits.max_memory_bytes;
        if cap == 0 {
            return Ok(());
        }
        let usage = self.engine().memory_usage(self.engine_context());
        if usage > cap {
            return Err(ScriptError::new(
                ScriptErrorCode::Memory,
                format!("memory usage {usage} bytes exceeds max_memory_bytes cap {cap} on entry"),
            ));
        }
        Ok(())
    }

    /// Wraps `result` with a wall-clock guard (§4.8: "instruction/wall-time
    /// → `Timeout`"): an engine that returns successfully (or with some
    /// other failure) after `max_execution_time_ms` has elapsed is still
    /// reclassified as a `Timeout`, since an engine without a native
    /// instruction hook cannot always detect its own overrun. A cap of `0`
    /// means unlimited.
    fn enforce_wall_time(&self, started: Instant, result: Result<ScriptValue, ScriptError>) -> Result<ScriptValue, ScriptError> {
        let cap = self.limits.max_execution_time_ms;
        if cap == 0 {
            return result;
        }
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if elapsed_ms >= cap && !matches!(&result, Err(err) if err.code == ScriptErrorCode::Timeout) {
            return Err(ScriptError::new(
                ScriptErrorCode::Timeout,
                format!("execution took {elapsed_ms}ms, exceeding max_execution_time_ms={cap}"),
            ));
        }
        result
    }

    /// Runs `source` to completion. Enforces the `Ready`/`Suspended`
    /// precondition, transitions through `Executing`, checks resource limits
    /// on entry (§4.8), and folds the result's failure code into the
    /// context's next state per §4.8/§7. The engine call itself runs inside
    /// the Panic Wrapper (§4.10): a host-level panic is caught, classified,
    /// and the configured `PanicRecoveryStrategy` is applied to the
    /// underlying `ManagedState`.
    ///
    /// # Errors
    ///
    /// `Reference` if the context cannot currently execute; `Memory` if
    /// already over the memory cap on entry; `Timeout` if the call ran
    /// longer than `max_execution_time_ms`; otherwise whatever the engine's
    /// `execute_script` returns, or the Panic Wrapper's error on a caught
    /// panic (`Runtime`, or `Unknown` under `Propagate`).
    pub fn execute_script(&self, source: &str) -> Result<ScriptValue, ScriptError> {
        {
            let mut inner = self.inner.lock();
            require_executable(inner.state)?;
            inner.state = ContextState::Executing;
        }
        if let Err(err) = self.check_entry_limits() {
            return self.finish_execution(Instant::now(), Err(err));
        }
        let engine = self.engine();
        let engine_context = self.engine_context();
        let strategy = self.limits.panic_recovery_strategy;
        let max_frames = self.limits.panic_stack_depth;
        let started = Instant::now();
        let mut guard = self.pooled.lock();
        let result = protected_call(&mut guard, strategy, max_frames, |_native| engine.execute_script(engine_context, source));
        drop(guard);
        let result = self.enforce_wall_time(started, result);
        self.finish_execution(started, result)
    }

    /// # Errors
    ///
    /// `Reference` if the context cannot currently execute; `Memory` if
    /// already over the memory cap on entry; `Timeout` if the call ran
    /// longer than `max_execution_time_ms`; otherwise whatever the engine's
    /// `execute_function` returns, or the Panic Wrapper's error on a caught
    /// panic (§4.10).
    pub fn execute_function(&self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        {
            let mut inner = self.inner.lock();
            require_executable(inner.state)?;
            inner.state = ContextState::Executing;
        }
        if let Err(err) = self.check_entry_limits() {
            return self.finish_execution(Instant::now(), Err(err));
        }
        let engine = self.engine();
        let engine_context = self.engine_context();
        let strategy = self.limits.panic_recovery_strategy;
        let max_frames = self.limits.panic_stack_depth;
        let started = Instant::now();
        let mut guard = self.pooled.lock();
        let result = protected_call(&mut guard, strategy, max_frames, |_native| engine.execute_function(engine_context, name, args));
        drop(guard);
        let result = self.enforce_wall_time(started, result);
        self.finish_execution(started, result)
    }

    fn finish_execution(&self, started: Instant, result: Result<ScriptValue, ScriptError>) -> Result<ScriptValue, ScriptError> {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut inner = self.inner.lock();
        inner.stats.cumulative_time_ms = inner.stats.cumulative_time_ms.saturating_add(elapsed_ms);
        match &result {
            Ok(_) => {
                inner.state = ContextState::Ready;
                inner.stats.function_calls += 1;
            }
            Err(err) => {
                inner.state = transition_for_failure(err.code);
                inner.last_error = Some(err.clone());
            }
        }
        result
    }

    /// Deep-clones `value` before binding it, both into the context's own
    /// `globals` map and through to the engine, so neither side can alias
    /// the other's storage.
    ///
    /// # Errors
    ///
    /// `Reference` if the context cannot currently accept mutation.
    pub fn set_global(&self, name: &str, value: &ScriptValue) -> Result<(), ScriptError> {
        let cloned = value.deep_clone();
        {
            let inner = self.inner.lock();
            require_executable(inner.state)?;
        }
        self.engine().set_global(self.engine_context(), name, &cloned)?;
        self.inner.lock().globals.insert(name.to_string(), cloned);
        Ok(())
    }

    /// # Errors
    ///
    /// `Reference` if `name` is unbound.
    pub fn get_global(&self, name: &str) -> Result<ScriptValue, ScriptError> {
        if let Some(value) = self.inner.lock().globals.get(name) {
            return Ok(value.deep_clone());
        }
        self.engine().get_global(self.engine_context(), name)
    }

    /// Reads `name` straight from the engine's own global table, bypassing
    /// the host-side mirror `set_global`/`get_global` maintain. Used by the
    /// isolation layer's breach detection, which must observe whatever a
    /// script itself rebinds inside the native environment, not the
    /// last value this context wrote there.
    ///
    /// # Errors
    ///
    /// `Reference` if `name` is unbound in the engine.
    pub fn get_global_live(&self, name: &str) -> Result<ScriptValue, ScriptError> {
        self.engine().get_global(self.engine_context(), name)
    }

    /// Current native memory usage as reported by the underlying engine.
    #[must_use]
    pub fn memory_usage(&self) -> u64 {
        self.engine().memory_usage(self.engine_context())
    }

    /// Names of every global this context has bound via `set_global`. Used
    /// by snapshotting to walk "the global table" (§4.12) without needing an
    /// enumeration primitive on `ScriptEngine` itself.
    #[must_use]
    pub fn global_names(&self) -> Vec<String> {
        self.inner.lock().globals.keys().cloned().collect()
    }

    /// A deep-cloned copy of every global this context has bound.
    #[must_use]
    pub fn snapshot_globals(&self) -> HashMap<String, ScriptValue> {
        self.inner.lock().globals.iter().map(|(k, v)| (k.clone(), v.deep_clone())).collect()
    }

    /// Names of cached named functions - the "registry slots" a snapshot
    /// records as non-restorable placeholders (§4.12).
    #[must_use]
    pub fn cached_function_names(&self) -> Vec<String> {
        self.inner.lock().function_cache.keys().cloned().collect()
    }

    /// Replaces the current globals with `globals`, clearing any bound
    /// global not named in either set. Names in `protected` are left
    /// untouched in both directions, so a sandbox's shadowed globals survive
    /// a restore (§4.12: "clears current globals outside a protected set").
    ///
    /// # Errors
    ///
    /// `Reference` if the context cannot currently accept mutation.
    pub fn restore_globals(&self, globals: &HashMap<String, ScriptValue>, protected: &[String]) -> Result<(), ScriptError> {
        for name in self.global_names() {
            if protected.iter().any(|p| p == &name) || globals.contains_key(&name) {
                continue;
            }
            self.set_global(&name, &ScriptValue::Nil)?;
        }
        for (name, value) in globals {
            if protected.iter().any(|p| p == name) {
                continue;
            }
            self.set_global(name, value)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// `Permission` if `module.name` is outside the allow-list.
    pub fn register_module(&self, module: &ScriptModule) -> Result<(), ScriptError> {
        if !self.permissions.module_allowed(&module.name) {
            return Err(ScriptError::for_field(
                ScriptErrorCode::Permission,
                &module.name,
                format!("module '{}' is not in the allow-list for this context", module.name),
            ));
        }
        self.engine().register_module(self.engine_context(), module)?;
        self.inner.lock().modules.insert(module.name.clone(), module.clone());
        Ok(())
    }

    /// # Errors
    ///
    /// `Permission` if `name` is outside the allow-list.
    pub fn import_module(&self, name: &str) -> Result<(), ScriptError> {
        if !self.permissions.module_allowed(name) {
            return Err(ScriptError::for_field(ScriptErrorCode::Permission, name, format!("module '{name}' is not in the allow-list for this context")));
        }
        self.engine().import_module(self.engine_context(), name)
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.function_cache.clear();
        inner.globals.clear();
        inner.modules.clear();
        inner.last_error = None;
        inner.state = ContextState::Terminated;
        // `self.pooled`'s own `Drop` runs after this and returns the
        // EngineState to its pool; this function never touches the pool.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineFeatures;
    use zigllms_core::config::SandboxLevel;
    use zigllms_state::StatePoolConfig;

    struct CountingEngine {
        next_ctx: std::sync::atomic::AtomicU64,
        globals: Mutex<HashMap<(EngineContextId, String), ScriptValue>>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl ScriptEngine for CountingEngine {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn features(&self) -> EngineFeatures {
            EngineFeatures::default()
        }
        fn supported_extensions(&self) -> &[&'static str] {
            &[]
        }
        fn create_context(&self) -> Result<EngineContextId, ScriptError> {
            Ok(self.next_ctx.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
        }
        fn destroy_context(&self, _context: EngineContextId) {}
        fn load_script(&self, _c: EngineContextId, _s: &str, _n: &str) -> Result<(), ScriptError> {
            Ok(())
        }
        fn load_file(&self, _c: EngineContextId, _p: &std::path::Path) -> Result<(), ScriptError> {
            Ok(())
        }
        fn execute_script(&self, _c: EngineContextId, source: &str) -> Result<ScriptValue, ScriptError> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::Relaxed) {
                return Err(ScriptError::new(ScriptErrorCode::Runtime, "boom"));
            }
            Ok(ScriptValue::string(source))
        }
        fn execute_function(&self, _c: EngineContextId, _n: &str, _a: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
            Ok(ScriptValue::Nil)
        }
        fn register_module(&self, _c: EngineContextId, _m: &ScriptModule) -> Result<(), ScriptError> {
            Ok(())
        }
        fn import_module(&self, _c: EngineContextId, _n: &str) -> Result<(), ScriptError> {
            Ok(())
        }
        fn set_global(&self, c: EngineContextId, name: &str, value: &ScriptValue) -> Result<(), ScriptError> {
            self.globals.lock().insert((c, name.to_string()), value.deep_clone());
            Ok(())
        }
        fn get_global(&self, c: EngineContextId, name: &str) -> Result<ScriptValue, ScriptError> {
            self.globals
                .lock()
                .get(&(c, name.to_string()))
                .cloned()
                .ok_or_else(|| ScriptError::new(ScriptErrorCode::Reference, format!("unbound global: {name}")))
        }
        fn last_error(&self, _c: EngineContextId) -> Option<ScriptError> {
            None
        }
        fn clear_errors(&self, _c: EngineContextId) {}
        fn collect_garbage(&self, _c: EngineContextId) {}
        fn memory_usage(&self, _c: EngineContextId) -> u64 {
            0
        }
    }

    fn make_pool() -> StatePool<EngineState> {
        let engine: Arc<dyn ScriptEngine> = Arc::new(CountingEngine {
            next_ctx: std::sync::atomic::AtomicU64::new(1),
            globals: Mutex::new(HashMap::new()),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        });
        StatePool::new(StatePoolConfig { min_idle: 0, max_total: 4, ..StatePoolConfig::default() }, move || {
            let engine_context = engine.create_context()?;
            Ok(EngineState { engine: engine.clone(), engine_context })
        })
    }

    fn make_context(pool: &StatePool<EngineState>) -> ScriptContext {
        let modules = ModuleRegistry::new("zigllms");
        ScriptContext::new(1, pool, &modules, SecurityPermissions::for_level(SandboxLevel::None), ResourceLimits::default()).unwrap()
    }

    #[test]
    fn new_context_starts_ready() {
        let pool = make_pool();
        let ctx = make_context(&pool);
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn successful_execution_returns_to_ready_and_counts_call() {
        let pool = make_pool();
        let ctx = make_context(&pool);
        let result = ctx.execute_script("return 1").unwrap();
        assert!(result.values_equal(&ScriptValue::string("return 1")));
        assert_eq!(ctx.state(), ContextState::Ready);
        assert_eq!(ctx.stats().function_calls, 1);
    }

    #[test]
    fn runtime_failure_enters_error_and_requires_clear() {
        // Build a pool backed by an engine primed to fail its first execution.
        let engine = Arc::new(CountingEngine {
            next_ctx: std::sync::atomic::AtomicU64::new(1),
            globals: Mutex::new(HashMap::new()),
            fail_next: std::sync::atomic::AtomicBool::new(true),
        });
        let pool2 = StatePool::new(StatePoolConfig { min_idle: 0, max_total: 2, ..StatePoolConfig::default() }, {
            let engine = engine.clone();
            move || {
                let engine_context = engine.create_context()?;
                Ok(EngineState { engine: engine.clone(), engine_context })
            }
        });
        let ctx2 = make_context(&pool2);
        let err = ctx2.execute_script("while true do end").unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Runtime);
        assert_eq!(ctx2.state(), ContextState::Error);
        assert!(ctx2.execute_script("1").is_err(), "Error state must reject execution until cleared");
        ctx2.clear_errors();
        assert_eq!(ctx2.state(), ContextState::Ready);
        assert!(ctx2.execute_script("1").is_ok());
    }

    #[test]
    fn set_global_then_get_global_round_trips_a_deep_clone() {
        let pool = make_pool();
        let ctx = make_context(&pool);
        let mut arr = Vec::new();
        arr.push(ScriptValue::Integer(1));
        ctx.set_global("x", &ScriptValue::Array(arr)).unwrap();
        let back = ctx.get_global("x").unwrap();
        assert!(back.values_equal(&ScriptValue::Array(vec![ScriptValue::Integer(1)])));
    }

    #[test]
    fn register_module_outside_allow_list_is_denied() {
        let pool = make_pool();
        let modules = ModuleRegistry::new("zigllms");
        let mut perms = SecurityPermissions::for_level(SandboxLevel::Restricted);
        perms.module_allow_list.push("agent".to_string());
        let ctx = ScriptContext::new(1, &pool, &modules, perms, ResourceLimits::default()).unwrap();
        let err = ctx.register_module(&ScriptModule::new("tool", "1.0.0")).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Permission);
    }

    #[test]
    fn dropping_context_releases_state_back_to_pool() {
        let pool = make_pool();
        {
            let _ctx = make_context(&pool);
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().idle, 1);
    }
}
