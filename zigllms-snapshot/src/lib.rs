//! ABOUTME: Global/registry snapshotting for rollback (§3, §4.12): cycle-safe serialization, bounded store
//! ABOUTME: create_snapshot/restore_snapshot operate on a zigllms-engine ScriptContext

mod format;
mod snapshot;
mod store;

pub use format::SerializedValue;
pub use snapshot::{create_snapshot, restore_snapshot, to_persisted_bytes, from_persisted_bytes, GcStateHints, PostRestoreHook, RestoreReport, Snapshot, SnapshotId};
pub use store::{SnapshotStore, SnapshotStoreConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use zigllms_core::error::{ScriptError, ScriptErrorCode};
    use zigllms_core::module::ScriptModule;
    use zigllms_core::value::ScriptValue;
    use zigllms_engine::{EngineContextId, EngineFeatures, EngineState, ModuleRegistry, ResourceLimits, ScriptContext, ScriptEngine, SecurityPermissions, StackTrace};
    use zigllms_state::{StatePool, StatePoolConfig};

    /// An in-memory engine test double whose globals live in a real
    /// `Mutex<HashMap>`, so `set_global`/`get_global` behave like a real
    /// engine closely enough to exercise a full snapshot/restore cycle.
    #[derive(Default)]
    struct MapEngine {
        next_ctx: AtomicU64,
        globals: std::sync::Mutex<HashMap<(EngineContextId, String), ScriptValue>>,
    }

    impl ScriptEngine for MapEngine {
        fn name(&self) -> &'static str {
            "map"
        }
        fn features(&self) -> EngineFeatures {
            EngineFeatures::default()
        }
        fn supported_extensions(&self) -> &[&'static str] {
            &[]
        }
        fn create_context(&self) -> Result<EngineContextId, ScriptError> {
            Ok(self.next_ctx.fetch_add(1, Ordering::Relaxed))
        }
        fn destroy_context(&self, _context: EngineContextId) {}
        fn load_script(&self, _c: EngineContextId, _s: &str, _n: &str) -> Result<(), ScriptError> {
            Ok(())
        }
        fn load_file(&self, _c: EngineContextId, _p: &std::path::Path) -> Result<(), ScriptError> {
            Ok(())
        }
        fn execute_script(&self, _c: EngineContextId, source: &str) -> Result<ScriptValue, ScriptError> {
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
            self.globals.lock().unwrap().insert((c, name.to_string()), value.deep_clone());
            Ok(())
        }
        fn get_global(&self, c: EngineContextId, name: &str) -> Result<ScriptValue, ScriptError> {
            self.globals
                .lock()
                .unwrap()
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
        fn stack_trace(&self, _c: EngineContextId) -> Result<StackTrace, ScriptError> {
            Ok(StackTrace::default())
        }
    }

    fn make_context() -> ScriptContext {
        let engine: Arc<dyn ScriptEngine> = Arc::new(MapEngine::default());
        let pool = StatePool::new(StatePoolConfig { min_idle: 0, max_total: 4, ..StatePoolConfig::default() }, move || {
            let engine_context = engine.create_context()?;
            Ok(EngineState { engine: engine.clone(), engine_context })
        });
        ScriptContext::new(1, &pool, &ModuleRegistry::new("zigllms"), SecurityPermissions::default(), ResourceLimits::default()).unwrap()
    }

    /// Testable scenario S4: set globals, snapshot, mutate, restore, expect
    /// the exact pre-mutation globals back.
    #[test]
    fn snapshot_then_mutate_then_restore_recovers_exact_globals() {
        let ctx = make_context();
        ctx.set_global("x", &ScriptValue::Integer(1)).unwrap();
        ctx.set_global("y", &ScriptValue::string("hi")).unwrap();
        ctx.set_global("z", &ScriptValue::Array(vec![ScriptValue::Integer(1), ScriptValue::Integer(2), ScriptValue::Integer(3)])).unwrap();

        let snapshot = create_snapshot(&ctx, HashMap::new()).unwrap();

        ctx.set_global("x", &ScriptValue::Integer(99)).unwrap();
        ctx.set_global("y", &ScriptValue::Nil).unwrap();
        ctx.set_global("z", &ScriptValue::Nil).unwrap();
        ctx.set_global("w", &ScriptValue::Boolean(true)).unwrap();

        let report = restore_snapshot(&ctx, &snapshot, &[], &[]).unwrap();
        assert!(report.non_restored_paths.is_empty());

        assert!(ctx.get_global("x").unwrap().values_equal(&ScriptValue::Integer(1)));
        assert!(ctx.get_global("y").unwrap().values_equal(&ScriptValue::string("hi")));
        assert!(ctx.get_global("z").unwrap().values_equal(&ScriptValue::Array(vec![ScriptValue::Integer(1), ScriptValue::Integer(2), ScriptValue::Integer(3)])));
        assert!(matches!(ctx.get_global("w"), Err(_)) || ctx.get_global("w").unwrap().values_equal(&ScriptValue::Nil));
    }

    #[test]
    fn function_globals_survive_as_non_restored_placeholders() {
        let ctx = make_context();
        ctx.set_global(
            "callback",
            &ScriptValue::Function(zigllms_core::value::ScriptFunction { owning_context: 1, context_generation: 0, engine_ref: 1 }),
        )
        .unwrap();
        ctx.set_global("count", &ScriptValue::Integer(5)).unwrap();

        let snapshot = create_snapshot(&ctx, HashMap::new()).unwrap();
        ctx.set_global("count", &ScriptValue::Integer(0)).unwrap();

        let report = restore_snapshot(&ctx, &snapshot, &[], &[]).unwrap();
        assert_eq!(report.non_restored_paths, vec!["callback".to_string()]);
        assert!(ctx.get_global("count").unwrap().values_equal(&ScriptValue::Integer(5)));
        assert!(ctx.get_global("callback").unwrap().values_equal(&ScriptValue::Nil));
    }

    #[test]
    fn protected_globals_are_not_touched_by_restore() {
        let ctx = make_context();
        ctx.set_global("os", &ScriptValue::Nil).unwrap();
        ctx.set_global("x", &ScriptValue::Integer(1)).unwrap();
        let snapshot = create_snapshot(&ctx, HashMap::new()).unwrap();

        ctx.set_global("os", &ScriptValue::string("escaped")).unwrap();
        ctx.set_global("x", &ScriptValue::Integer(2)).unwrap();

        restore_snapshot(&ctx, &snapshot, &["os".to_string()], &[]).unwrap();
        assert!(ctx.get_global("os").unwrap().values_equal(&ScriptValue::string("escaped")));
        assert!(ctx.get_global("x").unwrap().values_equal(&ScriptValue::Integer(1)));
    }

    #[test]
    fn post_restore_hooks_observe_the_snapshot_id_and_diagnostics() {
        struct RecordingHook {
            seen: std::sync::Mutex<Option<(SnapshotId, Vec<String>)>>,
        }
        impl PostRestoreHook for RecordingHook {
            fn on_restored(&self, snapshot_id: &SnapshotId, non_restored_paths: &[String]) {
                *self.seen.lock().unwrap() = Some((snapshot_id.clone(), non_restored_paths.to_vec()));
            }
        }

        let ctx = make_context();
        ctx.set_global("x", &ScriptValue::Integer(1)).unwrap();
        let snapshot = create_snapshot(&ctx, HashMap::new()).unwrap();
        let hook = Arc::new(RecordingHook { seen: std::sync::Mutex::new(None) });
        let hooks: Vec<Arc<dyn PostRestoreHook>> = vec![hook.clone()];

        restore_snapshot(&ctx, &snapshot, &[], &hooks).unwrap();

        let (id, paths) = hook.seen.lock().unwrap().clone().unwrap();
        assert_eq!(id, snapshot.id);
        assert!(paths.is_empty());
    }
}
