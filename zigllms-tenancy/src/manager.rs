//! ABOUTME: Tenant and TenantManager - one ManagedState per tenant, quota enforcement, breach detection
//! ABOUTME: Grounded on the teacher's DefaultTenantRegistry/TenantLifecycleHook shape, made synchronous (§4.11)

use crate::limits::{TenantConfig, TenantLimits, TenantUsage};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zigllms_core::config::SandboxLevel;
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_core::value::ScriptValue;
use zigllms_engine::{ContextState, EngineState, ModuleRegistry, ResourceLimits, ScriptContext, SecurityPermissions};
use zigllms_state::StatePool;

/// A tenant's lifetime state. `Terminated` is final: the wrapped
/// `ScriptContext` has been dropped and released back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStatus {
    Active,
    Terminated,
}

/// Hook invoked on tenant lifecycle transitions, mirroring the teacher's
/// `TenantLifecycleHook` but synchronous (no engine operation here suspends
/// a host thread independent of a `ScriptContext`, so there is nothing for
/// `async` to buy us — see the engine crate's own sync-trait decision).
pub trait TenantLifecycleHook: Send + Sync {
    fn on_tenant_created(&self, _config: &TenantConfig) {}
    fn on_tenant_terminated(&self, _tenant_id: &str, _reason: &ScriptError) {}
    fn on_tenant_removed(&self, _tenant_id: &str) {}
}

/// One isolated tenant: a single `ScriptContext` (and therefore a single
/// pooled `EngineState`) behind its quotas and shadowed globals (§3, §4.11).
pub struct Tenant {
    pub id: String,
    limits: TenantLimits,
    usage: TenantUsage,
    context: Mutex<Option<ScriptContext>>,
    status: Mutex<TenantStatus>,
    termination_reason: Mutex<Option<ScriptError>>,
}

impl Tenant {
    fn new(id: String, limits: TenantLimits, context: ScriptContext) -> Self {
        Self {
            id,
            limits,
            usage: TenantUsage::default(),
            context: Mutex::new(Some(context)),
            status: Mutex::new(TenantStatus::Active),
            termination_reason: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &TenantLimits {
        &self.limits
    }

    #[must_use]
    pub fn usage(&self) -> &TenantUsage {
        &self.usage
    }

    #[must_use]
    pub fn status(&self) -> TenantStatus {
        *self.status.lock()
    }

    #[must_use]
    pub fn termination_reason(&self) -> Option<ScriptError> {
        self.termination_reason.lock().clone()
    }

    fn require_active(&self) -> Result<(), ScriptError> {
        if *self.status.lock() == TenantStatus::Active {
            Ok(())
        } else {
            Err(ScriptError::new(ScriptErrorCode::Reference, format!("tenant '{}' has been terminated", self.id)))
        }
    }

    /// Terminates the tenant with `reason`, dropping its `ScriptContext` so
    /// the pooled `EngineState` is released (§3: "a tenant that exceeds any
    /// quota transitions to `Terminated`").
    fn terminate(&self, reason: ScriptError) {
        let mut status = self.status.lock();
        if *status == TenantStatus::Terminated {
            return;
        }
        *status = TenantStatus::Terminated;
        *self.termination_reason.lock() = Some(reason);
        self.context.lock().take();
    }

    /// Runs `source` in this tenant's context, charging the function-call
    /// quota and checking the memory quota afterward. Terminates the tenant
    /// and returns its breach error if either quota is exceeded.
    ///
    /// # Errors
    ///
    /// `Reference` if the tenant is already terminated; otherwise whatever
    /// the underlying `ScriptContext::execute_script` returns, or a
    /// `Permission`/`Memory` breach error.
    pub fn execute_script(&self, source: &str) -> Result<ScriptValue, ScriptError> {
        self.require_active()?;
        let result = {
            let guard = self.context.lock();
            let ctx = guard.as_ref().expect("checked active above");
            ctx.execute_script(source)
        };
        if let Some(err) = self.charge_and_check_breach() {
            self.terminate(err.clone());
            return Err(err);
        }
        result
    }

    /// Records `count` executed instructions against the CPU quota. Intended
    /// to be driven by an engine-level instruction hook (e.g.
    /// `mlua::Lua::set_hook` at a fixed stride, per §4.11); the tenancy
    /// layer has no engine-specific hook of its own.
    ///
    /// # Errors
    ///
    /// `Timeout` if this charge exhausts `cpu_instruction_quota`; the
    /// tenant is terminated before the error is returned.
    pub fn charge_instructions(&self, count: u64) -> Result<(), ScriptError> {
        self.require_active()?;
        if self.limits.cpu_instruction_quota == 0 {
            return Ok(());
        }
        let used = self.usage.add_instructions(count);
        if used >= self.limits.cpu_instruction_quota {
            let err = ScriptError::new(ScriptErrorCode::Timeout, format!("tenant '{}' exceeded its cpu instruction quota", self.id));
            self.terminate(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Re-validates the sandbox root is intact: none of `denied_globals`
    /// has been rebound to a non-nil value since creation (§4.11 breach
    /// detection). On breach the tenant is terminated with `Permission`.
    ///
    /// # Errors
    ///
    /// `Reference` if already terminated; the breach error otherwise
    /// (tenant is terminated as a side effect).
    pub fn check_breach(&self) -> Result<(), ScriptError> {
        self.require_active()?;
        if let Some(err) = self.detect_breach() {
            self.terminate(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn detect_breach(&self) -> Option<ScriptError> {
        let guard = self.context.lock();
        let ctx = guard.as_ref()?;
        for name in &self.limits.denied_globals {
            match ctx.get_global_live(name) {
                Ok(ScriptValue::Nil) | Err(_) => continue,
                Ok(_) => {
                    return Some(ScriptError::for_field(
                        ScriptErrorCode::Permission,
                        name,
                        format!("tenant '{}' sandbox breach: '{name}' was restored", self.id),
                    ))
                }
            }
        }
        None
    }

    /// Counts the most recent call against `function_call_quota` and checks
    /// `memory_bytes`. Returns the breach error, if any, without mutating
    /// tenant status (the caller terminates).
    fn charge_and_check_breach(&self) -> Option<ScriptError> {
        let calls = self.usage.record_call();
        if self.limits.function_call_quota != 0 && calls > self.limits.function_call_quota {
            return Some(ScriptError::new(
                ScriptErrorCode::Permission,
                format!("tenant '{}' exceeded its function call quota", self.id),
            ));
        }
        let memory = self.context.lock().as_ref().map(ScriptContext::memory_usage).unwrap_or(0);
        if self.limits.memory_bytes != 0 && memory > self.limits.memory_bytes {
            return Some(ScriptError::new(
                ScriptErrorCode::Memory,
                format!("tenant '{}' exceeded its memory quota ({memory} > {})", self.id, self.limits.memory_bytes),
            ));
        }
        None
    }
}

/// Shadows every `denied_globals` entry to `nil` in a freshly created
/// context, establishing the tenant's namespace before any script runs.
fn shadow_denied_globals(ctx: &ScriptContext, limits: &TenantLimits) -> Result<(), ScriptError> {
    for name in &limits.denied_globals {
        ctx.set_global(name, &ScriptValue::Nil)?;
    }
    Ok(())
}

/// Owns one `ScriptContext` (and its pooled `EngineState`) per registered
/// tenant. Mirrors the teacher's `DefaultTenantRegistry` but synchronous and
/// scoped to script isolation rather than vector-store multi-tenancy.
pub struct TenantManager {
    pool: StatePool<EngineState>,
    modules: ModuleRegistry,
    tenants: DashMap<String, Arc<Tenant>>,
    hooks: Mutex<Vec<Arc<dyn TenantLifecycleHook>>>,
    next_context_id: AtomicU64,
}

impl TenantManager {
    #[must_use]
    pub fn new(pool: StatePool<EngineState>, modules: ModuleRegistry) -> Self {
        Self {
            pool,
            modules,
            tenants: DashMap::new(),
            hooks: Mutex::new(Vec::new()),
            next_context_id: AtomicU64::new(1),
        }
    }

    pub fn add_hook(&self, hook: Arc<dyn TenantLifecycleHook>) {
        self.hooks.lock().push(hook);
    }

    /// Creates and registers a new tenant: acquires a `ScriptContext` scoped
    /// to `config.limits.allowed_modules` under `Strict` sandboxing, then
    /// shadows every denied global to `nil`.
    ///
    /// # Errors
    ///
    /// Whatever pool acquisition, module injection, or global shadowing
    /// returns; `Reference` if `config.tenant_id` is already registered.
    pub fn create_tenant(&self, config: TenantConfig) -> Result<Arc<Tenant>, ScriptError> {
        if self.tenants.contains_key(&config.tenant_id) {
            return Err(ScriptError::new(ScriptErrorCode::Reference, format!("tenant '{}' already registered", config.tenant_id)));
        }
        let mut permissions = SecurityPermissions::for_level(SandboxLevel::Strict);
        permissions.module_allow_list = config.limits.allowed_modules.clone();
        permissions.max_stack_depth = config.limits.max_stack_size;
        let resource_limits = ResourceLimits {
            max_memory_bytes: config.limits.memory_bytes,
            ..ResourceLimits::default()
        };
        let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        let ctx = ScriptContext::new(context_id, &self.pool, &self.modules, permissions, resource_limits)?;
        shadow_denied_globals(&ctx, &config.limits)?;

        let tenant = Arc::new(Tenant::new(config.tenant_id.clone(), config.limits.clone(), ctx));
        self.tenants.insert(config.tenant_id.clone(), tenant.clone());
        for hook in self.hooks.lock().iter() {
            hook.on_tenant_created(&config);
        }
        Ok(tenant)
    }

    #[must_use]
    pub fn get_tenant(&self, tenant_id: &str) -> Option<Arc<Tenant>> {
        self.tenants.get(tenant_id).map(|entry| entry.value().clone())
    }

    /// Removes a tenant's registration entirely. If still active, it is
    /// terminated first so its `ScriptContext` is released to the pool.
    pub fn remove_tenant(&self, tenant_id: &str) {
        if let Some((_, tenant)) = self.tenants.remove(tenant_id) {
            if tenant.status() == TenantStatus::Active {
                tenant.terminate(ScriptError::new(ScriptErrorCode::Reference, "tenant removed"));
            }
            for hook in self.hooks.lock().iter() {
                hook.on_tenant_removed(tenant_id);
            }
        }
    }

    #[must_use]
    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Runs `check_breach` on every currently active tenant, firing
    /// `on_tenant_terminated` for any that fail. Meant to be driven
    /// periodically by the embedding host (§4.11: "breach detection
    /// periodically validates that the sandbox root is intact").
    pub fn sweep_breaches(&self) {
        for entry in &self.tenants {
            let tenant = entry.value();
            if tenant.status() != TenantStatus::Active {
                continue;
            }
            if let Err(err) = tenant.check_breach() {
                for hook in self.hooks.lock().iter() {
                    hook.on_tenant_terminated(&tenant.id, &err);
                }
            }
        }
    }
}

impl Tenant {
    /// The wrapped `ScriptContext`'s execution state, or `None` once
    /// terminated and the context has been released.
    #[must_use]
    pub fn context_state(&self) -> Option<ContextState> {
        self.context.lock().as_ref().map(ScriptContext::state)
    }
}
