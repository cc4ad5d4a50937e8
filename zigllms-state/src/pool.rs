//! ABOUTME: StatePool - LIFO reuse pool for ManagedState with age/use/health retirement
//! ABOUTME: Acquire returns a scoped guard that always returns or retires its state on drop (§4.9)

use crate::lifecycle::{LifecycleStage, ManagedState, PoolableState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zigllms_core::error::{ScriptError, ScriptErrorCode};

/// Reuse policy for a `StatePool`.
#[derive(Debug, Clone)]
pub struct StatePoolConfig {
    /// Idle states kept warm even when nothing is acquiring.
    pub min_idle: usize,
    /// Combined cap on idle + in-use states.
    pub max_total: usize,
    /// A state older than this is retired instead of recycled.
    pub max_age: Duration,
    /// A state is retired once it has been acquired this many times.
    pub max_uses: u64,
    /// Retire a state on release if it ever recorded an error. Per the
    /// conservative default, any error at all disqualifies a state from
    /// reuse rather than tracking a threshold count.
    pub retire_on_any_error: bool,
}

impl Default for StatePoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_total: 8,
            max_age: Duration::from_secs(600),
            max_uses: 1000,
            retire_on_any_error: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub created_total: u64,
    pub recycled_total: u64,
    pub destroyed_total: u64,
    pub idle: usize,
    pub in_use: usize,
}

struct PoolInner<S: PoolableState> {
    config: StatePoolConfig,
    factory: Box<dyn Fn() -> Result<S, ScriptError> + Send + Sync>,
    available: Mutex<Vec<ManagedState<S>>>,
    in_use: AtomicUsize,
    created_total: AtomicU64,
    recycled_total: AtomicU64,
    destroyed_total: AtomicU64,
}

/// A LIFO pool of `ManagedState<S>`, grounded on the bounded-idle-set pool
/// shape common to connection pools: keep a warm stack of reusable states,
/// hand out the most recently released one first, retire on age/use/error.
pub struct StatePool<S: PoolableState> {
    inner: Arc<PoolInner<S>>,
}

impl<S: PoolableState> Clone for StatePool<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: PoolableState> StatePool<S> {
    pub fn new(config: StatePoolConfig, factory: impl Fn() -> Result<S, ScriptError> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                available: Mutex::new(Vec::new()),
                in_use: AtomicUsize::new(0),
                created_total: AtomicU64::new(0),
                recycled_total: AtomicU64::new(0),
                destroyed_total: AtomicU64::new(0),
            }),
        }
    }

    /// Tops the idle set up to `min_idle` without handing any state out.
    ///
    /// # Errors
    ///
    /// Returns the first factory error encountered.
    pub fn warmup(&self) -> Result<(), ScriptError> {
        loop {
            let idle = self.inner.available.lock().len();
            if idle >= self.inner.config.min_idle {
                return Ok(());
            }
            let state = self.create_one()?;
            self.inner.available.lock().push(state);
        }
    }

    fn create_one(&self) -> Result<ManagedState<S>, ScriptError> {
        let native = (self.inner.factory)()?;
        self.inner.created_total.fetch_add(1, Ordering::Relaxed);
        Ok(ManagedState::new(native))
    }

    /// Acquires a state, preferring a healthy idle one over creating a new
    /// one. Returns a guard that releases (recycle or retire) on drop,
    /// including on an unwinding panic, so callers never need to remember
    /// to release explicitly.
    ///
    /// # Errors
    ///
    /// Returns `Range` if the pool is already at `max_total` with nothing
    /// idle, or the factory's error when a new state must be created.
    pub fn acquire(&self) -> Result<PooledState<S>, ScriptError> {
        loop {
            let popped = self.inner.available.lock().pop();
            if let Some(mut state) = popped {
                if !state.native.health_check() {
                    self.inner.destroyed_total.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                state.native.reset()?;
                state.mark_used();
                self.inner.recycled_total.fetch_add(1, Ordering::Relaxed);
                self.inner.in_use.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledState { pool: self.clone(), state: Some(state) });
            }

            let total = self.inner.in_use.load(Ordering::Relaxed) + self.inner.available.lock().len();
            if total >= self.inner.config.max_total {
                return Err(ScriptError::new(
                    ScriptErrorCode::Range,
                    format!("state pool exhausted: {total} states already at max_total"),
                ));
            }
            let mut state = self.create_one()?;
            state.mark_used();
            self.inner.in_use.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledState { pool: self.clone(), state: Some(state) });
        }
    }

    fn release(&self, mut state: ManagedState<S>) {
        self.inner.in_use.fetch_sub(1, Ordering::Relaxed);
        let retire = state.lifecycle_stage == LifecycleStage::Destroyed
            || state.age() >= self.inner.config.max_age
            || state.use_count >= self.inner.config.max_uses
            || (self.inner.config.retire_on_any_error && state.error_count > 0)
            || !state.native.health_check();
        if retire {
            self.inner.destroyed_total.fetch_add(1, Ordering::Relaxed);
            let _ = state.advance(LifecycleStage::Destroyed);
        } else {
            self.inner.available.lock().push(state);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created_total: self.inner.created_total.load(Ordering::Relaxed),
            recycled_total: self.inner.recycled_total.load(Ordering::Relaxed),
            destroyed_total: self.inner.destroyed_total.load(Ordering::Relaxed),
            idle: self.inner.available.lock().len(),
            in_use: self.inner.in_use.load(Ordering::Relaxed),
        }
    }
}

/// A scoped hold on one `ManagedState<S>`. Dropping it always returns the
/// state to its pool (recycled or retired) — acquiring without a guard is
/// not possible, so a state can never leak out of the pool's accounting.
pub struct PooledState<S: PoolableState> {
    pool: StatePool<S>,
    state: Option<ManagedState<S>>,
}

impl<S: PoolableState> std::ops::Deref for PooledState<S> {
    type Target = ManagedState<S>;
    fn deref(&self) -> &Self::Target {
        self.state.as_ref().expect("state present until drop")
    }
}

impl<S: PoolableState> std::ops::DerefMut for PooledState<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state.as_mut().expect("state present until drop")
    }
}

impl<S: PoolableState> Drop for PooledState<S> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.release(state);
        }
    }
}
