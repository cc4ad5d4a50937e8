//! ABOUTME: Per-engine state lifecycle, pooling and panic-safe protected execution
//! ABOUTME: Engine-agnostic: consumers supply a `PoolableState` impl for their native state

pub mod lifecycle;
pub mod panic;
pub mod pool;

pub use lifecycle::{LifecycleStage, ManagedState, PoolableState};
pub use panic::{protected_call, PanicInfo, PanicKind};
pub use pool::{PoolStats, PooledState, StatePool, StatePoolConfig};
