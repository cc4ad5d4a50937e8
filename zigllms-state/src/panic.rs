//! ABOUTME: Protected execution - converts a host panic into a recoverable ScriptError
//! ABOUTME: Captures a PanicInfo (§4.10 steps 2-3) and applies the recovery strategy (step 4)

use crate::lifecycle::{LifecycleStage, ManagedState, PoolableState};
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};
use zigllms_core::config::PanicRecoveryStrategy;
use zigllms_core::error::{ScriptError, ScriptErrorCode, StackFrame};

/// Host-panic classification (§4.10 step 3).
///
/// `ProtectionFault` is named by the spec's taxonomy but never produced
/// here: a hardware trap aborts the process instead of unwinding, so
/// `catch_unwind` cannot observe one. Catching it would need a process-level
/// signal handler, out of scope for this wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicKind {
    Memory,
    StackOverflow,
    ProtectionFault,
    Internal,
    ErrorObject,
}

/// Full diagnostic record of one caught host panic (§4.10 steps 2-3).
#[derive(Debug, Clone)]
pub struct PanicInfo {
    pub kind: PanicKind,
    pub message: String,
    /// Innermost-first, truncated to the depth `protected_call` was called
    /// with.
    pub frames: Vec<StackFrame>,
    pub thread_id: String,
    pub timestamp: SystemTime,
    /// Total frame count observed before truncation to `frames.len()`.
    pub host_stack_depth: usize,
    pub strategy_applied: PanicRecoveryStrategy,
}

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// Installs a panic hook, once per process, that stashes a captured
/// `Backtrace` on the panicking thread's thread-local before unwinding
/// begins (§4.10 step 1: "installs a panic handler scoped to the current
/// thread"). Chains to whatever hook was previously installed so a host's
/// own panic reporting keeps running.
fn ensure_backtrace_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            LAST_BACKTRACE.with(|cell| *cell.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Some(s.clone())
    } else {
        None
    }
}

/// A payload that isn't a plain string stands in for a script-level error
/// object the engine chose to panic with; anything else is classified from
/// the message text.
fn classify(message: Option<&str>) -> PanicKind {
    match message {
        None => PanicKind::ErrorObject,
        Some(m) => {
            let lower = m.to_lowercase();
            if lower.contains("stack overflow") {
                PanicKind::StackOverflow
            } else if lower.contains("memory allocation") || lower.contains("out of memory") || lower.contains("alloc") {
                PanicKind::Memory
            } else {
                PanicKind::Internal
            }
        }
    }
}

/// Parses `Backtrace`'s display form into frames, innermost-first, capped at
/// `max_frames`. Stable Rust exposes no structured frame API, so this reads
/// the `<n>: <symbol>` lines `Backtrace::force_capture`'s `Display` impl
/// produces. Returns the frames alongside the full frame count observed,
/// before truncation.
fn frames_from_backtrace(backtrace: &Backtrace, max_frames: usize) -> (Vec<StackFrame>, usize) {
    let rendered = format!("{backtrace}");
    let mut frames = Vec::new();
    let mut total = 0usize;
    for line in rendered.lines() {
        let trimmed = line.trim_start();
        if !trimmed.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            continue;
        }
        let Some((_, rest)) = trimmed.split_once(':') else {
            continue;
        };
        total += 1;
        if frames.len() < max_frames {
            frames.push(StackFrame {
                function_name: rest.trim().to_string(),
                location: None,
                is_native: true,
            });
        }
    }
    (frames, total)
}

/// Runs `f` against `state`'s native interpreter inside `catch_unwind`. On a
/// clean return, `state.error_count` is untouched. On a caught panic,
/// captures a `PanicInfo` (§4.10 steps 2-3) with up to `max_frames` stack
/// frames, applies the configured recovery strategy to `state`, and returns
/// a `ScriptError` carrying the panic's message and frames, with the rest of
/// the `PanicInfo` folded into the error's structured `context`.
///
/// `NewState` cannot fabricate a replacement here (this module holds no
/// factory) — it marks `state` destroyed so the owning `StatePool` retires
/// rather than recycles it on release, which has the same externally
/// observable effect. `Propagate` surfaces an unrecoverable `Unknown` error
/// and also marks `state` destroyed, so the caller has no healthy state left
/// to resume on — terminating the owning Context is the only sound move.
///
/// # Errors
///
/// Returns whatever `f` returns on error, or the panic's `ScriptError` if
/// `f` panicked.
pub fn protected_call<S, F, R>(state: &mut ManagedState<S>, strategy: PanicRecoveryStrategy, max_frames: usize, f: F) -> Result<R, ScriptError>
where
    S: PoolableState,
    F: FnOnce(&mut S) -> Result<R, ScriptError>,
{
    ensure_backtrace_hook();
    let native = &mut state.native;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(native)));

    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let raw_message = panic_message(payload.as_ref());
            let kind = classify(raw_message.as_deref());
            let message = raw_message.unwrap_or_else(|| "script engine panicked with a non-string payload".to_string());
            let backtrace = LAST_BACKTRACE.with(|cell| cell.borrow_mut().take());
            let (frames, host_stack_depth) = backtrace.map(|bt| frames_from_backtrace(&bt, max_frames)).unwrap_or_default();

            state.record_error();
            let code = match strategy {
                PanicRecoveryStrategy::ResetState => {
                    // Best-effort: if reset itself fails the state is left
                    // for the pool's own health_check to catch on release.
                    let _ = state.native.reset();
                    ScriptErrorCode::Runtime
                }
                PanicRecoveryStrategy::NewState => {
                    let _ = state.advance(LifecycleStage::Destroyed);
                    ScriptErrorCode::Runtime
                }
                PanicRecoveryStrategy::Propagate => {
                    let _ = state.advance(LifecycleStage::Destroyed);
                    ScriptErrorCode::Unknown
                }
            };

            let info = PanicInfo {
                kind,
                message: message.clone(),
                frames,
                thread_id: format!("{:?}", std::thread::current().id()),
                timestamp: SystemTime::now(),
                host_stack_depth,
                strategy_applied: strategy,
            };

            let mut err = ScriptError::new(code, format!("engine panic: {}", info.message))
                .with_native_text(info.message.clone())
                .with_context(serde_json::json!({
                    "panic_kind": format!("{:?}", info.kind),
                    "thread_id": info.thread_id,
                    "timestamp_unix_ms": info.timestamp.duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0),
                    "host_stack_depth": info.host_stack_depth,
                    "strategy_applied": format!("{:?}", info.strategy_applied),
                }));
            for frame in info.frames {
                err.push_frame(frame);
            }
            Err(err)
        }
    }
}
