//! ABOUTME: Snapshot - a captured {globals, registry subset, gc hints} with a checksum (§3, §4.12)
//! ABOUTME: create_snapshot/restore_snapshot walk a ScriptContext; restore re-runs registered post-restore hooks

use crate::format::{self, SerializedValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use zigllms_core::error::{ScriptError, ScriptErrorCode};
use zigllms_engine::ScriptContext;

pub type SnapshotId = String;

const MAGIC: &[u8; 5] = b"SLSS\x01";
const FORMAT_VERSION: u32 = 1;

/// Minimal GC-related hints captured at snapshot time (§3). The engine
/// abstraction exposes no richer GC model than `memory_usage`, so this is
/// the one hint a snapshot can honestly carry across a restore.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcStateHints {
    pub memory_bytes_at_snapshot: u64,
}

/// A captured `{ id, created_at, metadata, serialized_globals,
/// serialized_registry_subset, gc_state_hints, checksum, size_bytes }` (§3).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub created_at: SystemTime,
    pub metadata: HashMap<String, String>,
    pub(crate) globals: Vec<(String, SerializedValue)>,
    /// Names of cached functions at snapshot time - always non-restorable,
    /// recorded so `restore_snapshot` can report on them by name.
    pub serialized_registry_subset: Vec<String>,
    pub gc_state_hints: GcStateHints,
    pub checksum: u64,
    pub size_bytes: u64,
}

/// Hook run after a successful `restore_snapshot`, e.g. to re-wire native
/// bindings a restored global now expects (§4.12).
pub trait PostRestoreHook: Send + Sync {
    fn on_restored(&self, snapshot_id: &SnapshotId, non_restored_paths: &[String]);
}

/// Walks `ctx`'s global table and cached-function registry slots and builds
/// a `Snapshot`. Functions/userdata serialize as opaque placeholders; `id`
/// is a fresh UUID (§4.12).
///
/// # Errors
///
/// `Range` if any value's nesting exceeds the depth guard in `format`.
pub fn create_snapshot(ctx: &ScriptContext, metadata: HashMap<String, String>) -> Result<Snapshot, ScriptError> {
    let live = ctx.snapshot_globals();
    let mut names: Vec<String> = live.keys().cloned().collect();
    names.sort();

    let mut globals = Vec::with_capacity(names.len());
    for name in names {
        let value = &live[&name];
        let serialized = format::serialize_value(value, 0, &name)?;
        globals.push((name, serialized));
    }

    let mut registry_subset = ctx.cached_function_names();
    registry_subset.sort();

    let payload = format::encode_value_tree(&globals);
    let checksum = xxhash_rust::xxh64::xxh64(&payload, 0);
    let size_bytes = payload.len() as u64 + registry_subset.iter().map(|name| name.len() as u64 + 4).sum::<u64>();

    Ok(Snapshot {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: SystemTime::now(),
        metadata,
        globals,
        serialized_registry_subset: registry_subset,
        gc_state_hints: GcStateHints { memory_bytes_at_snapshot: ctx.memory_usage() },
        checksum,
        size_bytes,
    })
}

/// Result of a `restore_snapshot`: which global paths could not be restored
/// because they were opaque placeholders at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub non_restored_paths: Vec<String>,
}

/// Clears `ctx`'s current globals outside `protected`, deserializes this
/// snapshot's globals into it, and runs `hooks` afterward (§4.12). Partial
/// restorability is explicit: placeholders bind `Nil` and are listed in the
/// returned report rather than failing the restore.
///
/// # Errors
///
/// `Type` if the snapshot's stored payload no longer matches its checksum;
/// otherwise whatever `ScriptContext::restore_globals` returns (e.g.
/// `Reference` if the context cannot currently accept mutation).
pub fn restore_snapshot(
    ctx: &ScriptContext,
    snapshot: &Snapshot,
    protected: &[String],
    hooks: &[Arc<dyn PostRestoreHook>],
) -> Result<RestoreReport, ScriptError> {
    let payload = format::encode_value_tree(&snapshot.globals);
    if xxhash_rust::xxh64::xxh64(&payload, 0) != snapshot.checksum {
        return Err(ScriptError::new(ScriptErrorCode::Type, format!("snapshot '{}' failed checksum validation", snapshot.id)));
    }

    let mut restored = HashMap::with_capacity(snapshot.globals.len());
    let mut non_restored = Vec::new();
    for (name, serialized) in &snapshot.globals {
        let value = format::deserialize_value(serialized, name, &mut non_restored);
        restored.insert(name.clone(), value);
    }

    ctx.restore_globals(&restored, protected)?;

    let report = RestoreReport { non_restored_paths: non_restored };
    for hook in hooks {
        hook.on_restored(&snapshot.id, &report.non_restored_paths);
    }
    Ok(report)
}

/// Serializes a `Snapshot` to the persisted binary layout (§6): magic,
/// version, creation time, metadata, value tree, trailing checksum.
#[must_use]
pub fn to_persisted_bytes(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

    let created_at_ms = snapshot.created_at.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
    out.extend_from_slice(&created_at_ms.to_le_bytes());

    let metadata_json = serde_json::to_vec(&snapshot.metadata).unwrap_or_default();
    format::write_string(&mut out, &metadata_json);

    out.extend_from_slice(&format::encode_value_tree(&snapshot.globals));

    let checksum = xxhash_rust::xxh64::xxh64(&out, 0);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

/// Inverse of `to_persisted_bytes`. Recomputes `serialized_registry_subset`
/// as empty and `gc_state_hints` as zeroed, since neither crosses the
/// persisted boundary (§6 only lists globals in the layout).
///
/// # Errors
///
/// `Type` if the magic/version is unrecognized, the buffer is truncated, or
/// the trailing checksum does not match.
pub fn from_persisted_bytes(bytes: &[u8]) -> Result<Snapshot, ScriptError> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(ScriptError::new(ScriptErrorCode::Type, "not a recognized snapshot file (bad magic)"));
    }
    let checksummed_len = bytes.len().checked_sub(8).ok_or_else(|| ScriptError::new(ScriptErrorCode::Type, "truncated snapshot data"))?;
    let expected = u64::from_le_bytes(bytes[checksummed_len..].try_into().expect("checked length"));
    let actual = xxhash_rust::xxh64::xxh64(&bytes[..checksummed_len], 0);
    if actual != expected {
        return Err(ScriptError::new(ScriptErrorCode::Type, "snapshot checksum mismatch"));
    }

    let mut pos = MAGIC.len();
    let version = format::read_u32(bytes, &mut pos)?;
    if version != FORMAT_VERSION {
        return Err(ScriptError::new(ScriptErrorCode::Type, format!("unsupported snapshot format version {version}")));
    }
    let created_at_ms = format::read_u64(bytes, &mut pos)?;
    let created_at = UNIX_EPOCH + std::time::Duration::from_millis(created_at_ms);

    let metadata_json = format::read_string(bytes, &mut pos)?;
    let metadata: HashMap<String, String> = serde_json::from_str(&metadata_json).map_err(|e| ScriptError::new(ScriptErrorCode::Type, format!("malformed snapshot metadata: {e}")))?;

    let globals = format::decode_value_tree(bytes, &mut pos)?;
    let payload = format::encode_value_tree(&globals);
    let checksum = xxhash_rust::xxh64::xxh64(&payload, 0);

    Ok(Snapshot {
        id: uuid::Uuid::new_v4().to_string(),
        created_at,
        metadata,
        globals,
        serialized_registry_subset: Vec::new(),
        gc_state_hints: GcStateHints { memory_bytes_at_snapshot: 0 },
        checksum,
        size_bytes: payload.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use zigllms_core::value::ScriptValue;

    fn snapshot_with_globals(entries: Vec<(&str, ScriptValue)>) -> Snapshot {
        let mut globals = Vec::new();
        for (name, value) in entries {
            globals.push((name.to_string(), format::serialize_value(&value, 0, name).unwrap()));
        }
        let payload = format::encode_value_tree(&globals);
        let checksum = xxhash_rust::xxh64::xxh64(&payload, 0);
        Snapshot {
            id: "test".to_string(),
            created_at: SystemTime::now(),
            metadata: HashMap::new(),
            globals,
            serialized_registry_subset: Vec::new(),
            gc_state_hints: GcStateHints { memory_bytes_at_snapshot: 0 },
            checksum,
            size_bytes: payload.len() as u64,
        }
    }

    #[test]
    fn persisted_round_trip_preserves_globals_and_metadata() {
        let mut snapshot = snapshot_with_globals(vec![("x", ScriptValue::Integer(1)), ("y", ScriptValue::string("hi"))]);
        snapshot.metadata.insert("reason".to_string(), "checkpoint".to_string());

        let bytes = to_persisted_bytes(&snapshot);
        assert_eq!(&bytes[..5], MAGIC);

        let restored = from_persisted_bytes(&bytes).unwrap();
        assert_eq!(restored.metadata.get("reason"), Some(&"checkpoint".to_string()));
        assert_eq!(restored.globals, snapshot.globals);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let snapshot = snapshot_with_globals(vec![("x", ScriptValue::Integer(1))]);
        let mut bytes = to_persisted_bytes(&snapshot);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = from_persisted_bytes(&bytes).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Type);
    }
}
