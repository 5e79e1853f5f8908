//! Identifier derivation and timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Deterministic id `{prefix}-{16 hex chars}` from the given parts.
pub fn derive_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{prefix}-{}", &digest[..16])
}

/// A fresh detection-run id. Never repeats within a process, and carries the
/// wall clock so ids from different processes don't collide in practice.
pub fn new_run_id(folder_path: &str) -> String {
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string();
    let pid = std::process::id().to_string();
    derive_id("run", &[folder_path, &nanos, &pid, &seq.to_string()])
}

/// Stored records are keyed `{workspace}/{id}`, so a workspace name must be
/// non-empty and must not contain `/`.
pub fn check_workspace_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("workspace name is empty".to_string());
    }
    if name.contains('/') {
        return Err(format!("workspace name '{name}' contains '/'"));
    }
    Ok(())
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
