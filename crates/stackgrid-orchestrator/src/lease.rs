//! Per-node leases and cancel flags.
//!
//! Every lifecycle operation on a node holds that node's lease for its
//! whole duration, so transitions for one node never interleave. A `stop`
//! raises the cancel flag of the operation currently holding the lease
//! before it queues for the lease itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per node key (`{workspace}/{id}`).
#[derive(Default)]
pub struct LeaseTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lease on `key`.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop leases for keys under `prefix` that nobody holds or waits on.
    pub async fn forget_prefix(&self, prefix: &str) {
        self.locks
            .lock()
            .await
            .retain(|k, lock| !k.starts_with(prefix) || Arc::strong_count(lock) > 1);
    }
}

/// Cancel flags of in-flight operations.
#[derive(Default)]
pub struct CancelRegistry {
    flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh flag for the operation now holding `key`'s lease.
    pub async fn arm(&self, key: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.lock().await.insert(key.to_string(), flag.clone());
        flag
    }

    pub async fn disarm(&self, key: &str) {
        self.flags.lock().await.remove(key);
    }

    /// Raise the flag of the in-flight operation on `key`, if any.
    pub async fn cancel(&self, key: &str) -> bool {
        match self.flags.lock().await.get(key) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}
