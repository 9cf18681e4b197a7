//! Per-(project, fingerprint) async locks.
//!
//! Every mutation of a defect chain (automaton transitions and tracer
//! write-backs) holds the chain's lock, so two results with the same
//! fingerprint never race to create duplicate rows. Different fingerprints
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use testpulse_state::ProjectId;
use tokio::sync::OwnedMutexGuard;

type LockKey = (ProjectId, String);

/// Shared lock table; clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct FingerprintLocks {
    table: Arc<Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `(project, fingerprint)`.
    pub async fn acquire(&self, project: &ProjectId, fingerprint: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on are dropped.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table
                .entry((project.clone(), fingerprint.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
