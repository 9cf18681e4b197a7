//! The bundle of store handles every engine component reads through.

use std::sync::Arc;

use testpulse_state::fakes::{
    MemoryAreaStore, MemoryCommitStore, MemoryDefectStore, MemoryJobQueue, MemoryTestRunStore,
    MemoryTestStore,
};
use testpulse_state::{AreaStore, CommitStore, DefectStore, JobQueue, TestRunStore, TestStore};

/// Shared, cheaply clonable handles to the external stores.
#[derive(Clone)]
pub struct StoreSet {
    pub commits: Arc<dyn CommitStore>,
    pub areas: Arc<dyn AreaStore>,
    pub tests: Arc<dyn TestStore>,
    pub runs: Arc<dyn TestRunStore>,
    pub defects: Arc<dyn DefectStore>,
    pub jobs: Arc<dyn JobQueue>,
}

/// Concrete in-memory stores, kept typed so callers can seed them.
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub commits: Arc<MemoryCommitStore>,
    pub areas: Arc<MemoryAreaStore>,
    pub tests: Arc<MemoryTestStore>,
    pub runs: Arc<MemoryTestRunStore>,
    pub defects: Arc<MemoryDefectStore>,
    pub jobs: Arc<MemoryJobQueue>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-erased view over the same stores.
    pub fn store_set(&self) -> StoreSet {
        StoreSet {
            commits: self.commits.clone(),
            areas: self.areas.clone(),
            tests: self.tests.clone(),
            runs: self.runs.clone(),
            defects: self.defects.clone(),
            jobs: self.jobs.clone(),
        }
    }
}
