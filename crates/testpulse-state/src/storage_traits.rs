//! Store trait definitions for testpulse
//!
//! These traits define the engine's view of the external datastore:
//! - `CommitStore`: commits, their parents, files and areas
//! - `AreaStore`: the project's area and file map
//! - `TestStore`: tests of a project
//! - `TestRunStore`: suites, runs and per-test results
//! - `DefectStore`: defect rows (read by fingerprint, written whole)
//! - `JobQueue`: background trace jobs
//!
//! All traits are async and backend-agnostic. Query methods are eager: they
//! return owned collections computed once per call. In-memory fakes are
//! provided for testing via the `fakes` module.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::ids::{
    AreaId, CommitId, DefectId, FileId, JobId, ProjectId, SuiteId, TestId, TestRunId,
};
use crate::schema::{
    Area, Commit, Defect, File, Test, TestRun, TestRunResult, TestStatus, TestSuite,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CommitStore
// ---------------------------------------------------------------------------

/// Simple commit predicate. Unset fields match everything; time bounds are
/// inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitFilter {
    pub branch: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl CommitFilter {
    pub fn on_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Self::default()
        }
    }

    pub fn since(mut self, ts: DateTime<Utc>) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: DateTime<Utc>) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn matches(&self, commit: &Commit) -> bool {
        if let Some(branch) = &self.branch {
            if !commit.is_on_branch(branch) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if commit.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if commit.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Read access to commits.
#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Fetch a commit by id.
    async fn get(&self, id: &CommitId) -> StorageResult<Option<Commit>>;

    /// Commits of `project` matching `filter`, ordered by timestamp ascending.
    async fn find(&self, project: &ProjectId, filter: &CommitFilter) -> StorageResult<Vec<Commit>>;

    /// Direct parents of `commit`. Parents missing from the store are skipped.
    async fn parents_of(&self, commit: &Commit) -> StorageResult<Vec<Commit>>;

    /// Files changed by the commit.
    async fn files_changed(&self, id: &CommitId) -> StorageResult<BTreeSet<FileId>>;

    /// Areas touched by the commit.
    async fn areas_of(&self, id: &CommitId) -> StorageResult<BTreeSet<AreaId>>;
}

// ---------------------------------------------------------------------------
// AreaStore
// ---------------------------------------------------------------------------

/// Read access to the project's code map.
#[async_trait]
pub trait AreaStore: Send + Sync {
    async fn areas(&self, project: &ProjectId) -> StorageResult<Vec<Area>>;

    /// The project's synthetic "Default Area", if it has one.
    async fn default_area(&self, project: &ProjectId) -> StorageResult<Option<Area>>;

    async fn files(&self, project: &ProjectId) -> StorageResult<Vec<File>>;
}

// ---------------------------------------------------------------------------
// TestStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TestStore: Send + Sync {
    /// All tests of `project`, ordered by id.
    async fn tests(&self, project: &ProjectId) -> StorageResult<Vec<Test>>;

    async fn get(&self, id: &TestId) -> StorageResult<Option<Test>>;
}

// ---------------------------------------------------------------------------
// TestRunStore
// ---------------------------------------------------------------------------

/// Read access to suites, runs and results.
#[async_trait]
pub trait TestRunStore: Send + Sync {
    async fn suite(&self, id: &SuiteId) -> StorageResult<Option<TestSuite>>;

    async fn run(&self, id: &TestRunId) -> StorageResult<Option<TestRun>>;

    /// Runs of a suite, oldest first.
    async fn runs_for_suite(&self, suite: &SuiteId) -> StorageResult<Vec<TestRun>>;

    /// Number of recorded runs for a suite.
    async fn count_runs(&self, suite: &SuiteId) -> StorageResult<usize>;

    /// Every result recorded against `commit`, optionally restricted to one
    /// suite, oldest first.
    async fn results_for_commit(
        &self,
        project: &ProjectId,
        commit: &CommitId,
        suite: Option<&SuiteId>,
    ) -> StorageResult<Vec<TestRunResult>>;

    /// Most recent result of a test, optionally restricted to one suite.
    async fn latest_for_test(
        &self,
        test: &TestId,
        suite: Option<&SuiteId>,
    ) -> StorageResult<Option<TestRunResult>>;

    /// Statuses of the last `limit` results for (test, suite, commit), newest
    /// first. `commit = None` ignores the commit.
    async fn history_for(
        &self,
        test: &TestId,
        suite: &SuiteId,
        commit: Option<&CommitId>,
        limit: usize,
    ) -> StorageResult<Vec<TestStatus>>;
}

// ---------------------------------------------------------------------------
// DefectStore
// ---------------------------------------------------------------------------

/// Defect persistence.
///
/// Rows are only ever inserted or replaced whole; there is no delete.
#[async_trait]
pub trait DefectStore: Send + Sync {
    async fn get(&self, id: &DefectId) -> StorageResult<Option<Defect>>;

    /// Every row (open, closed, reopened copies) carrying `fingerprint`,
    /// oldest first.
    async fn find_by_fingerprint(
        &self,
        project: &ProjectId,
        fingerprint: &str,
    ) -> StorageResult<Vec<Defect>>;

    /// Defects whose `associated_tests` contain `test`.
    async fn defects_for_test(&self, test: &TestId) -> StorageResult<Vec<Defect>>;

    async fn defects(&self, project: &ProjectId) -> StorageResult<Vec<Defect>>;

    /// Insert or replace a defect row.
    async fn save(&self, defect: &Defect) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Which attribution a trace job computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// Walk back to the commits that introduced the failure.
    CausedBy,
    /// Walk back to the commits that fixed it.
    ClosedBy,
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceKind::CausedBy => write!(f, "caused_by"),
            TraceKind::ClosedBy => write!(f, "closed_by"),
        }
    }
}

/// A causal-commit trace request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceJob {
    pub kind: TraceKind,
    pub defect_id: DefectId,
    pub commit_id: CommitId,
    #[serde(default)]
    pub suite_id: Option<SuiteId>,
    /// Overrides the configured depth bound (manual re-trigger).
    #[serde(default)]
    pub max_depth: Option<usize>,
}

impl TraceJob {
    pub fn caused_by(defect_id: DefectId, commit_id: CommitId, suite_id: Option<SuiteId>) -> Self {
        Self {
            kind: TraceKind::CausedBy,
            defect_id,
            commit_id,
            suite_id,
            max_depth: None,
        }
    }

    pub fn closed_by(defect_id: DefectId, commit_id: CommitId, suite_id: Option<SuiteId>) -> Self {
        Self {
            kind: TraceKind::ClosedBy,
            defect_id,
            commit_id,
            suite_id,
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    /// Jobs with equal keys have identical effects.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.kind, self.defect_id, self.commit_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job: TraceJob,
    pub status: JobStatus,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Background job queue.
///
/// Contract:
/// - Delivery is at-least-once; job effects are idempotent.
/// - Enqueueing a job whose idempotency key is already queued returns the
///   existing job id instead of a duplicate.
/// - A job moves Queued → Running → Completed | Failed. Failed jobs may be
///   enqueued again (e.g. with a higher depth bound).
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: TraceJob) -> StorageResult<JobId>;

    /// Claim the oldest queued job, marking it running.
    async fn dequeue(&self) -> StorageResult<Option<(JobId, TraceJob)>>;

    async fn complete(&self, id: &JobId) -> StorageResult<()>;

    async fn fail(&self, id: &JobId, error: &str) -> StorageResult<()>;

    async fn get(&self, id: &JobId) -> StorageResult<Option<JobRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn filter_bounds_are_inclusive() {
        let now = Utc::now();
        let commit = Commit::new(ProjectId::from("p"), "abc", now).on_branch("main");
        assert!(CommitFilter::on_branch("main")
            .since(now)
            .until(now)
            .matches(&commit));
        assert!(!CommitFilter::on_branch("main")
            .since(now + Duration::seconds(1))
            .matches(&commit));
        assert!(!CommitFilter::on_branch("dev").matches(&commit));
    }

    #[test]
    fn idempotency_key_distinguishes_kind() {
        let a = TraceJob::caused_by(DefectId::from("d"), CommitId::from("c"), None);
        let b = TraceJob::closed_by(DefectId::from("d"), CommitId::from("c"), None);
        assert_ne!(a.idempotency_key(), b.idempotency_key());
        assert_eq!(a.idempotency_key(), a.clone().with_max_depth(80).idempotency_key());
    }
}
