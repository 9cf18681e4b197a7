//! Commit causality tracer.
//!
//! Starting from the commit a defect was observed on, walk back through the
//! parents and attribute every commit up to (not including) the first parent
//! where the defect's tests behaved the other way: a pass for a
//! caused-by trace, a failure for a closed-by trace. Parents without results
//! are walked through.
//!
//! Traces only add commits to the defect's sets, so replaying a job is
//! harmless. The walk is bounded by a maximum depth; exceeding it fails the
//! trace instead of truncating the attribution.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use testpulse_state::{Commit, CommitId, Defect, DefectId, SuiteId, TestId, TraceJob, TraceKind};
use tracing::{debug, instrument};

use crate::config::TracerConfig;
use crate::defect::FingerprintLocks;
use crate::error::{EngineError, Result};
use crate::obs;
use crate::stores::StoreSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOutcome {
    pub defect_id: DefectId,
    pub kind: TraceKind,
    /// Commits attributed by this walk.
    pub visited: usize,
    /// Commits that were not yet attributed to the defect.
    pub added: usize,
}

pub struct CausalityTracer {
    stores: StoreSet,
    config: TracerConfig,
    locks: FingerprintLocks,
}

impl CausalityTracer {
    pub fn new(stores: StoreSet, config: TracerConfig, locks: FingerprintLocks) -> Self {
        Self {
            stores,
            config,
            locks,
        }
    }

    pub async fn trace_caused(
        &self,
        defect_id: &DefectId,
        commit_id: &CommitId,
        suite: Option<&SuiteId>,
    ) -> Result<TraceOutcome> {
        self.trace(
            TraceKind::CausedBy,
            defect_id,
            commit_id,
            suite,
            self.config.max_depth,
        )
        .await
    }

    pub async fn trace_closed(
        &self,
        defect_id: &DefectId,
        commit_id: &CommitId,
        suite: Option<&SuiteId>,
    ) -> Result<TraceOutcome> {
        self.trace(
            TraceKind::ClosedBy,
            defect_id,
            commit_id,
            suite,
            self.config.max_depth,
        )
        .await
    }

    /// Run a queued job. The job's own depth bound wins over the configured
    /// one.
    pub async fn run_job(&self, job: &TraceJob) -> Result<TraceOutcome> {
        let max_depth = job.max_depth.unwrap_or(self.config.max_depth);
        self.trace(
            job.kind,
            &job.defect_id,
            &job.commit_id,
            job.suite_id.as_ref(),
            max_depth,
        )
        .await
    }

    #[instrument(skip(self, kind, suite), fields(kind = %kind))]
    async fn trace(
        &self,
        kind: TraceKind,
        defect_id: &DefectId,
        commit_id: &CommitId,
        suite: Option<&SuiteId>,
        max_depth: usize,
    ) -> Result<TraceOutcome> {
        let defect = self.require_defect(defect_id).await?;
        let start = self
            .stores
            .commits
            .get(commit_id)
            .await?
            .ok_or_else(|| EngineError::not_found("commit", commit_id))?;

        let found = self.walk(kind, &defect, start, suite, max_depth).await?;
        let visited = found.len();

        let _guard = self
            .locks
            .acquire(&defect.project_id, &defect.fingerprint)
            .await;
        let mut current = self.require_defect(defect_id).await?;
        let target = match kind {
            TraceKind::CausedBy => &mut current.caused_by_commits,
            TraceKind::ClosedBy => &mut current.closed_by_commits,
        };
        let before = target.len();
        target.extend(found);
        let added = target.len() - before;
        if added > 0 {
            self.stores.defects.save(&current).await?;
        }

        obs::emit_trace_finished(defect_id.as_str(), &kind.to_string(), visited, added);
        Ok(TraceOutcome {
            defect_id: defect_id.clone(),
            kind,
            visited,
            added,
        })
    }

    /// Depth-first walk with an explicit stack; the start commit has depth 1.
    async fn walk(
        &self,
        kind: TraceKind,
        defect: &Defect,
        start: Commit,
        suite: Option<&SuiteId>,
        max_depth: usize,
    ) -> Result<BTreeSet<CommitId>> {
        let tests: &BTreeSet<TestId> = &defect.associated_tests;
        let mut found: BTreeSet<CommitId> = BTreeSet::new();
        let mut visited: HashSet<CommitId> = HashSet::new();
        let mut stack: Vec<(Commit, usize)> = vec![(start, 1)];

        while let Some((commit, depth)) = stack.pop() {
            if depth > max_depth {
                return Err(EngineError::RecursionLimitExceeded {
                    defect_id: defect.id.clone(),
                    commit_id: commit.id,
                    max_depth,
                });
            }
            if !visited.insert(commit.id.clone()) {
                continue;
            }
            found.insert(commit.id.clone());

            for parent in self.stores.commits.parents_of(&commit).await? {
                if visited.contains(&parent.id) || parent.project_id != defect.project_id {
                    continue;
                }
                let results = self
                    .stores
                    .runs
                    .results_for_commit(&defect.project_id, &parent.id, suite)
                    .await?;
                let boundary = results
                    .iter()
                    .filter(|r| tests.contains(&r.test_id))
                    .any(|r| match kind {
                        TraceKind::CausedBy => r.status.is_pass(),
                        TraceKind::ClosedBy => r.status.is_failure(),
                    });
                if boundary {
                    debug!(commit_id = %parent.id, "trace boundary");
                    continue;
                }
                stack.push((parent, depth + 1));
            }
        }
        Ok(found)
    }

    async fn require_defect(&self, id: &DefectId) -> Result<Defect> {
        self.stores
            .defects
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("defect", id))
    }
}
