//! Commit ancestry and ordering queries.
//!
//! The graph is a read-only view over a [`CommitStore`]: nodes are commits,
//! edges are parent links, and branch membership restricts which edges a
//! query may follow. All walks are iterative with a visited set, so long
//! histories do not grow the stack and cyclic or duplicated edges terminate.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use testpulse_state::{
    Commit, CommitFilter, CommitId, CommitStore, ProjectId, SuiteId, TestRunStore,
};
use tracing::instrument;

use crate::config::GraphConfig;
use crate::error::{EngineError, Result};

/// Ancestry/ordering queries over a project's commits.
#[derive(Clone)]
pub struct CommitGraph {
    commits: Arc<dyn CommitStore>,
    runs: Arc<dyn TestRunStore>,
    last_run_window: chrono::Duration,
}

impl CommitGraph {
    pub fn new(
        commits: Arc<dyn CommitStore>,
        runs: Arc<dyn TestRunStore>,
        config: &GraphConfig,
    ) -> Self {
        Self {
            commits,
            runs,
            last_run_window: config.last_run_window(),
        }
    }

    /// Fetch a commit or fail with `NotFound`.
    pub async fn commit(&self, id: &CommitId) -> Result<Commit> {
        self.commits
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("commit", id))
    }

    /// Every commit on `branch` whose timestamp lies between the two
    /// endpoints, ordered oldest first.
    ///
    /// Bounds are inclusive. With `exclusive`, the later endpoint itself is
    /// left out.
    #[instrument(skip(self, first, second), fields(first = %first.id, second = %second.id))]
    pub async fn commits_between(
        &self,
        branch: &str,
        first: &Commit,
        second: &Commit,
        exclusive: bool,
    ) -> Result<Vec<Commit>> {
        ensure_same_project(first, second)?;
        let (earlier, later) = order_by_time(first, second);

        let filter = CommitFilter::on_branch(branch)
            .since(earlier.timestamp)
            .until(later.timestamp);
        let mut commits = self.commits.find(&earlier.project_id, &filter).await?;
        if exclusive {
            commits.retain(|c| c.id != later.id);
        }
        Ok(commits)
    }

    /// The commit the suite last ran on before `before`.
    ///
    /// Resolution order:
    /// 1. the newest earlier commit on `branch` inside the lookback window,
    /// 2. otherwise the newest earlier commit on `branch`,
    /// 3. otherwise `before` itself.
    ///
    /// When `suite` is given and it has runs on earlier branch commits, only
    /// those commits are candidates.
    #[instrument(skip(self, before), fields(before = %before.id))]
    pub async fn last_run_commit(
        &self,
        project: &ProjectId,
        branch: &str,
        suite: Option<&SuiteId>,
        before: &Commit,
    ) -> Result<Commit> {
        let mut candidates: Vec<Commit> = self
            .commits
            .find(project, &CommitFilter::on_branch(branch).until(before.timestamp))
            .await?
            .into_iter()
            .filter(|c| c.timestamp < before.timestamp)
            .collect();

        if let Some(suite) = suite {
            let ran_on: HashSet<CommitId> = self
                .runs
                .runs_for_suite(suite)
                .await?
                .into_iter()
                .filter_map(|r| r.commit_id)
                .collect();
            if candidates.iter().any(|c| ran_on.contains(&c.id)) {
                candidates.retain(|c| ran_on.contains(&c.id));
            }
        }

        let window_start = before.timestamp - self.last_run_window;
        let newest_in_window = candidates
            .iter()
            .filter(|c| c.timestamp >= window_start)
            .max_by_key(|c| c.timestamp)
            .cloned();
        if let Some(commit) = newest_in_window {
            return Ok(commit);
        }
        Ok(candidates
            .into_iter()
            .max_by_key(|c| c.timestamp)
            .unwrap_or_else(|| before.clone()))
    }

    /// True when `a` and `b` are the same logical commit or one is reachable
    /// from the other along parent edges.
    ///
    /// The walk starts at the later commit and only follows parents that are
    /// not older than the earlier commit and share a branch with both
    /// endpoints.
    #[instrument(skip(self, a, b), fields(a = %a.id, b = %b.id))]
    pub async fn is_connected(&self, a: &Commit, b: &Commit) -> Result<bool> {
        ensure_same_project(a, b)?;
        if a.display_id == b.display_id {
            return Ok(true);
        }
        let (ancestor, descendant) = order_by_time(a, b);

        let mut visited: HashSet<CommitId> = HashSet::new();
        let mut worklist: VecDeque<Commit> = VecDeque::new();
        visited.insert(descendant.id.clone());
        worklist.push_back(descendant.clone());

        while let Some(current) = worklist.pop_front() {
            for parent in self.commits.parents_of(&current).await? {
                if parent.id == ancestor.id || parent.display_id == ancestor.display_id {
                    return Ok(true);
                }
                if parent.timestamp < ancestor.timestamp
                    || !parent.shares_branch_with(ancestor)
                    || !parent.shares_branch_with(descendant)
                {
                    continue;
                }
                if visited.insert(parent.id.clone()) {
                    worklist.push_back(parent);
                }
            }
        }
        Ok(false)
    }
}

fn ensure_same_project(a: &Commit, b: &Commit) -> Result<()> {
    if a.project_id != b.project_id {
        return Err(EngineError::CrossProject {
            first: a.id.clone(),
            second: b.id.clone(),
        });
    }
    Ok(())
}

/// `(earlier, later)`; ties keep argument order.
fn order_by_time<'a>(a: &'a Commit, b: &'a Commit) -> (&'a Commit, &'a Commit) {
    if b.timestamp < a.timestamp {
        (b, a)
    } else {
        (a, b)
    }
}
