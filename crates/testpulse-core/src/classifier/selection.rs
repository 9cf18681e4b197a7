//! Commit-set resolution for a classification request.

use serde::{Deserialize, Serialize};
use testpulse_state::{Commit, CommitId, ProjectId};

use crate::error::{EngineError, Result};
use crate::graph::CommitGraph;

use super::ClassifyRequest;

/// How the commit set `C` is derived from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitSelection {
    /// `{commit}`.
    Single,
    /// Every branch commit since the suite last ran.
    LastRun,
    /// Branch commits between `from_commit` and `commit`, both included.
    BetweenInclusive,
    /// As `BetweenInclusive`, without the later endpoint.
    BetweenExclusive,
}

/// Version-control flavour of the project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoKind {
    #[default]
    Git,
    /// Changelist-based; branch-relative percent selection is undefined.
    Perforce,
}

fn required<'a, T>(value: Option<&'a T>, what: &str, mode: CommitSelection) -> Result<&'a T>
where
    T: ?Sized,
{
    value.ok_or_else(|| {
        EngineError::AmbiguousCommitReference(format!("{what} is required for {mode:?} selection"))
    })
}

pub(crate) async fn project_commit(
    graph: &CommitGraph,
    project: &ProjectId,
    id: &CommitId,
) -> Result<Commit> {
    let commit = graph.commit(id).await?;
    if &commit.project_id != project {
        return Err(EngineError::InvalidRequest(format!(
            "commit {id} does not belong to project {project}"
        )));
    }
    Ok(commit)
}

/// Resolve the request's commit set, oldest first.
///
/// Missing arguments for the chosen mode are an `AmbiguousCommitReference`.
/// `LastRun` always contains the requested commit, even when the branch
/// query comes back empty.
pub(crate) async fn resolve(graph: &CommitGraph, req: &ClassifyRequest) -> Result<Vec<Commit>> {
    let mode = req.mode;
    let commit_id = required(req.commit.as_ref(), "commit", mode)?;
    let commit = project_commit(graph, &req.project, commit_id).await?;

    match mode {
        CommitSelection::Single => Ok(vec![commit]),
        CommitSelection::LastRun => {
            let branch = required(req.target_branch.as_deref(), "target branch", mode)?;
            let suite = required(req.test_suite.as_ref(), "test suite", mode)?;
            let last = graph
                .last_run_commit(&req.project, branch, Some(suite), &commit)
                .await?;
            let commits = graph.commits_between(branch, &commit, &last, false).await?;
            if commits.is_empty() {
                return Ok(vec![commit]);
            }
            Ok(commits)
        }
        CommitSelection::BetweenInclusive | CommitSelection::BetweenExclusive => {
            let branch = required(req.target_branch.as_deref(), "target branch", mode)?;
            let from_id = required(req.from_commit.as_ref(), "from commit", mode)?;
            let from = project_commit(graph, &req.project, from_id).await?;
            graph
                .commits_between(
                    branch,
                    &from,
                    &commit,
                    mode == CommitSelection::BetweenExclusive,
                )
                .await
        }
    }
}
