//! The defect state machine.
//!
//! Results drive the automatic transitions: a failure creates, continues or
//! reopens the defect chain of its fingerprint, and a pass may close the open
//! defects of its test. Manual transitions move a defect through triage.
//!
//! ```text
//! New -> InProgress -> Ready -> Verified
//!   \________\___________\________\____> Closed --(failure)--> new row (New)
//! ```
//!
//! Causal commits are never computed inline: each creation, reopen or close
//! enqueues a [`TraceJob`] and returns its id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use testpulse_state::{
    CloseType, Commit, CommitId, CreateType, Defect, DefectId, DefectStatus, DefectType, JobId,
    TestRun, TestRunResult, TraceJob,
};
use tracing::{debug, instrument, Instrument};

use super::flaky::{looks_flaky, reclassify, reopen_type};
use super::locks::FingerprintLocks;
use crate::config::DefectConfig;
use crate::error::{EngineError, Result};
use crate::fingerprint::fingerprint;
use crate::graph::CommitGraph;
use crate::obs;
use crate::stores::StoreSet;

/// One observable effect of applying a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transition")]
pub enum Transition {
    Created {
        defect_id: DefectId,
        defect_type: DefectType,
    },
    Reopened {
        defect_id: DefectId,
        original_defect_id: DefectId,
    },
    /// An open defect saw the failure again.
    Recorded { defect_id: DefectId },
    Reclassified {
        defect_id: DefectId,
        from: DefectType,
        to: DefectType,
    },
    Closed {
        defect_id: DefectId,
        commit_id: Option<CommitId>,
    },
    /// Neither a pass nor a failure.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectOutcome {
    pub transitions: Vec<Transition>,
    /// Trace jobs enqueued while applying the result.
    pub jobs: Vec<JobId>,
}

pub struct DefectAutomaton {
    stores: StoreSet,
    graph: CommitGraph,
    config: DefectConfig,
    locks: FingerprintLocks,
}

impl DefectAutomaton {
    pub fn new(
        stores: StoreSet,
        graph: CommitGraph,
        config: DefectConfig,
        locks: FingerprintLocks,
    ) -> Self {
        Self {
            stores,
            graph,
            config,
            locks,
        }
    }

    /// Apply one stored result.
    ///
    /// The result must already be persisted: the pass path reads the latest
    /// result of every associated test, this one included.
    #[instrument(skip(self, result), fields(result_id = %result.id, status = ?result.status))]
    pub async fn handle_result(&self, result: &TestRunResult) -> Result<DefectOutcome> {
        if result.status.is_failure() {
            let fp = fingerprint(result.failure_message.as_deref(), &result.test_id);
            let span = obs::defect_span(result.project_id.as_str(), &fp);
            self.on_failure(result, fp).instrument(span).await
        } else if result.status.is_pass() {
            self.on_pass(result).await
        } else {
            Ok(DefectOutcome {
                transitions: vec![Transition::Ignored],
                jobs: Vec::new(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    async fn on_failure(&self, result: &TestRunResult, fp: String) -> Result<DefectOutcome> {
        let _guard = self.locks.acquire(&result.project_id, &fp).await;
        let chain = self
            .stores
            .defects
            .find_by_fingerprint(&result.project_id, &fp)
            .await?;
        let mut outcome = DefectOutcome::default();

        if let Some(open) = chain.iter().filter(|d| d.is_open()).last() {
            let mut defect = open.clone();
            record_sighting(&mut defect, result);
            let flaky = self.looks_flaky(result).await;
            if let Some(t) = reclassify_in_place(&mut defect, flaky) {
                outcome.transitions.push(t);
            }
            self.stores.defects.save(&defect).await?;
            debug!(defect_id = %defect.id, "failure recorded on open defect");
            outcome.transitions.push(Transition::Recorded {
                defect_id: defect.id,
            });
            return Ok(outcome);
        }

        let run = self.lookup_run(result).await;
        let latest_closed = chain
            .iter()
            .filter(|d| !chain.iter().any(|o| o.original_defect.as_ref() == Some(&d.id)))
            .last();

        let defect = match latest_closed {
            Some(closed) => {
                let mut defect = Defect::reopened_from(closed);
                record_sighting(&mut defect, result);
                defect.created_by_commit = result.commit_id.clone();
                defect.caused_by_suite = Some(result.suite_id.clone());
                defect.caused_by_run = Some(result.run_id.clone());
                defect.caused_by_result = Some(result.id.clone());
                defect.reopened_by_run = Some(result.run_id.clone());
                defect.reopened_by_result = Some(result.id.clone());
                let local = run.as_ref().is_some_and(|r| r.is_local);
                let flaky = !local && self.looks_flaky(result).await;
                defect.defect_type = reopen_type(defect.defect_type, local, flaky);
                self.stores.defects.save(&defect).await?;
                obs::emit_defect_reopened(defect.id.as_str(), closed.id.as_str());
                outcome.transitions.push(Transition::Reopened {
                    defect_id: defect.id.clone(),
                    original_defect_id: closed.id.clone(),
                });
                defect
            }
            None => {
                let defect_type = if run.as_ref().is_some_and(|r| r.is_local) {
                    DefectType::Local
                } else if self.looks_flaky(result).await {
                    DefectType::Flaky
                } else {
                    DefectType::Project
                };
                let mut defect = Defect::new(
                    result.project_id.clone(),
                    fp,
                    result.failure_message.clone().unwrap_or_default(),
                    defect_type,
                    CreateType::Automatic,
                );
                record_sighting(&mut defect, result);
                defect.created_by_commit = result.commit_id.clone();
                defect.caused_by_suite = Some(result.suite_id.clone());
                defect.caused_by_run = Some(result.run_id.clone());
                defect.caused_by_result = Some(result.id.clone());
                self.stores.defects.save(&defect).await?;
                obs::emit_defect_created(
                    defect.id.as_str(),
                    &format!("{defect_type:?}"),
                    result.test_id.as_str(),
                );
                outcome.transitions.push(Transition::Created {
                    defect_id: defect.id.clone(),
                    defect_type,
                });
                defect
            }
        };

        if let Some(commit) = &result.commit_id {
            let job = TraceJob::caused_by(
                defect.id.clone(),
                commit.clone(),
                Some(result.suite_id.clone()),
            );
            self.enqueue(job, &mut outcome).await;
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    async fn on_pass(&self, result: &TestRunResult) -> Result<DefectOutcome> {
        let candidates = self
            .stores
            .defects
            .defects_for_test(&result.test_id)
            .await?;
        let mut outcome = DefectOutcome::default();

        for candidate in candidates {
            if candidate.project_id != result.project_id
                || !candidate.is_open()
                || !candidate.is_auto_managed()
            {
                continue;
            }
            let span = obs::defect_span(result.project_id.as_str(), &candidate.fingerprint);
            self.apply_pass(result, &candidate, &mut outcome)
                .instrument(span)
                .await?;
        }
        Ok(outcome)
    }

    async fn apply_pass(
        &self,
        result: &TestRunResult,
        candidate: &Defect,
        outcome: &mut DefectOutcome,
    ) -> Result<()> {
        let _guard = self
            .locks
            .acquire(&candidate.project_id, &candidate.fingerprint)
            .await;
        // Another transition may have moved it while we waited.
        let Some(mut defect) = self.stores.defects.get(&candidate.id).await? else {
            return Ok(());
        };
        if !defect.is_open() || !defect.is_auto_managed() {
            return Ok(());
        }

        if !self.still_failing(&defect).await
            && self.auto_close_enabled(result).await
            && self.fixed_by(&defect, result).await
        {
            defect.status = DefectStatus::Closed;
            defect.close_type = Some(CloseType::Fixed);
            defect.close_date = Some(Utc::now());
            defect.closed_commit = result.commit_id.clone();
            defect.closed_by_run = Some(result.run_id.clone());
            defect.closed_by_result = Some(result.id.clone());
            self.stores.defects.save(&defect).await?;
            obs::emit_defect_closed(
                defect.id.as_str(),
                result.commit_id.as_ref().map(|c| c.as_str()),
            );
            outcome.transitions.push(Transition::Closed {
                defect_id: defect.id.clone(),
                commit_id: result.commit_id.clone(),
            });
            if let Some(commit) = &result.commit_id {
                let job = TraceJob::closed_by(
                    defect.id.clone(),
                    commit.clone(),
                    Some(result.suite_id.clone()),
                );
                self.enqueue(job, outcome).await;
            }
            return Ok(());
        }

        let flaky = self.looks_flaky(result).await;
        if let Some(t) = reclassify_in_place(&mut defect, flaky) {
            self.stores.defects.save(&defect).await?;
            outcome.transitions.push(t);
        }
        Ok(())
    }

    /// True when any associated test's latest result, in any suite, failed.
    /// Lookup failures count as still failing.
    async fn still_failing(&self, defect: &Defect) -> bool {
        for test in &defect.associated_tests {
            match self.stores.runs.latest_for_test(test, None).await {
                Ok(Some(latest)) if latest.status.is_failure() => return true,
                Ok(_) => {}
                Err(e) => {
                    obs::emit_lookup_degraded("latest_result", &e);
                    return true;
                }
            }
        }
        false
    }

    async fn auto_close_enabled(&self, result: &TestRunResult) -> bool {
        match self.stores.runs.suite(&result.suite_id).await {
            Ok(Some(suite)) => suite.auto_close_defects,
            Ok(None) => self.config.auto_close_default,
            Err(e) => {
                obs::emit_lookup_degraded("suite", &e);
                self.config.auto_close_default
            }
        }
    }

    /// Whether the passing commit can have fixed the defect: it is not older
    /// than the commit that created the defect and the two are connected.
    async fn fixed_by(&self, defect: &Defect, result: &TestRunResult) -> bool {
        let Some(created_id) = &defect.created_by_commit else {
            return true;
        };
        let Some(passing_id) = &result.commit_id else {
            return false;
        };
        let commits = async {
            let created = self.graph.commit(created_id).await?;
            let passing = self.graph.commit(passing_id).await?;
            Ok::<(Commit, Commit), EngineError>((created, passing))
        };
        let (created, passing) = match commits.await {
            Ok(pair) => pair,
            Err(e) => {
                obs::emit_lookup_degraded("close_commits", &e);
                return false;
            }
        };
        if passing.timestamp < created.timestamp {
            return false;
        }
        match self.graph.is_connected(&created, &passing).await {
            Ok(connected) => connected,
            Err(e) => {
                obs::emit_lookup_degraded("is_connected", &e);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Manual transitions
    // -----------------------------------------------------------------------

    pub async fn start_progress(&self, id: &DefectId) -> Result<Defect> {
        self.manual(id, DefectStatus::InProgress, None).await
    }

    pub async fn mark_ready(&self, id: &DefectId) -> Result<Defect> {
        self.manual(id, DefectStatus::Ready, None).await
    }

    pub async fn verify(&self, id: &DefectId) -> Result<Defect> {
        self.manual(id, DefectStatus::Verified, None).await
    }

    /// Close an open defect by hand, with no closing commit.
    pub async fn close_manually(&self, id: &DefectId, close_type: CloseType) -> Result<Defect> {
        self.manual(id, DefectStatus::Closed, Some(close_type)).await
    }

    #[instrument(skip(self, id), fields(defect_id = %id))]
    async fn manual(
        &self,
        id: &DefectId,
        to: DefectStatus,
        close_type: Option<CloseType>,
    ) -> Result<Defect> {
        let found = self.require(id).await?;
        let _guard = self.locks.acquire(&found.project_id, &found.fingerprint).await;
        let mut defect = self.require(id).await?;

        let from = defect.status;
        let allowed = match (from, to) {
            (DefectStatus::New, DefectStatus::InProgress)
            | (DefectStatus::InProgress, DefectStatus::Ready)
            | (DefectStatus::Ready, DefectStatus::Verified) => true,
            (from, DefectStatus::Closed) => from.is_open(),
            _ => false,
        };
        if !allowed {
            return Err(EngineError::InvalidTransition {
                defect_id: id.clone(),
                from,
                to,
            });
        }

        defect.status = to;
        if to == DefectStatus::Closed {
            defect.close_type = close_type;
            defect.close_date = Some(Utc::now());
        }
        self.stores.defects.save(&defect).await?;
        if to == DefectStatus::Closed {
            obs::emit_defect_closed(defect.id.as_str(), None);
        }
        Ok(defect)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn require(&self, id: &DefectId) -> Result<Defect> {
        self.stores
            .defects
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("defect", id))
    }

    async fn looks_flaky(&self, result: &TestRunResult) -> bool {
        looks_flaky(
            self.stores.runs.as_ref(),
            result,
            self.config.flaky_history_limit,
        )
        .await
    }

    async fn lookup_run(&self, result: &TestRunResult) -> Option<TestRun> {
        match self.stores.runs.run(&result.run_id).await {
            Ok(run) => run,
            Err(e) => {
                obs::emit_lookup_degraded("run", &e);
                None
            }
        }
    }

    /// Enqueue a trace. A queue failure is logged and does not undo the
    /// transition.
    async fn enqueue(&self, job: TraceJob, outcome: &mut DefectOutcome) {
        let kind = job.kind;
        let defect_id = job.defect_id.clone();
        let commit_id = job.commit_id.clone();
        match self.stores.jobs.enqueue(job).await {
            Ok(job_id) => {
                obs::emit_trace_enqueued(
                    job_id.as_str(),
                    &kind.to_string(),
                    defect_id.as_str(),
                    commit_id.as_str(),
                );
                outcome.jobs.push(job_id);
            }
            Err(e) => obs::emit_lookup_degraded("enqueue_trace", &e),
        }
    }
}

fn record_sighting(defect: &mut Defect, result: &TestRunResult) {
    defect.associated_tests.insert(result.test_id.clone());
    defect.found_suites.insert(result.suite_id.clone());
    defect.found_runs.insert(result.run_id.clone());
    defect.found_results.insert(result.id.clone());
    if let Some(commit) = &result.commit_id {
        defect.found_commits.insert(commit.clone());
    }
}

fn reclassify_in_place(defect: &mut Defect, flaky: bool) -> Option<Transition> {
    let from = defect.defect_type;
    let to = reclassify(from, flaky);
    if from == to {
        return None;
    }
    defect.defect_type = to;
    Some(Transition::Reclassified {
        defect_id: defect.id.clone(),
        from,
        to,
    })
}
