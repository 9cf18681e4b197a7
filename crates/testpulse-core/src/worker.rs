//! Background trace worker.
//!
//! Claims trace jobs from a [`JobQueue`] and runs them on the
//! [`CausalityTracer`], several at a time. Each job ends either completed or
//! failed with the error text; a failed job (typically a depth overrun) can
//! be enqueued again with a larger bound via [`TraceJob::with_max_depth`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use testpulse_state::{JobId, JobQueue, TraceJob};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::obs;
use crate::tracer::{CausalityTracer, TraceOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub completed: usize,
    pub failed: usize,
    /// Jobs that failed, with the error each one reported.
    pub failures: Vec<(JobId, String)>,
}

pub struct TraceWorker {
    jobs: Arc<dyn JobQueue>,
    tracer: Arc<CausalityTracer>,
    concurrency: usize,
}

impl TraceWorker {
    pub fn new(jobs: Arc<dyn JobQueue>, tracer: Arc<CausalityTracer>, concurrency: usize) -> Self {
        Self {
            jobs,
            tracer,
            concurrency: concurrency.max(1),
        }
    }

    /// Process jobs until the queue is empty and nothing is in flight.
    ///
    /// Every claimed job is settled before returning. A tracer error or a
    /// panic fails only its job; a failure to record the outcome is logged.
    /// A dequeue error stops claiming new jobs and is returned once the jobs
    /// already in flight have settled.
    pub async fn drain(&self) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        let mut join_set: JoinSet<(JobId, Result<TraceOutcome>)> = JoinSet::new();
        let mut dequeue_error: Option<EngineError> = None;

        loop {
            while dequeue_error.is_none() && join_set.len() < self.concurrency {
                match self.jobs.dequeue().await {
                    Ok(Some((job_id, job))) => {
                        join_set.spawn(run(Arc::clone(&self.tracer), job_id, job));
                    }
                    Ok(None) => break,
                    Err(e) => dequeue_error = Some(e.into()),
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (job_id, result) = match joined {
                Ok(settled) => settled,
                // run() catches panics, so only cancellation lands here.
                Err(e) => {
                    warn!(error = %e, "trace task did not finish");
                    report.failed += 1;
                    continue;
                }
            };
            match result {
                Ok(_) => {
                    if let Err(e) = self.jobs.complete(&job_id).await {
                        obs::emit_lookup_degraded("complete_job", &e);
                    }
                    report.completed += 1;
                }
                Err(e) => {
                    obs::emit_trace_failed(job_id.as_str(), &e);
                    let message = e.to_string();
                    if let Err(e) = self.jobs.fail(&job_id, &message).await {
                        obs::emit_lookup_degraded("fail_job", &e);
                    }
                    report.failed += 1;
                    report.failures.push((job_id, message));
                }
            }
        }

        info!(
            event = "worker.drained",
            completed = report.completed,
            failed = report.failed
        );
        match dequeue_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

async fn run(
    tracer: Arc<CausalityTracer>,
    job_id: JobId,
    job: TraceJob,
) -> (JobId, Result<TraceOutcome>) {
    let result = AssertUnwindSafe(async { tracer.run_job(&job).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(EngineError::Worker("trace task panicked".into())));
    (job_id, result)
}
