//! Structured observability hooks for classification and defect lifecycle
//! events.
//!
//! This module provides:
//! - Defect-scoped tracing spans via [`defect_span`]
//! - Emission functions for key events: classification, defect
//!   creation/reopen/close, trace enqueue/finish, predictor fallback
//!
//! Events are emitted at `info!` level except fallbacks and failures, which
//! use `warn!`. Filtering follows `RUST_LOG` (see [`crate::telemetry`]).

use tracing::{info, warn};

use crate::metrics::METRICS;

/// Fingerprint-scoped span attached (via `tracing::Instrument`) to the work
/// of applying one result to the defect automaton.
pub fn defect_span(project_id: &str, fingerprint: &str) -> tracing::Span {
    tracing::info_span!(
        "testpulse.defect",
        project_id = %project_id,
        fingerprint = %fingerprint,
    )
}

/// Emit event: a classification finished.
pub fn emit_classification(
    project_id: &str,
    source: &str,
    commits: usize,
    high: usize,
    medium: usize,
    low: usize,
    unassigned: usize,
) {
    info!(
        event = "classifier.completed",
        project_id = %project_id,
        source = %source,
        commits = commits,
        high = high,
        medium = medium,
        low = low,
        unassigned = unassigned,
    );
}

/// Emit event: ML predictor output was not used (warn level).
pub fn emit_predictor_fallback(suite_id: &str, reason: &dyn std::fmt::Display) {
    METRICS.inc_predictor_fallbacks();
    warn!(event = "classifier.predictor_fallback", suite_id = %suite_id, reason = %reason);
}

pub fn emit_defect_created(defect_id: &str, defect_type: &str, test_id: &str) {
    METRICS.inc_defects_created();
    info!(
        event = "defect.created",
        defect_id = %defect_id,
        defect_type = %defect_type,
        test_id = %test_id,
    );
}

pub fn emit_defect_reopened(defect_id: &str, original_defect_id: &str) {
    METRICS.inc_defects_reopened();
    info!(
        event = "defect.reopened",
        defect_id = %defect_id,
        original_defect_id = %original_defect_id,
    );
}

/// Emit event: a defect was closed, by a commit or by hand.
pub fn emit_defect_closed(defect_id: &str, commit_id: Option<&str>) {
    METRICS.inc_defects_closed();
    info!(
        event = "defect.closed",
        defect_id = %defect_id,
        commit_id = commit_id.unwrap_or("manual"),
    );
}

pub fn emit_trace_enqueued(job_id: &str, kind: &str, defect_id: &str, commit_id: &str) {
    METRICS.inc_traces_enqueued();
    info!(
        event = "trace.enqueued",
        job_id = %job_id,
        kind = %kind,
        defect_id = %defect_id,
        commit_id = %commit_id,
    );
}

/// Emit event: a trace finished and attributed `added` new commits.
pub fn emit_trace_finished(defect_id: &str, kind: &str, visited: usize, added: usize) {
    METRICS.inc_traces_completed();
    info!(
        event = "trace.finished",
        defect_id = %defect_id,
        kind = %kind,
        visited = visited,
        added = added,
    );
}

/// Emit event: a trace job failed (warn level).
pub fn emit_trace_failed(job_id: &str, error: &dyn std::fmt::Display) {
    METRICS.inc_traces_failed();
    warn!(event = "trace.failed", job_id = %job_id, error = %error);
}

/// Emit event: an auxiliary lookup failed and the transition went on without it.
pub fn emit_lookup_degraded(what: &str, error: &dyn std::fmt::Display) {
    warn!(event = "defect.lookup_degraded", lookup = %what, error = %error);
}
