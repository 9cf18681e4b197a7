//! Engine-level error taxonomy.

use testpulse_state::{CommitId, DefectId, DefectStatus, StorageError};

/// Errors surfaced by the engine to its callers.
///
/// Predictor failures never appear here: they are recovered inside the
/// classifier (see [`crate::classifier::PredictorError`]).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("commits {first} and {second} belong to different projects")]
    CrossProject { first: CommitId, second: CommitId },

    #[error(
        "trace of defect {defect_id} exceeded max depth {max_depth} at commit {commit_id}; \
         re-trigger with a higher bound"
    )]
    RecursionLimitExceeded {
        defect_id: DefectId,
        commit_id: CommitId,
        max_depth: usize,
    },

    #[error("ambiguous commit reference: {0}")]
    AmbiguousCommitReference(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("defect {defect_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        defect_id: DefectId,
        from: DefectStatus,
        to: DefectStatus,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("trace worker task failed: {0}")]
    Worker(String),
}

impl EngineError {
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Validation errors are the caller's fault and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::AmbiguousCommitReference(_) | EngineError::InvalidRequest(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
