//! Error types for testpulse-state

use thiserror::Error;

/// Errors raised by store implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The backing datastore rejected or failed the operation
    #[error("backend failure: {0}")]
    Backend(String),

    /// Job id unknown to the queue
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Job is not in the state the operation requires
    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidJobState {
        job_id: String,
        status: String,
        expected: String,
    },
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
