//! testpulse-state: entity records and store abstractions
//!
//! This crate is the persistence boundary of the engine. The engine never talks
//! to a database directly; it reads and writes through the async store traits
//! defined here.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: entity shapes, simple query predicates, and the job queue contract.
//!
//! ## Key Components
//!
//! - `Commit`, `Area`, `File`, `Test`, `TestRun`, `TestRunResult`, `Defect`: entity records
//! - `CommitStore`, `TestStore`, `TestRunStore`, `DefectStore`, ...: store traits
//! - `JobQueue` / `TraceJob`: typed background job contract
//! - `fakes`: in-memory implementations of every trait

mod error;
pub mod fakes;
mod ids;
mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use ids::{
    AreaId, CommitId, DefectId, FileId, JobId, ProjectId, ResultId, SuiteId, TestId, TestRunId,
};
pub use schema::{
    Area, CloseType, Commit, CreateType, Defect, DefectStatus, DefectType, File, Test, TestRun,
    TestRunResult, TestStatus, TestSuite, DEFAULT_AREA_NAME,
};
pub use storage_traits::{
    AreaStore, CommitFilter, CommitStore, DefectStore, JobQueue, JobRecord, JobStatus,
    StorageResult, TestRunStore, TestStore, TraceJob, TraceKind,
};
