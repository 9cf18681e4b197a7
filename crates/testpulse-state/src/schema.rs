//! Entity records shared between the engine and its stores
//!
//! Records:
//! - commits: VCS commits (graph nodes with parent edges and branch membership)
//! - areas / files: the code map tests and commits are associated with
//! - tests / suites / runs / results: what ran and how it went
//! - defects: failure records driven by the defect automaton

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    AreaId, CommitId, DefectId, FileId, ProjectId, ResultId, SuiteId, TestId, TestRunId,
};

/// Name of the synthetic catch-all area every project carries.
pub const DEFAULT_AREA_NAME: &str = "Default Area";

// ---------------------------------------------------------------------------
// Commits and the code map
// ---------------------------------------------------------------------------

/// A VCS commit.
///
/// `parents` is empty for a root commit and has several entries for a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub project_id: ProjectId,
    pub sha: String,
    /// Short, human-facing identifier. Two rows with the same display id are
    /// the same logical commit (e.g. imported twice from different branches).
    pub display_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parents: Vec<CommitId>,
    #[serde(default)]
    pub branches: BTreeSet<String>,
    #[serde(default)]
    pub areas: BTreeSet<AreaId>,
    #[serde(default)]
    pub files: BTreeSet<FileId>,
    #[serde(default)]
    pub riskiness: f64,
}

impl Commit {
    /// Create a root commit with no branches, areas or files.
    ///
    /// The display id is the first 8 characters of the sha.
    pub fn new(project_id: ProjectId, sha: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let sha = sha.into();
        let display_id = sha.chars().take(8).collect();
        Self {
            id: CommitId::new(),
            project_id,
            sha,
            display_id,
            timestamp,
            parents: Vec::new(),
            branches: BTreeSet::new(),
            areas: BTreeSet::new(),
            files: BTreeSet::new(),
            riskiness: 0.0,
        }
    }

    pub fn with_parent(mut self, parent: &CommitId) -> Self {
        self.parents.push(parent.clone());
        self
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branches.insert(branch.into());
        self
    }

    pub fn touching(mut self, file: &FileId) -> Self {
        self.files.insert(file.clone());
        self
    }

    pub fn in_area(mut self, area: &AreaId) -> Self {
        self.areas.insert(area.clone());
        self
    }

    pub fn is_on_branch(&self, branch: &str) -> bool {
        self.branches.contains(branch)
    }

    /// True when the two commits have at least one branch in common.
    pub fn shares_branch_with(&self, other: &Commit) -> bool {
        self.branches.intersection(&other.branches).next().is_some()
    }
}

/// A functional area of the codebase.
///
/// Dependency edges are directed (`self` depends on each entry) and are not
/// guaranteed to be acyclic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub dependencies: BTreeSet<AreaId>,
}

impl Area {
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id: AreaId::new(),
            project_id,
            name: name.into(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, area: &AreaId) -> Self {
        self.dependencies.insert(area.clone());
        self
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_AREA_NAME
    }
}

/// A node of the project's file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    pub project_id: ProjectId,
    pub path: String,
    #[serde(default)]
    pub parent: Option<FileId>,
    #[serde(default)]
    pub areas: BTreeSet<AreaId>,
}

impl File {
    pub fn new(project_id: ProjectId, path: impl Into<String>) -> Self {
        Self {
            id: FileId::new(),
            project_id,
            path: path.into(),
            parent: None,
            areas: BTreeSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests and their executions
// ---------------------------------------------------------------------------

/// A test known to the project.
///
/// Several rows may share a `name`; they are the same logical test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub id: TestId,
    pub project_id: ProjectId,
    pub name: String,
    /// The area the test itself lives in.
    #[serde(default)]
    pub area: Option<AreaId>,
    #[serde(default)]
    pub associated_files: BTreeSet<FileId>,
    #[serde(default)]
    pub associated_areas: BTreeSet<AreaId>,
    #[serde(default)]
    pub priority: i32,
}

impl Test {
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id: TestId::new(),
            project_id,
            name: name.into(),
            area: None,
            associated_files: BTreeSet::new(),
            associated_areas: BTreeSet::new(),
            priority: 0,
        }
    }

    pub fn with_file(mut self, file: &FileId) -> Self {
        self.associated_files.insert(file.clone());
        self
    }

    pub fn with_area(mut self, area: &AreaId) -> Self {
        self.associated_areas.insert(area.clone());
        self
    }

    pub fn located_in(mut self, area: &AreaId) -> Self {
        self.area = Some(area.clone());
        self
    }

    /// True when the test is linked to at least one file or area.
    pub fn has_associations(&self) -> bool {
        !self.associated_files.is_empty() || !self.associated_areas.is_empty()
    }
}

/// A named group of tests that run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: SuiteId,
    pub project_id: ProjectId,
    pub name: String,
    /// Close defects automatically once their tests pass again.
    #[serde(default = "default_auto_close")]
    pub auto_close_defects: bool,
}

fn default_auto_close() -> bool {
    true
}

impl TestSuite {
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id: SuiteId::new(),
            project_id,
            name: name.into(),
            auto_close_defects: true,
        }
    }
}

/// Outcome of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Broken,
    Error,
    NotRun,
    Skipped,
    Pending,
}

impl TestStatus {
    pub fn is_pass(self) -> bool {
        matches!(self, TestStatus::Pass)
    }

    /// Fail, broken and error all count as a failing outcome.
    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Broken | TestStatus::Error)
    }
}

/// One execution of a suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: TestRunId,
    pub project_id: ProjectId,
    pub suite_id: SuiteId,
    #[serde(default)]
    pub commit_id: Option<CommitId>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Run on a developer machine rather than CI.
    #[serde(default)]
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
}

impl TestRun {
    pub fn new(project_id: ProjectId, suite_id: SuiteId, commit_id: Option<CommitId>) -> Self {
        Self {
            id: TestRunId::new(),
            project_id,
            suite_id,
            commit_id,
            branch: None,
            is_local: false,
            created_at: Utc::now(),
        }
    }
}

/// Result of one test (or test step) within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub id: ResultId,
    pub project_id: ProjectId,
    pub run_id: TestRunId,
    pub suite_id: SuiteId,
    pub test_id: TestId,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub commit_id: Option<CommitId>,
    pub status: TestStatus,
    #[serde(default)]
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TestRunResult {
    pub fn new(run: &TestRun, test_id: &TestId, status: TestStatus) -> Self {
        Self {
            id: ResultId::new(),
            project_id: run.project_id.clone(),
            run_id: run.id.clone(),
            suite_id: run.suite_id.clone(),
            test_id: test_id.clone(),
            step: None,
            commit_id: run.commit_id.clone(),
            status,
            failure_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

// ---------------------------------------------------------------------------
// Defects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectType {
    Environmental,
    Flaky,
    Project,
    InvalidTest,
    Local,
    Outside,
    NewTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectStatus {
    New,
    InProgress,
    Ready,
    Closed,
    Verified,
}

impl DefectStatus {
    /// Everything except `Closed` is open.
    pub fn is_open(self) -> bool {
        !matches!(self, DefectStatus::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseType {
    Fixed,
    WontFix,
    Duplicate,
    Obsolete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateType {
    Automatic,
    Manual,
}

/// A defect row.
///
/// Rows are never deleted. Reopening a closed defect produces a new row whose
/// `original_defect` points at the closed one; see [`Defect::reopened_from`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    pub id: DefectId,
    pub project_id: ProjectId,
    /// Normalised failure-message key identifying "the same" failure.
    pub fingerprint: String,
    /// Raw failure message of the result that created the row.
    #[serde(default)]
    pub error: String,
    pub defect_type: DefectType,
    pub status: DefectStatus,
    #[serde(default)]
    pub close_type: Option<CloseType>,
    pub create_type: CreateType,

    #[serde(default)]
    pub associated_tests: BTreeSet<TestId>,
    #[serde(default)]
    pub caused_by_commits: BTreeSet<CommitId>,
    #[serde(default)]
    pub closed_by_commits: BTreeSet<CommitId>,
    #[serde(default)]
    pub created_by_commit: Option<CommitId>,
    #[serde(default)]
    pub closed_commit: Option<CommitId>,
    #[serde(default)]
    pub original_defect: Option<DefectId>,

    #[serde(default)]
    pub found_suites: BTreeSet<SuiteId>,
    #[serde(default)]
    pub found_runs: BTreeSet<TestRunId>,
    #[serde(default)]
    pub found_results: BTreeSet<ResultId>,
    #[serde(default)]
    pub found_commits: BTreeSet<CommitId>,

    #[serde(default)]
    pub caused_by_suite: Option<SuiteId>,
    #[serde(default)]
    pub caused_by_run: Option<TestRunId>,
    #[serde(default)]
    pub caused_by_result: Option<ResultId>,
    #[serde(default)]
    pub reopened_by_run: Option<TestRunId>,
    #[serde(default)]
    pub reopened_by_result: Option<ResultId>,
    #[serde(default)]
    pub closed_by_run: Option<TestRunId>,
    #[serde(default)]
    pub closed_by_result: Option<ResultId>,

    pub create_date: DateTime<Utc>,
    #[serde(default)]
    pub reopen_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_date: Option<DateTime<Utc>>,
}

impl Defect {
    /// Create a fresh `New` defect.
    pub fn new(
        project_id: ProjectId,
        fingerprint: impl Into<String>,
        error: impl Into<String>,
        defect_type: DefectType,
        create_type: CreateType,
    ) -> Self {
        Self {
            id: DefectId::new(),
            project_id,
            fingerprint: fingerprint.into(),
            error: error.into(),
            defect_type,
            status: DefectStatus::New,
            close_type: None,
            create_type,
            associated_tests: BTreeSet::new(),
            caused_by_commits: BTreeSet::new(),
            closed_by_commits: BTreeSet::new(),
            created_by_commit: None,
            closed_commit: None,
            original_defect: None,
            found_suites: BTreeSet::new(),
            found_runs: BTreeSet::new(),
            found_results: BTreeSet::new(),
            found_commits: BTreeSet::new(),
            caused_by_suite: None,
            caused_by_run: None,
            caused_by_result: None,
            reopened_by_run: None,
            reopened_by_result: None,
            closed_by_run: None,
            closed_by_result: None,
            create_date: Utc::now(),
            reopen_date: None,
            close_date: None,
        }
    }

    /// The only way to reopen a closed defect: copy its identity into a new
    /// `New` row linked back through `original_defect`.
    ///
    /// The closed row is left untouched. Commit attributions and run
    /// back-references start empty on the copy.
    pub fn reopened_from(closed: &Defect) -> Self {
        let now = Utc::now();
        Self {
            original_defect: Some(closed.id.clone()),
            associated_tests: closed.associated_tests.clone(),
            reopen_date: Some(now),
            create_date: now,
            ..Defect::new(
                closed.project_id.clone(),
                closed.fingerprint.clone(),
                closed.error.clone(),
                closed.defect_type,
                closed.create_type,
            )
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Defects the automaton may close or reclassify on its own.
    pub fn is_auto_managed(&self) -> bool {
        !matches!(
            self.defect_type,
            DefectType::Flaky | DefectType::Environmental
        )
    }
}
