//! In-memory fakes for store traits (testing and fixtures)
//!
//! Provides `MemoryCommitStore`, `MemoryAreaStore`, `MemoryTestStore`,
//! `MemoryTestRunStore`, `MemoryDefectStore` and `MemoryJobQueue` that satisfy
//! the trait contracts without any external dependencies.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::ids::*;
use crate::schema::*;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryCommitStore
// ---------------------------------------------------------------------------

/// In-memory commit store backed by a `HashMap<CommitId, Commit>`.
#[derive(Debug, Default)]
pub struct MemoryCommitStore {
    commits: Mutex<HashMap<CommitId, Commit>>,
}

impl MemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, commit: Commit) {
        let mut commits = self.commits.lock().unwrap();
        commits.insert(commit.id.clone(), commit);
    }

    fn require(&self, id: &CommitId) -> StorageResult<Commit> {
        let commits = self.commits.lock().unwrap();
        commits
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("commit", id))
    }
}

#[async_trait]
impl CommitStore for MemoryCommitStore {
    async fn get(&self, id: &CommitId) -> StorageResult<Option<Commit>> {
        let commits = self.commits.lock().unwrap();
        Ok(commits.get(id).cloned())
    }

    async fn find(&self, project: &ProjectId, filter: &CommitFilter) -> StorageResult<Vec<Commit>> {
        let commits = self.commits.lock().unwrap();
        let mut found: Vec<Commit> = commits
            .values()
            .filter(|c| &c.project_id == project && filter.matches(c))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn parents_of(&self, commit: &Commit) -> StorageResult<Vec<Commit>> {
        let commits = self.commits.lock().unwrap();
        Ok(commit
            .parents
            .iter()
            .filter_map(|id| commits.get(id).cloned())
            .collect())
    }

    async fn files_changed(&self, id: &CommitId) -> StorageResult<BTreeSet<FileId>> {
        Ok(self.require(id)?.files)
    }

    async fn areas_of(&self, id: &CommitId) -> StorageResult<BTreeSet<AreaId>> {
        Ok(self.require(id)?.areas)
    }
}

// ---------------------------------------------------------------------------
// MemoryAreaStore
// ---------------------------------------------------------------------------

/// In-memory code map: areas and files keyed by project.
#[derive(Debug, Default)]
pub struct MemoryAreaStore {
    areas: Mutex<Vec<Area>>,
    files: Mutex<Vec<File>>,
}

impl MemoryAreaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_area(&self, area: Area) {
        let mut areas = self.areas.lock().unwrap();
        areas.retain(|a| a.id != area.id);
        areas.push(area);
    }

    pub fn insert_file(&self, file: File) {
        let mut files = self.files.lock().unwrap();
        files.retain(|f| f.id != file.id);
        files.push(file);
    }
}

#[async_trait]
impl AreaStore for MemoryAreaStore {
    async fn areas(&self, project: &ProjectId) -> StorageResult<Vec<Area>> {
        let areas = self.areas.lock().unwrap();
        Ok(areas
            .iter()
            .filter(|a| &a.project_id == project)
            .cloned()
            .collect())
    }

    async fn default_area(&self, project: &ProjectId) -> StorageResult<Option<Area>> {
        let areas = self.areas.lock().unwrap();
        Ok(areas
            .iter()
            .find(|a| &a.project_id == project && a.is_default())
            .cloned())
    }

    async fn files(&self, project: &ProjectId) -> StorageResult<Vec<File>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|f| &f.project_id == project)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryTestStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryTestStore {
    tests: Mutex<HashMap<TestId, Test>>,
}

impl MemoryTestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, test: Test) {
        let mut tests = self.tests.lock().unwrap();
        tests.insert(test.id.clone(), test);
    }
}

#[async_trait]
impl TestStore for MemoryTestStore {
    async fn tests(&self, project: &ProjectId) -> StorageResult<Vec<Test>> {
        let tests = self.tests.lock().unwrap();
        let mut found: Vec<Test> = tests
            .values()
            .filter(|t| &t.project_id == project)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn get(&self, id: &TestId) -> StorageResult<Option<Test>> {
        let tests = self.tests.lock().unwrap();
        Ok(tests.get(id).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryTestRunStore
// ---------------------------------------------------------------------------

/// In-memory suites, runs and results.
///
/// Results keep insertion order; among results with equal `created_at` the
/// later insertion counts as more recent.
#[derive(Debug, Default)]
pub struct MemoryTestRunStore {
    suites: Mutex<HashMap<SuiteId, TestSuite>>,
    runs: Mutex<Vec<TestRun>>,
    results: Mutex<Vec<TestRunResult>>,
}

impl MemoryTestRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_suite(&self, suite: TestSuite) {
        let mut suites = self.suites.lock().unwrap();
        suites.insert(suite.id.clone(), suite);
    }

    pub fn insert_run(&self, run: TestRun) {
        let mut runs = self.runs.lock().unwrap();
        runs.retain(|r| r.id != run.id);
        runs.push(run);
    }

    pub fn insert_result(&self, result: TestRunResult) {
        let mut results = self.results.lock().unwrap();
        results.push(result);
    }
}

#[async_trait]
impl TestRunStore for MemoryTestRunStore {
    async fn suite(&self, id: &SuiteId) -> StorageResult<Option<TestSuite>> {
        let suites = self.suites.lock().unwrap();
        Ok(suites.get(id).cloned())
    }

    async fn run(&self, id: &TestRunId) -> StorageResult<Option<TestRun>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs.iter().find(|r| &r.id == id).cloned())
    }

    async fn runs_for_suite(&self, suite: &SuiteId) -> StorageResult<Vec<TestRun>> {
        let runs = self.runs.lock().unwrap();
        let mut found: Vec<TestRun> = runs
            .iter()
            .filter(|r| &r.suite_id == suite)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn count_runs(&self, suite: &SuiteId) -> StorageResult<usize> {
        let runs = self.runs.lock().unwrap();
        Ok(runs.iter().filter(|r| &r.suite_id == suite).count())
    }

    async fn results_for_commit(
        &self,
        project: &ProjectId,
        commit: &CommitId,
        suite: Option<&SuiteId>,
    ) -> StorageResult<Vec<TestRunResult>> {
        let results = self.results.lock().unwrap();
        let mut found: Vec<TestRunResult> = results
            .iter()
            .filter(|r| {
                &r.project_id == project
                    && r.commit_id.as_ref() == Some(commit)
                    && suite.map(|s| &r.suite_id == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn latest_for_test(
        &self,
        test: &TestId,
        suite: Option<&SuiteId>,
    ) -> StorageResult<Option<TestRunResult>> {
        let results = self.results.lock().unwrap();
        Ok(results
            .iter()
            .filter(|r| &r.test_id == test && suite.map(|s| &r.suite_id == s).unwrap_or(true))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn history_for(
        &self,
        test: &TestId,
        suite: &SuiteId,
        commit: Option<&CommitId>,
        limit: usize,
    ) -> StorageResult<Vec<TestStatus>> {
        let results = self.results.lock().unwrap();
        let mut matching: Vec<&TestRunResult> = results
            .iter()
            .filter(|r| {
                &r.test_id == test
                    && &r.suite_id == suite
                    && commit.map(|c| r.commit_id.as_ref() == Some(c)).unwrap_or(true)
            })
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse for
        // newest first.
        matching.sort_by_key(|r| r.created_at);
        Ok(matching
            .into_iter()
            .rev()
            .take(limit)
            .map(|r| r.status)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryDefectStore
// ---------------------------------------------------------------------------

/// In-memory defect rows in insertion order.
#[derive(Debug, Default)]
pub struct MemoryDefectStore {
    defects: Mutex<Vec<Defect>>,
}

impl MemoryDefectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows (every reopen adds one).
    pub fn len(&self) -> usize {
        self.defects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DefectStore for MemoryDefectStore {
    async fn get(&self, id: &DefectId) -> StorageResult<Option<Defect>> {
        let defects = self.defects.lock().unwrap();
        Ok(defects.iter().find(|d| &d.id == id).cloned())
    }

    async fn find_by_fingerprint(
        &self,
        project: &ProjectId,
        fingerprint: &str,
    ) -> StorageResult<Vec<Defect>> {
        let defects = self.defects.lock().unwrap();
        Ok(defects
            .iter()
            .filter(|d| &d.project_id == project && d.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    async fn defects_for_test(&self, test: &TestId) -> StorageResult<Vec<Defect>> {
        let defects = self.defects.lock().unwrap();
        Ok(defects
            .iter()
            .filter(|d| d.associated_tests.contains(test))
            .cloned()
            .collect())
    }

    async fn defects(&self, project: &ProjectId) -> StorageResult<Vec<Defect>> {
        let defects = self.defects.lock().unwrap();
        Ok(defects
            .iter()
            .filter(|d| &d.project_id == project)
            .cloned()
            .collect())
    }

    async fn save(&self, defect: &Defect) -> StorageResult<()> {
        let mut defects = self.defects.lock().unwrap();
        match defects.iter_mut().find(|d| d.id == defect.id) {
            Some(existing) => *existing = defect.clone(),
            None => defects.push(defect.clone()),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryJobQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    records: HashMap<JobId, JobRecord>,
    pending: VecDeque<JobId>,
}

/// FIFO job queue backed by a `VecDeque`.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job ever enqueued.
    pub fn records(&self) -> Vec<JobRecord> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<JobRecord> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.enqueued_at);
        records
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: TraceJob) -> StorageResult<JobId> {
        let mut state = self.state.lock().unwrap();
        let key = job.idempotency_key();
        let queued = state.pending.iter().find(|id| {
            state
                .records
                .get(*id)
                .map(|r| r.job.idempotency_key() == key)
                .unwrap_or(false)
        });
        if let Some(existing) = queued {
            tracing::debug!(job_id = %existing, key = %key, "job already queued");
            return Ok(existing.clone());
        }

        let id = JobId::new();
        state.records.insert(
            id.clone(),
            JobRecord {
                id: id.clone(),
                job,
                status: JobStatus::Queued,
                attempts: 0,
                enqueued_at: Utc::now(),
            },
        );
        state.pending.push_back(id.clone());
        Ok(id)
    }

    async fn dequeue(&self) -> StorageResult<Option<(JobId, TraceJob)>> {
        let mut state = self.state.lock().unwrap();
        let Some(id) = state.pending.pop_front() else {
            return Ok(None);
        };
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: id.to_string(),
            })?;
        record.status = JobStatus::Running;
        record.attempts += 1;
        Ok(Some((id, record.job.clone())))
    }

    async fn complete(&self, id: &JobId) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let record = running_record(&mut state, id)?;
        record.status = JobStatus::Completed;
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let record = running_record(&mut state, id)?;
        record.status = JobStatus::Failed {
            error: error.to_string(),
        };
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StorageResult<Option<JobRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.records.get(id).cloned())
    }
}

fn running_record<'a>(state: &'a mut QueueState, id: &JobId) -> StorageResult<&'a mut JobRecord> {
    let record = state
        .records
        .get_mut(id)
        .ok_or_else(|| StorageError::JobNotFound {
            job_id: id.to_string(),
        })?;
    if record.status != JobStatus::Running {
        return Err(StorageError::InvalidJobState {
            job_id: id.to_string(),
            status: format!("{:?}", record.status),
            expected: "Running".to_string(),
        });
    }
    Ok(record)
}
