//! Causal commit tracing through the job queue and worker.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::World;
use testpulse_core::{Engine, EngineConfig, EngineError, Transition};
use testpulse_state::fakes::{MemoryDefectStore, MemoryJobQueue};
use testpulse_state::{
    CommitId, CreateType, Defect, DefectId, DefectStore, DefectType, JobId, JobQueue, JobRecord,
    JobStatus, ProjectId, StorageError, StorageResult, TestId, TestStatus, TraceJob, TraceKind,
};

fn created_id(transitions: &[Transition]) -> DefectId {
    transitions
        .iter()
        .find_map(|t| match t {
            Transition::Created { defect_id, .. } => Some(defect_id.clone()),
            _ => None,
        })
        .expect("a defect was created")
}

fn ids(commits: &[testpulse_state::Commit]) -> BTreeSet<CommitId> {
    commits.iter().map(|c| c.id.clone()).collect()
}

#[tokio::test]
async fn caused_trace_stops_below_last_passing_commit() {
    let w = World::new();
    let commits = w.chain(5);
    let test = w.test("cart_totals");
    w.record(&w.run_on(&commits[1]), &test, TestStatus::Pass);

    let created = w.observe(&w.run_on(&commits[4]), &test, TestStatus::Fail).await;
    let id = created_id(&created.transitions);

    let report = w.engine.worker().drain().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let defect = w.stores.defects.get(&id).await.unwrap().unwrap();
    assert_eq!(defect.caused_by_commits, ids(&commits[2..]));
    assert!(defect.closed_by_commits.is_empty());
}

#[tokio::test]
async fn closed_trace_stops_below_last_failing_commit() {
    let w = World::new();
    let commits = w.chain(5);
    let test = w.test("cart_totals");

    let created = w.observe(&w.run_on(&commits[1]), &test, TestStatus::Fail).await;
    let id = created_id(&created.transitions);
    let closed = w.observe(&w.run_on(&commits[4]), &test, TestStatus::Pass).await;
    assert!(matches!(closed.transitions[..], [Transition::Closed { .. }]));

    let report = w.engine.worker().drain().await.unwrap();
    assert_eq!(report.completed, 2);

    let defect = w.stores.defects.get(&id).await.unwrap().unwrap();
    assert_eq!(defect.caused_by_commits, ids(&commits[..2]));
    assert_eq!(defect.closed_by_commits, ids(&commits[2..]));
}

#[tokio::test]
async fn repeated_trace_changes_nothing() {
    let w = World::new();
    let commits = w.chain(3);
    let test = w.test("cart_totals");
    let created = w.observe(&w.run_on(&commits[2]), &test, TestStatus::Fail).await;
    let id = created_id(&created.transitions);
    let tracer = w.engine.tracer();

    let first = tracer
        .trace_caused(&id, &commits[2].id, Some(&w.suite.id))
        .await
        .unwrap();
    assert_eq!(first.visited, 3);
    assert_eq!(first.added, 3);
    let before = w.stores.defects.get(&id).await.unwrap().unwrap();

    let second = tracer
        .trace_caused(&id, &commits[2].id, Some(&w.suite.id))
        .await
        .unwrap();
    assert_eq!(second.visited, 3);
    assert_eq!(second.added, 0);
    let after = w.stores.defects.get(&id).await.unwrap().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn trace_skips_parents_from_other_projects() {
    let w = World::new();
    let foreign = testpulse_state::Commit::new(
        testpulse_state::ProjectId::from("vendored"),
        "f0f0f0f0aa",
        w.at_hours(0),
    )
    .on_branch(common::BRANCH);
    w.save_commit(&foreign);
    let merge = w.commit("4e4e4e4e01", 1, &[&foreign]);
    let test = w.test("import_path");

    let created = w.observe(&w.run_on(&merge), &test, TestStatus::Fail).await;
    let id = created_id(&created.transitions);
    let outcome = w
        .engine
        .tracer()
        .trace_caused(&id, &merge.id, None)
        .await
        .unwrap();
    assert_eq!(outcome.visited, 1);
}

#[tokio::test]
async fn deep_history_needs_larger_bound() {
    let w = World::new();
    let commits = w.chain(51);
    let test = w.test("migration_chain");
    let tip = commits.last().unwrap();
    let created = w.observe(&w.run_on(tip), &test, TestStatus::Fail).await;
    let id = created_id(&created.transitions);

    let report = w.engine.worker().drain().await.unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].1.contains("max depth 50"));
    let failed = &w.stores.jobs.records()[0];
    assert!(matches!(failed.status, JobStatus::Failed { .. }));
    assert!(w
        .stores
        .defects
        .get(&id)
        .await
        .unwrap()
        .unwrap()
        .caused_by_commits
        .is_empty());

    let retry = TraceJob::caused_by(id.clone(), tip.id.clone(), Some(w.suite.id.clone()))
        .with_max_depth(100);
    w.stores.jobs.enqueue(retry).await.unwrap();
    let report = w.engine.worker().drain().await.unwrap();
    assert_eq!(report.completed, 1);

    let defect = w.stores.defects.get(&id).await.unwrap().unwrap();
    assert_eq!(defect.caused_by_commits.len(), 51);
}

#[tokio::test]
async fn direct_trace_reports_depth_overrun() {
    let mut config = EngineConfig::default();
    config.tracer.max_depth = 2;
    let w = World::with_config(config);
    let commits = w.chain(3);
    let test = w.test("bounded");
    let created = w.observe(&w.run_on(&commits[2]), &test, TestStatus::Fail).await;
    let id = created_id(&created.transitions);

    let err = w
        .engine
        .tracer()
        .trace_caused(&id, &commits[2].id, None)
        .await
        .unwrap_err();
    match err {
        EngineError::RecursionLimitExceeded {
            defect_id,
            commit_id,
            max_depth,
        } => {
            assert_eq!(defect_id, id);
            assert_eq!(commit_id, commits[0].id);
            assert_eq!(max_depth, 2);
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn worker_drains_every_queued_job() {
    let w = World::new();
    let commits = w.chain(3);
    let run = w.run_on(&commits[2]);
    let mut defects = Vec::new();
    for name in ["a", "b", "c", "d", "e", "f"] {
        let test = w.test(name);
        let outcome = w.observe(&run, &test, TestStatus::Fail).await;
        defects.push(created_id(&outcome.transitions));
    }
    assert_eq!(w.stores.jobs.pending(), 6);

    let report = w.engine.worker().drain().await.unwrap();
    assert_eq!(report.completed, 6);
    assert_eq!(w.stores.jobs.pending(), 0);
    assert!(w
        .stores
        .jobs
        .records()
        .iter()
        .all(|r| r.status == JobStatus::Completed && r.job.kind == TraceKind::CausedBy));

    for id in defects {
        let defect = w.stores.defects.get(&id).await.unwrap().unwrap();
        assert_eq!(defect.caused_by_commits, ids(&commits));
    }
}

#[tokio::test]
async fn trace_of_unknown_defect_fails_its_job() {
    let w = World::new();
    let commits = w.chain(1);
    w.stores
        .jobs
        .enqueue(TraceJob::caused_by(
            DefectId::from("gone"),
            commits[0].id.clone(),
            None,
        ))
        .await
        .unwrap();

    let report = w.engine.worker().drain().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].1.contains("defect not found"));
}

/// Defect store that panics when one particular row is read.
struct PanickyDefects {
    inner: Arc<MemoryDefectStore>,
    poisoned: DefectId,
}

#[async_trait]
impl DefectStore for PanickyDefects {
    async fn get(&self, id: &DefectId) -> StorageResult<Option<Defect>> {
        if id == &self.poisoned {
            panic!("corrupt defect row {id}");
        }
        self.inner.get(id).await
    }

    async fn find_by_fingerprint(
        &self,
        project: &ProjectId,
        fingerprint: &str,
    ) -> StorageResult<Vec<Defect>> {
        self.inner.find_by_fingerprint(project, fingerprint).await
    }

    async fn defects_for_test(&self, test: &TestId) -> StorageResult<Vec<Defect>> {
        self.inner.defects_for_test(test).await
    }

    async fn defects(&self, project: &ProjectId) -> StorageResult<Vec<Defect>> {
        self.inner.defects(project).await
    }

    async fn save(&self, defect: &Defect) -> StorageResult<()> {
        self.inner.save(defect).await
    }
}

/// Queue whose first `complete` call is rejected.
struct RejectFirstComplete {
    inner: Arc<MemoryJobQueue>,
    rejected: AtomicBool,
}

#[async_trait]
impl JobQueue for RejectFirstComplete {
    async fn enqueue(&self, job: TraceJob) -> StorageResult<JobId> {
        self.inner.enqueue(job).await
    }

    async fn dequeue(&self) -> StorageResult<Option<(JobId, TraceJob)>> {
        self.inner.dequeue().await
    }

    async fn complete(&self, id: &JobId) -> StorageResult<()> {
        if !self.rejected.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Backend("queue write timed out".into()));
        }
        self.inner.complete(id).await
    }

    async fn fail(&self, id: &JobId, error: &str) -> StorageResult<()> {
        self.inner.fail(id, error).await
    }

    async fn get(&self, id: &JobId) -> StorageResult<Option<JobRecord>> {
        self.inner.get(id).await
    }
}

async fn seed_defect(w: &World, name: &str) -> Defect {
    let defect = Defect::new(
        w.project.clone(),
        format!("fp-{name}"),
        format!("{name} failed"),
        DefectType::Project,
        CreateType::Automatic,
    );
    w.stores.defects.save(&defect).await.unwrap();
    defect
}

#[tokio::test]
async fn panicking_trace_fails_only_its_job() {
    let w = World::new();
    let commits = w.chain(1);
    let healthy = seed_defect(&w, "healthy").await;
    let poisoned = DefectId::from("poisoned");

    let mut stores = w.stores.store_set();
    stores.defects = Arc::new(PanickyDefects {
        inner: w.stores.defects.clone(),
        poisoned: poisoned.clone(),
    });
    let engine = Engine::new(stores, EngineConfig::default());

    for defect_id in [poisoned, healthy.id.clone()] {
        w.stores
            .jobs
            .enqueue(TraceJob::caused_by(defect_id, commits[0].id.clone(), None))
            .await
            .unwrap();
    }

    let report = engine.worker().drain().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].1.contains("panicked"));
    assert!(w
        .stores
        .jobs
        .records()
        .iter()
        .all(|r| r.status != JobStatus::Running && r.status != JobStatus::Queued));

    let traced = w.stores.defects.get(&healthy.id).await.unwrap().unwrap();
    assert_eq!(traced.caused_by_commits, ids(&commits));
}

#[tokio::test]
async fn rejected_completion_does_not_stop_the_drain() {
    let w = World::new();
    let commits = w.chain(1);
    let mut stores = w.stores.store_set();
    stores.jobs = Arc::new(RejectFirstComplete {
        inner: w.stores.jobs.clone(),
        rejected: AtomicBool::new(false),
    });
    let engine = Engine::new(stores, EngineConfig::default());

    for name in ["first", "second", "third"] {
        let defect = seed_defect(&w, name).await;
        w.stores
            .jobs
            .enqueue(TraceJob::caused_by(defect.id, commits[0].id.clone(), None))
            .await
            .unwrap();
    }

    let report = engine.worker().drain().await.unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(w.stores.jobs.pending(), 0);
    let completed = w
        .stores
        .jobs
        .records()
        .iter()
        .filter(|r| r.status == JobStatus::Completed)
        .count();
    assert_eq!(completed, 2);
}
