//! Impact classifier integration tests over the in-memory stores.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{World, BRANCH};
use testpulse_core::{
    ClassificationSource, ClassifyRequest, CommitSelection, EngineConfig, EngineError,
    MlPredictor, PredictorError, RepoKind, SimilarTestsOracle, Tier, TierPrediction,
};
use testpulse_state::{
    Commit, CreateType, Defect, DefectStatus, DefectStore, DefectType, FileId, ProjectId, SuiteId,
    Test, TestId, TestStatus,
};

fn names(tests: &[Test]) -> Vec<&str> {
    tests.iter().map(|t| t.name.as_str()).collect()
}

// ===========================================================================
// Rule-based tiers
// ===========================================================================

#[tokio::test]
async fn file_changed_in_commit_puts_test_in_high() {
    let w = World::new();
    let file = FileId::from("f.py");
    let a = w.commit("aaaaaaaa01", 0, &[]);
    let b = w.commit("bbbbbbbb01", 1, &[&a]);
    let c = w.commit("cccccccc01", 2, &[&b]).touching(&file);
    w.save_commit(&c);
    let t1 = Test::new(w.project.clone(), "T1").with_file(&file);
    w.save_test(&t1);

    let on_c = w
        .engine
        .classifier()
        .classify(&ClassifyRequest::single(w.project.clone(), c.id.clone()))
        .await
        .unwrap();
    assert_eq!(names(&on_c.tiers.high), vec!["T1"]);
    assert_eq!(on_c.source, ClassificationSource::Rules);

    let on_a = w
        .engine
        .classifier()
        .classify(&ClassifyRequest::single(w.project.clone(), a.id.clone()))
        .await
        .unwrap();
    assert!(on_a.tiers.high.is_empty());
    assert_eq!(names(&on_a.tiers.low), vec!["T1"]);
}

#[tokio::test]
async fn every_test_name_lands_in_exactly_one_tier() {
    let w = World::new();
    let changed = FileId::from("src/lib.rs");
    let untouched = FileId::from("src/other.rs");
    let core = w.area("core");
    let api = w.area("api").depends_on(&core.id);
    w.save_area(&api);
    let default = w.area(testpulse_state::DEFAULT_AREA_NAME);

    let commit = w
        .commit("deadbeef01", 0, &[])
        .touching(&changed)
        .in_area(&core.id)
        .in_area(&default.id);
    w.save_commit(&commit);

    w.save_test(&Test::new(w.project.clone(), "high").with_file(&changed));
    w.save_test(&Test::new(w.project.clone(), "medium").with_area(&api.id));
    w.save_test(&Test::new(w.project.clone(), "low").with_file(&untouched));
    w.save_test(&Test::new(w.project.clone(), "bare"));
    // Two rows of one logical test: the stronger tier wins.
    w.save_test(&Test::new(w.project.clone(), "dup").with_file(&changed));
    w.save_test(&Test::new(w.project.clone(), "dup").with_file(&untouched));
    // Only the Default Area matches: not an impact signal.
    w.save_test(&Test::new(w.project.clone(), "defaulted").with_area(&default.id));

    let result = w
        .engine
        .classifier()
        .classify(&ClassifyRequest::single(w.project.clone(), commit.id.clone()))
        .await
        .unwrap();
    let tiers = &result.tiers;

    assert_eq!(names(&tiers.high), vec!["dup", "high"]);
    assert_eq!(names(&tiers.medium), vec!["medium"]);
    assert_eq!(names(&tiers.low), vec!["defaulted", "low"]);
    assert_eq!(names(&tiers.unassigned), vec!["bare"]);

    let mut seen = HashSet::new();
    for test in tiers
        .high
        .iter()
        .chain(&tiers.medium)
        .chain(&tiers.low)
        .chain(&tiers.unassigned)
    {
        assert!(seen.insert(test.name.clone()), "{} listed twice", test.name);
    }
    assert_eq!(seen.len(), 6);
}

#[tokio::test]
async fn fixed_defect_links_test_to_regressed_file() {
    let w = World::new();
    let hot = FileId::from("src/parser.rs");
    let old = w.commit("01d01d0101", 0, &[]).touching(&hot);
    w.save_commit(&old);
    let new = w.commit("0e00e00e01", 5, &[&old]).touching(&hot);
    w.save_commit(&new);

    let guarded = w.test("parser_roundtrip");
    let mut defect = Defect::new(
        w.project.clone(),
        "fp",
        "boom",
        DefectType::Project,
        CreateType::Automatic,
    );
    defect.status = DefectStatus::Closed;
    defect.close_type = Some(testpulse_state::CloseType::Fixed);
    defect.associated_tests.insert(guarded.id.clone());
    defect.caused_by_commits.insert(old.id.clone());
    w.stores.defects.save(&defect).await.unwrap();

    let result = w
        .engine
        .classifier()
        .classify(&ClassifyRequest::single(w.project.clone(), new.id.clone()))
        .await
        .unwrap();
    assert_eq!(names(&result.tiers.high), vec!["parser_roundtrip"]);
}

// ===========================================================================
// Commit selection
// ===========================================================================

#[tokio::test]
async fn since_last_run_covers_commits_after_previous_run() {
    let w = World::new();
    let commits = w.chain(4);
    w.run_on(&commits[1]);

    let req = ClassifyRequest::since_last_run(
        w.project.clone(),
        commits[3].id.clone(),
        BRANCH,
        w.suite.id.clone(),
    );
    let result = w.engine.classifier().classify(&req).await.unwrap();
    let expected: Vec<_> = commits[1..].iter().map(|c| c.id.clone()).collect();
    assert_eq!(result.commits, expected);
}

#[tokio::test]
async fn between_exclusive_drops_later_endpoint() {
    let w = World::new();
    let commits = w.chain(4);

    let req = ClassifyRequest::between(
        w.project.clone(),
        commits[0].id.clone(),
        commits[3].id.clone(),
        BRANCH,
        true,
    );
    let result = w.engine.classifier().classify(&req).await.unwrap();
    let expected: Vec<_> = commits[..3].iter().map(|c| c.id.clone()).collect();
    assert_eq!(result.commits, expected);
}

#[tokio::test]
async fn missing_mode_arguments_are_ambiguous() {
    let w = World::new();
    let commits = w.chain(2);

    let mut no_commit = ClassifyRequest::single(w.project.clone(), commits[0].id.clone());
    no_commit.commit = None;
    let err = w.engine.classifier().classify(&no_commit).await.unwrap_err();
    assert!(matches!(err, EngineError::AmbiguousCommitReference(_)));

    let mut no_from = ClassifyRequest::between(
        w.project.clone(),
        commits[0].id.clone(),
        commits[1].id.clone(),
        BRANCH,
        false,
    );
    no_from.from_commit = None;
    let err = w.engine.classifier().classify(&no_from).await.unwrap_err();
    assert!(matches!(err, EngineError::AmbiguousCommitReference(_)));

    let mut no_branch = ClassifyRequest::single(w.project.clone(), commits[1].id.clone())
        .with_suite(w.suite.id.clone());
    no_branch.mode = CommitSelection::LastRun;
    let err = w.engine.classifier().classify(&no_branch).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn commit_of_another_project_is_rejected() {
    let w = World::new();
    let foreign = Commit::new(ProjectId::from("elsewhere"), "f0f0f0f0f0", w.at_hours(0));
    w.save_commit(&foreign);

    let err = w
        .engine
        .classifier()
        .classify(&ClassifyRequest::single(w.project.clone(), foreign.id.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

// ===========================================================================
// ML fast path
// ===========================================================================

enum Behaviour {
    Answer(TierPrediction),
    Fail,
    Hang,
}

struct FakePredictor {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl FakePredictor {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MlPredictor for FakePredictor {
    fn is_loaded(&self, _suite: &SuiteId) -> bool {
        true
    }

    async fn classify(
        &self,
        _tests: &[Test],
        _commits: &[Commit],
    ) -> Result<TierPrediction, PredictorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Answer(p) => Ok(p.clone()),
            Behaviour::Fail => Err(PredictorError::Unavailable("model not loaded".into())),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(TierPrediction::default())
            }
        }
    }

    async fn top_by_percent(
        &self,
        tests: &[Test],
        _commits: &[Commit],
        _percent: u8,
    ) -> Result<Vec<TestId>, PredictorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(tests.iter().rev().map(|t| t.id.clone()).collect())
    }
}

/// Three bare tests (all Unassigned by the rules) on one commit.
fn ml_world(config: EngineConfig) -> (World, Commit, Vec<Test>) {
    let w = World::with_config(config);
    let commit = w.commit("abcabcabc1", 0, &[]);
    let tests = vec![w.test("alpha"), w.test("beta"), w.test("gamma")];
    (w, commit, tests)
}

fn decisive(tests: &[Test]) -> TierPrediction {
    TierPrediction {
        high: vec![tests[0].id.clone()],
        medium: vec![tests[1].id.clone()],
        low: vec![tests[2].id.clone()],
        unassigned: vec![],
    }
}

#[tokio::test]
async fn predictor_is_skipped_without_enough_history() {
    let (w, commit, tests) = ml_world(EngineConfig::default());
    w.pad_runs(10);
    let predictor = FakePredictor::new(Behaviour::Answer(decisive(&tests)));
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_predictor(predictor.clone());

    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone())
        .with_suite(w.suite.id.clone());
    let result = engine.classifier().classify(&req).await.unwrap();
    assert_eq!(result.source, ClassificationSource::Rules);
    assert_eq!(result.tiers.unassigned.len(), 3);
    assert_eq!(predictor.calls(), 0);
}

#[tokio::test]
async fn confident_predictor_output_is_used_directly() {
    let (w, commit, tests) = ml_world(EngineConfig::default());
    w.pad_runs(500);
    let predictor = FakePredictor::new(Behaviour::Answer(TierPrediction {
        high: vec![tests[0].id.clone()],
        ..TierPrediction::default()
    }));
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_predictor(predictor.clone());

    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone())
        .with_suite(w.suite.id.clone());
    let result = engine.classifier().classify(&req).await.unwrap();
    assert_eq!(result.source, ClassificationSource::Predictor);
    assert_eq!(names(&result.tiers.high), vec!["alpha"]);
    assert_eq!(names(&result.tiers.unassigned), vec!["beta", "gamma"]);
}

#[tokio::test]
async fn mid_history_predictor_must_beat_rule_unassigned_count() {
    let (w, commit, tests) = ml_world(EngineConfig::default());
    w.pad_runs(60);
    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone())
        .with_suite(w.suite.id.clone());

    let sharper = FakePredictor::new(Behaviour::Answer(decisive(&tests)));
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_predictor(sharper);
    let result = engine.classifier().classify(&req).await.unwrap();
    assert_eq!(result.source, ClassificationSource::Predictor);
    assert!(result.tiers.unassigned.is_empty());

    // Leaves all three unassigned: no better than the rules.
    let vaguer = FakePredictor::new(Behaviour::Answer(TierPrediction::default()));
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_predictor(vaguer);
    let result = engine.classifier().classify(&req).await.unwrap();
    assert_eq!(result.source, ClassificationSource::Rules);
}

#[tokio::test]
async fn predictor_failures_fall_back_to_rules() {
    let (w, commit, tests) = ml_world(EngineConfig::default());
    w.pad_runs(500);
    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone())
        .with_suite(w.suite.id.clone());

    let failing = FakePredictor::new(Behaviour::Fail);
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_predictor(failing.clone());
    let result = engine.classifier().classify(&req).await.unwrap();
    assert_eq!(result.source, ClassificationSource::Rules);
    assert_eq!(failing.calls(), 1);

    let malformed = FakePredictor::new(Behaviour::Answer(TierPrediction {
        high: vec![tests[0].id.clone(), TestId::from("no-such-test")],
        ..TierPrediction::default()
    }));
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_predictor(malformed);
    let result = engine.classifier().classify(&req).await.unwrap();
    assert_eq!(result.source, ClassificationSource::Rules);
    assert_eq!(result.tiers.unassigned.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn predictor_timeout_falls_back_to_rules() {
    let (w, commit, _) = ml_world(EngineConfig::default());
    w.pad_runs(500);
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_predictor(FakePredictor::new(Behaviour::Hang));

    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone())
        .with_suite(w.suite.id.clone());
    let result = engine.classifier().classify(&req).await.unwrap();
    assert_eq!(result.source, ClassificationSource::Rules);
}

// ===========================================================================
// Derived views
// ===========================================================================

struct FixedOracle(Vec<TestId>);

#[async_trait]
impl SimilarTestsOracle for FixedOracle {
    async fn similar_tests(
        &self,
        _project: &ProjectId,
        _commits: &[Commit],
    ) -> Result<Vec<TestId>, PredictorError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn percent_truncates_to_share_of_all_tests() {
    let w = World::new();
    let commit = w.commit("1234567890", 0, &[]);
    for i in 0..10 {
        w.test(&format!("t{i:02}"));
    }

    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone());
    let half = w
        .engine
        .classifier()
        .select(&req, Tier::Percent(50))
        .await
        .unwrap();
    assert_eq!(half.len(), 5);

    let none = w
        .engine
        .classifier()
        .select(&req, Tier::Percent(5))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn percent_returns_short_candidate_list_whole() {
    let w = World::new();
    let file = FileId::from("hot.rs");
    let commit = w.commit("1234567890", 0, &[]).touching(&file);
    w.save_commit(&commit);
    let high = Test::new(w.project.clone(), "high").with_file(&file);
    w.save_test(&high);
    w.save_test(&Test::new(w.project.clone(), "high2").with_file(&file));
    w.test("bare1");
    w.test("bare2");

    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone());
    let picked = w
        .engine
        .classifier()
        .select(&req, Tier::Percent(100))
        .await
        .unwrap();
    assert_eq!(names(&picked), vec!["bare1", "bare2"]);

    // The similarity oracle extends the candidates.
    let engine = testpulse_core::Engine::new(w.stores.store_set(), EngineConfig::default())
        .with_similarity_oracle(Arc::new(FixedOracle(vec![high.id.clone()])));
    let picked = engine
        .classifier()
        .select(&req, Tier::Percent(100))
        .await
        .unwrap();
    assert_eq!(names(&picked), vec!["bare1", "bare2", "high"]);
}

#[tokio::test]
async fn percent_rejects_bad_arguments() {
    let w = World::new();
    let commit = w.commit("1234567890", 0, &[]);
    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone());

    let err = w
        .engine
        .classifier()
        .select(&req, Tier::Percent(101))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut perforce = req.clone().with_repo_kind(RepoKind::Perforce);
    perforce.target_branch = Some(BRANCH.to_string());
    let err = w
        .engine
        .classifier()
        .select(&perforce, Tier::Percent(10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AmbiguousCommitReference(_)));
}

#[tokio::test]
async fn rerun_selects_single_failed_results() {
    let w = World::new();
    let commit = w.commit("1234567890", 0, &[]);
    let once_failed = w.test("once_failed");
    let retried = w.test("retried");
    let passed = w.test("passed");
    let broken = w.test("broken");
    let run = w.run_on(&commit);
    w.record(&run, &once_failed, TestStatus::Fail);
    w.record(&run, &retried, TestStatus::Fail);
    w.record(&run, &retried, TestStatus::Pass);
    w.record(&run, &passed, TestStatus::Pass);
    w.record(&run, &broken, TestStatus::Broken);

    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone());
    let rerun = w.engine.classifier().select(&req, Tier::Rerun).await.unwrap();
    assert_eq!(names(&rerun), vec!["broken", "once_failed"]);
}

#[tokio::test]
async fn defect_views_split_ready_and_open() {
    let w = World::new();
    let commit = w.commit("1234567890", 0, &[]);
    let run = w.run_on(&commit);
    let ready = w.test("ready");
    let open = w.test("open");
    let both = w.test("both");
    let flaky = w.test("flaky");
    for t in [&ready, &open, &both, &flaky] {
        w.record(&run, t, TestStatus::Fail);
    }

    let save = |test: &Test, status: DefectStatus, defect_type: DefectType| {
        let mut d = Defect::new(
            w.project.clone(),
            format!("fp-{}-{status:?}", test.name),
            "x",
            defect_type,
            CreateType::Automatic,
        );
        d.status = status;
        d.associated_tests.insert(test.id.clone());
        d
    };
    for d in [
        save(&ready, DefectStatus::Ready, DefectType::Project),
        save(&open, DefectStatus::InProgress, DefectType::Project),
        save(&both, DefectStatus::Ready, DefectType::Project),
        save(&both, DefectStatus::Verified, DefectType::Project),
        save(&flaky, DefectStatus::Ready, DefectType::Flaky),
    ] {
        w.stores.defects.save(&d).await.unwrap();
    }

    let req = ClassifyRequest::single(w.project.clone(), commit.id.clone());
    let ready_view = w
        .engine
        .classifier()
        .select(&req, Tier::ReadyDefect)
        .await
        .unwrap();
    let open_view = w
        .engine
        .classifier()
        .select(&req, Tier::OpenDefect)
        .await
        .unwrap();
    assert_eq!(names(&ready_view), vec!["ready"]);
    assert_eq!(names(&open_view), vec!["both", "open"]);
}
