//! Shared fixture for the engine integration tests.
//!
//! Builds a small project in the in-memory stores and exposes helpers to
//! grow its history. Timestamps are derived from a fixed base so ordering is
//! deterministic.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};
use testpulse_core::{Engine, EngineConfig, MemoryStores};
use testpulse_state::{
    Area, Commit, ProjectId, Test, TestRun, TestRunResult, TestStatus, TestSuite,
};

pub const BRANCH: &str = "main";

pub struct World {
    pub stores: MemoryStores,
    pub engine: Engine,
    pub project: ProjectId,
    pub suite: TestSuite,
    base: DateTime<Utc>,
    clock: AtomicI64,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let stores = MemoryStores::new();
        let engine = Engine::new(stores.store_set(), config);
        let project = ProjectId::from("proj");
        let suite = TestSuite::new(project.clone(), "ci");
        stores.runs.insert_suite(suite.clone());
        Self {
            stores,
            engine,
            project,
            suite,
            base: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            clock: AtomicI64::new(0),
        }
    }

    pub fn at_hours(&self, hours: i64) -> DateTime<Utc> {
        self.base + Duration::hours(hours)
    }

    /// Insert a commit on `main`, `hours` after the base, child of `parents`.
    pub fn commit(&self, sha: &str, hours: i64, parents: &[&Commit]) -> Commit {
        self.commit_on(sha, hours, parents, &[BRANCH])
    }

    pub fn commit_on(
        &self,
        sha: &str,
        hours: i64,
        parents: &[&Commit],
        branches: &[&str],
    ) -> Commit {
        let mut commit = Commit::new(self.project.clone(), sha, self.at_hours(hours));
        for parent in parents {
            commit = commit.with_parent(&parent.id);
        }
        for branch in branches {
            commit = commit.on_branch(*branch);
        }
        self.stores.commits.insert(commit.clone());
        commit
    }

    /// A linear history `c0 <- c1 <- ... <- c{n-1}`, one hour apart.
    pub fn chain(&self, n: usize) -> Vec<Commit> {
        let mut commits: Vec<Commit> = Vec::with_capacity(n);
        for i in 0..n {
            let parents: Vec<&Commit> = commits.last().into_iter().collect();
            let commit = self.commit(&format!("{i:08}cafe"), i as i64, &parents);
            commits.push(commit);
        }
        commits
    }

    pub fn save_commit(&self, commit: &Commit) {
        self.stores.commits.insert(commit.clone());
    }

    pub fn area(&self, name: &str) -> Area {
        let area = Area::new(self.project.clone(), name);
        self.stores.areas.insert_area(area.clone());
        area
    }

    pub fn save_area(&self, area: &Area) {
        self.stores.areas.insert_area(area.clone());
    }

    pub fn test(&self, name: &str) -> Test {
        let test = Test::new(self.project.clone(), name);
        self.stores.tests.insert(test.clone());
        test
    }

    pub fn save_test(&self, test: &Test) {
        self.stores.tests.insert(test.clone());
    }

    pub fn run_on(&self, commit: &Commit) -> TestRun {
        let run = TestRun::new(
            self.project.clone(),
            self.suite.id.clone(),
            Some(commit.id.clone()),
        );
        self.stores.runs.insert_run(run.clone());
        run
    }

    pub fn local_run_on(&self, commit: &Commit) -> TestRun {
        let mut run = self.run_on(commit);
        run.is_local = true;
        self.stores.runs.insert_run(run.clone());
        run
    }

    /// Store a result; each call is one second later than the previous.
    pub fn record(&self, run: &TestRun, test: &Test, status: TestStatus) -> TestRunResult {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst);
        let mut result =
            TestRunResult::new(run, &test.id, status).at(self.base + Duration::seconds(tick));
        if status.is_failure() {
            let message = format!("{} failed: assertion `left == right`", test.name);
            result = result.with_message(message);
        }
        self.stores.runs.insert_result(result.clone());
        result
    }

    /// Store a result and feed it to the automaton.
    pub async fn observe(
        &self,
        run: &TestRun,
        test: &Test,
        status: TestStatus,
    ) -> testpulse_core::DefectOutcome {
        let result = self.record(run, test, status);
        self.engine
            .automaton()
            .handle_result(&result)
            .await
            .expect("automaton accepts stored results")
    }

    /// Record `count` empty runs of the suite (history for the predictor gate).
    pub fn pad_runs(&self, count: usize) {
        for _ in 0..count {
            self.stores.runs.insert_run(TestRun::new(
                self.project.clone(),
                self.suite.id.clone(),
                None,
            ));
        }
    }
}
