//! JSON project fixtures.
//!
//! A fixture describes one project's areas, commits, tests, suites and runs
//! by name. Loading it seeds a fresh set of in-memory stores; names become
//! the entity ids, so a commit can be addressed by its sha on the command
//! line.
//!
//! Results are not stored on load. [`LoadedProject::ingest_all`] stores them
//! at once for read-only commands, while `replay` stores them one at a time
//! ahead of feeding each to the defect automaton.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use testpulse_core::MemoryStores;
use testpulse_state::{
    Area, AreaId, Commit, CommitId, File, FileId, ProjectId, SuiteId, Test, TestId, TestRun,
    TestRunId, TestRunResult, TestStatus, TestSuite,
};

#[derive(Debug, Deserialize)]
pub struct ProjectFixture {
    pub project: String,
    #[serde(default)]
    pub areas: Vec<AreaFixture>,
    #[serde(default)]
    pub files: Vec<FileFixture>,
    #[serde(default)]
    pub commits: Vec<CommitFixture>,
    #[serde(default)]
    pub tests: Vec<TestFixture>,
    #[serde(default)]
    pub suites: Vec<SuiteFixture>,
    #[serde(default)]
    pub runs: Vec<RunFixture>,
}

#[derive(Debug, Deserialize)]
pub struct AreaFixture {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A registered file. Commits and tests name files by `name`; the path is
/// what reports show.
#[derive(Debug, Deserialize)]
pub struct FileFixture {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub areas: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommitFixture {
    pub sha: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub areas: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestFixture {
    /// Defaults to the name. Give distinct ids to several rows of one test.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub areas: Vec<String>,
    #[serde(default)]
    pub area: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SuiteFixture {
    pub name: String,
    #[serde(default = "enabled")]
    pub auto_close_defects: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RunFixture {
    pub suite: String,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub local: bool,
    /// Defaults to the commit's timestamp.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Vec<ResultFixture>,
}

#[derive(Debug, Deserialize)]
pub struct ResultFixture {
    /// Test id (the test name unless the test sets one).
    pub test: String,
    pub status: TestStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// A fixture seeded into in-memory stores.
pub struct LoadedProject {
    pub project: ProjectId,
    pub stores: MemoryStores,
    /// Results in fixture order, not yet stored.
    pub results: Vec<TestRunResult>,
}

impl LoadedProject {
    pub fn suite_id(&self, name: &str) -> SuiteId {
        SuiteId::from(name)
    }

    /// Store every pending result without running the automaton.
    pub fn ingest_all(&self) {
        for result in &self.results {
            self.stores.runs.insert_result(result.clone());
        }
    }
}

impl ProjectFixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid fixture {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Seed fresh stores. Every reference (parent sha, area, suite, test)
    /// must name an entity declared in the fixture.
    pub fn into_project(self) -> Result<LoadedProject> {
        let project = ProjectId::from(self.project.as_str());
        let stores = MemoryStores::new();

        let area_names: HashSet<&str> = self.areas.iter().map(|a| a.name.as_str()).collect();
        let area_ref = |name: &str| -> Result<AreaId> {
            if !area_names.contains(name) {
                bail!("unknown area '{name}'");
            }
            Ok(AreaId::from(name))
        };

        for fixture in &self.areas {
            let mut area = Area::new(project.clone(), fixture.name.as_str());
            area.id = AreaId::from(fixture.name.as_str());
            for dep in &fixture.depends_on {
                area = area.depends_on(&area_ref(dep)?);
            }
            stores.areas.insert_area(area);
        }

        for fixture in &self.files {
            let mut file = File::new(project.clone(), fixture.path.as_str());
            file.id = FileId::from(fixture.name.as_str());
            for area in &fixture.areas {
                file.areas.insert(area_ref(area)?);
            }
            stores.areas.insert_file(file);
        }

        let mut commits: HashMap<&str, Commit> = HashMap::new();
        for fixture in &self.commits {
            let mut commit = Commit::new(project.clone(), fixture.sha.as_str(), fixture.timestamp);
            commit.id = CommitId::from(fixture.sha.as_str());
            for parent in &fixture.parents {
                if !commits.contains_key(parent.as_str()) {
                    bail!(
                        "commit {} names parent {parent} that is not listed before it",
                        fixture.sha
                    );
                }
                commit = commit.with_parent(&CommitId::from(parent.as_str()));
            }
            for branch in &fixture.branches {
                commit = commit.on_branch(branch.as_str());
            }
            for file in &fixture.files {
                commit = commit.touching(&FileId::from(file.as_str()));
            }
            for area in &fixture.areas {
                commit = commit.in_area(&area_ref(area)?);
            }
            stores.commits.insert(commit.clone());
            commits.insert(fixture.sha.as_str(), commit);
        }

        let mut test_ids: HashSet<String> = HashSet::new();
        for fixture in &self.tests {
            let id = fixture.id.clone().unwrap_or_else(|| fixture.name.clone());
            if !test_ids.insert(id.clone()) {
                bail!("duplicate test id '{id}'");
            }
            let mut test = Test::new(project.clone(), fixture.name.as_str());
            test.id = TestId::from(id);
            for file in &fixture.files {
                test = test.with_file(&FileId::from(file.as_str()));
            }
            for area in &fixture.areas {
                test = test.with_area(&area_ref(area)?);
            }
            if let Some(area) = &fixture.area {
                test = test.located_in(&area_ref(area)?);
            }
            stores.tests.insert(test);
        }

        let mut suites: HashSet<&str> = HashSet::new();
        for fixture in &self.suites {
            let mut suite = TestSuite::new(project.clone(), fixture.name.as_str());
            suite.id = SuiteId::from(fixture.name.as_str());
            suite.auto_close_defects = fixture.auto_close_defects;
            stores.runs.insert_suite(suite);
            suites.insert(fixture.name.as_str());
        }

        let fallback = DateTime::<Utc>::UNIX_EPOCH;
        let mut results = Vec::new();
        for (index, fixture) in self.runs.iter().enumerate() {
            if !suites.contains(fixture.suite.as_str()) {
                bail!("run {index} uses unknown suite '{}'", fixture.suite);
            }
            let commit = match &fixture.commit {
                Some(sha) => Some(
                    commits
                        .get(sha.as_str())
                        .with_context(|| format!("run {index} names unknown commit {sha}"))?,
                ),
                None => None,
            };

            let mut run = TestRun::new(
                project.clone(),
                SuiteId::from(fixture.suite.as_str()),
                commit.map(|c| c.id.clone()),
            );
            run.id = TestRunId::from(format!("run-{index}"));
            run.is_local = fixture.local;
            run.branch = commit.and_then(|c| c.branches.iter().next().cloned());
            run.created_at = fixture
                .timestamp
                .or_else(|| commit.map(|c| c.timestamp))
                .unwrap_or(fallback);
            stores.runs.insert_run(run.clone());

            for (offset, result) in fixture.results.iter().enumerate() {
                if !test_ids.contains(&result.test) {
                    bail!("run {index} has a result for unknown test '{}'", result.test);
                }
                let mut stored =
                    TestRunResult::new(&run, &TestId::from(result.test.as_str()), result.status)
                        .at(run.created_at + Duration::seconds(offset as i64));
                if let Some(message) = &result.message {
                    stored = stored.with_message(message.as_str());
                }
                results.push(stored);
            }
        }

        Ok(LoadedProject {
            project,
            stores,
            results,
        })
    }
}
