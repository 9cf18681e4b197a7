//! Impact classifier.
//!
//! Partitions a project's tests into High / Medium / Low / Unassigned tiers
//! for a commit set, with derived views (top percent, rerun candidates,
//! defect-linked tests). When a trained predictor is attached and the suite
//! has enough history, its output may replace the rule-based tiers; any
//! predictor failure silently falls back to the rules.

mod predictor;
mod rules;
mod selection;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use testpulse_state::{
    AreaId, CloseType, Commit, CommitId, Defect, DefectStatus, DefectType, FileId, ProjectId,
    StorageError, SuiteId, Test, TestId, TestStatus,
};
use tracing::{debug, instrument};

use crate::config::ClassifierConfig;
use crate::error::{EngineError, Result};
use crate::graph::CommitGraph;
use crate::obs;
use crate::stores::StoreSet;

pub use predictor::{MlPredictor, PredictorError, SimilarTestsOracle, TierPrediction};
pub use rules::{ImpactTier, TierSets, TieredTests};
pub use selection::{CommitSelection, RepoKind};

use rules::{CausalFootprint, ImpactInputs};

/// What to classify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub project: ProjectId,
    pub mode: CommitSelection,
    #[serde(default)]
    pub commit: Option<CommitId>,
    #[serde(default)]
    pub from_commit: Option<CommitId>,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub test_suite: Option<SuiteId>,
    #[serde(default)]
    pub repo_kind: RepoKind,
}

impl ClassifyRequest {
    pub fn single(project: ProjectId, commit: CommitId) -> Self {
        Self {
            project,
            mode: CommitSelection::Single,
            commit: Some(commit),
            from_commit: None,
            target_branch: None,
            test_suite: None,
            repo_kind: RepoKind::Git,
        }
    }

    pub fn between(
        project: ProjectId,
        from: CommitId,
        to: CommitId,
        branch: impl Into<String>,
        exclusive: bool,
    ) -> Self {
        Self {
            mode: if exclusive {
                CommitSelection::BetweenExclusive
            } else {
                CommitSelection::BetweenInclusive
            },
            from_commit: Some(from),
            target_branch: Some(branch.into()),
            ..Self::single(project, to)
        }
    }

    pub fn since_last_run(
        project: ProjectId,
        commit: CommitId,
        branch: impl Into<String>,
        suite: SuiteId,
    ) -> Self {
        Self {
            mode: CommitSelection::LastRun,
            target_branch: Some(branch.into()),
            test_suite: Some(suite),
            ..Self::single(project, commit)
        }
    }

    pub fn with_suite(mut self, suite: SuiteId) -> Self {
        self.test_suite = Some(suite);
        self
    }

    pub fn with_repo_kind(mut self, kind: RepoKind) -> Self {
        self.repo_kind = kind;
        self
    }
}

/// A view of the classification a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    High,
    Medium,
    Low,
    Unassigned,
    /// Low, Unassigned and similar-test candidates, capped at N% of all tests.
    Percent(u8),
    /// Tests whose only result on the commit failed.
    Rerun,
    ReadyDefect,
    OpenDefect,
}

impl Tier {
    pub fn impact(self) -> Option<ImpactTier> {
        match self {
            Tier::High => Some(ImpactTier::High),
            Tier::Medium => Some(ImpactTier::Medium),
            Tier::Low => Some(ImpactTier::Low),
            Tier::Unassigned => Some(ImpactTier::Unassigned),
            _ => None,
        }
    }
}

impl FromStr for Tier {
    type Err = EngineError;

    /// Accepts tier names (`high`, `ready_defect`, ...) and percentages
    /// (`25%`).
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if let Some(pct) = raw.strip_suffix('%') {
            return pct
                .trim()
                .parse::<u8>()
                .map(Tier::Percent)
                .map_err(|_| EngineError::InvalidRequest(format!("bad percentage: {raw}")));
        }
        match raw.replace('-', "_").as_str() {
            "high" => Ok(Tier::High),
            "medium" => Ok(Tier::Medium),
            "low" => Ok(Tier::Low),
            "unassigned" => Ok(Tier::Unassigned),
            "rerun" => Ok(Tier::Rerun),
            "ready_defect" => Ok(Tier::ReadyDefect),
            "open_defect" => Ok(Tier::OpenDefect),
            other => Err(EngineError::InvalidRequest(format!("unknown tier: {other}"))),
        }
    }
}

/// Which path produced the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Rules,
    Predictor,
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationSource::Rules => write!(f, "rules"),
            ClassificationSource::Predictor => write!(f, "predictor"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub tiers: TieredTests,
    pub source: ClassificationSource,
    /// The resolved commit set, oldest first.
    pub commits: Vec<CommitId>,
}

pub struct ImpactClassifier {
    stores: StoreSet,
    graph: CommitGraph,
    config: ClassifierConfig,
    predictor: Option<Arc<dyn MlPredictor>>,
    oracle: Option<Arc<dyn SimilarTestsOracle>>,
}

impl ImpactClassifier {
    pub fn new(stores: StoreSet, graph: CommitGraph, config: ClassifierConfig) -> Self {
        Self {
            stores,
            graph,
            config,
            predictor: None,
            oracle: None,
        }
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn MlPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn with_similarity_oracle(mut self, oracle: Arc<dyn SimilarTestsOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Partition the project's tests into the four impact tiers.
    #[instrument(skip(self, req), fields(project = %req.project, mode = ?req.mode))]
    pub async fn classify(&self, req: &ClassifyRequest) -> Result<Classification> {
        let commits = selection::resolve(&self.graph, req).await?;
        let tests = self.stores.tests.tests(&req.project).await?;
        let (sets, source) = self.tier_sets(req, &tests, &commits).await?;
        let tiers = sets.dedupe_by_name(&tests);

        obs::emit_classification(
            req.project.as_str(),
            &source.to_string(),
            commits.len(),
            tiers.high.len(),
            tiers.medium.len(),
            tiers.low.len(),
            tiers.unassigned.len(),
        );
        Ok(Classification {
            tiers,
            source,
            commits: commits.into_iter().map(|c| c.id).collect(),
        })
    }

    /// The tests of one view, deduplicated by name and ordered by name.
    #[instrument(skip(self, req), fields(project = %req.project))]
    pub async fn select(&self, req: &ClassifyRequest, tier: Tier) -> Result<Vec<Test>> {
        match tier {
            Tier::Percent(pct) => self.top_percent(req, pct).await,
            Tier::Rerun => self.rerun(req).await,
            Tier::ReadyDefect => Ok(self.defect_views(req).await?.0),
            Tier::OpenDefect => Ok(self.defect_views(req).await?.1),
            impact => {
                let classification = self.classify(req).await?;
                Ok(impact
                    .impact()
                    .map(|t| classification.tiers.get(t).to_vec())
                    .unwrap_or_default())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tier computation
    // -----------------------------------------------------------------------

    /// The predictor, the suite and its run count, when the suite has enough
    /// history for the predictor to be consulted at all.
    async fn predictor_gate<'a>(
        &'a self,
        req: &'a ClassifyRequest,
    ) -> Result<Option<(&'a dyn MlPredictor, &'a SuiteId, usize)>> {
        let (Some(predictor), Some(suite)) = (&self.predictor, &req.test_suite) else {
            return Ok(None);
        };
        if !predictor.is_loaded(suite) {
            return Ok(None);
        }
        let runs = self.stores.runs.count_runs(suite).await?;
        if runs < self.config.minimal_history {
            debug!(suite_id = %suite, runs, "suite history too short for predictor");
            return Ok(None);
        }
        Ok(Some((predictor.as_ref(), suite, runs)))
    }

    async fn tier_sets(
        &self,
        req: &ClassifyRequest,
        tests: &[Test],
        commits: &[Commit],
    ) -> Result<(TierSets, ClassificationSource)> {
        let Some((predictor, suite, runs)) = self.predictor_gate(req).await? else {
            let rules = self.rule_sets(&req.project, tests, commits).await?;
            return Ok((rules, ClassificationSource::Rules));
        };

        let predicted =
            predictor::bounded(self.config.predictor_timeout(), predictor.classify(tests, commits))
                .await
                .and_then(|prediction| predictor::validate(prediction, tests));
        let predicted = match predicted {
            Ok(sets) => sets,
            Err(e) => {
                obs::emit_predictor_fallback(suite.as_str(), &e);
                let rules = self.rule_sets(&req.project, tests, commits).await?;
                return Ok((rules, ClassificationSource::Rules));
            }
        };
        if runs >= self.config.ml_confidence {
            return Ok((predicted, ClassificationSource::Predictor));
        }

        // Between the thresholds the model must be more decisive than the
        // rules on this very call.
        let rules = self.rule_sets(&req.project, tests, commits).await?;
        let ml_unassigned = predicted.dedupe_by_name(tests).unassigned.len();
        let rule_unassigned = rules.dedupe_by_name(tests).unassigned.len();
        if ml_unassigned < rule_unassigned {
            Ok((predicted, ClassificationSource::Predictor))
        } else {
            debug!(ml_unassigned, rule_unassigned, "predictor not more decisive than rules");
            Ok((rules, ClassificationSource::Rules))
        }
    }

    async fn rule_sets(
        &self,
        project: &ProjectId,
        tests: &[Test],
        commits: &[Commit],
    ) -> Result<TierSets> {
        let inputs = self.impact_inputs(project, commits).await?;
        Ok(rules::classify(tests, &inputs))
    }

    async fn impact_inputs(&self, project: &ProjectId, commits: &[Commit]) -> Result<ImpactInputs> {
        let ids: Vec<CommitId> = commits.iter().map(|c| c.id.clone()).collect();
        let (commit_files, mut commit_areas) = self.touched(&ids).await?;
        if let Some(default) = self.stores.areas.default_area(project).await? {
            commit_areas.remove(&default.id);
        }

        let areas = self
            .stores
            .areas
            .areas(project)
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();

        let defects = self.stores.defects.defects(project).await?;
        let project_defect_tests = defects
            .iter()
            .filter(|d| d.defect_type == DefectType::Project)
            .flat_map(|d| d.associated_tests.iter().cloned())
            .collect();

        let mut fixed_defects = Vec::new();
        for defect in defects.iter().filter(|d| is_fixed_project_defect(d)) {
            let causing: Vec<CommitId> = defect
                .caused_by_commits
                .iter()
                .cloned()
                .chain(defect.created_by_commit.clone())
                .collect();
            let (files, areas) = self.touched(&causing).await?;
            fixed_defects.push(CausalFootprint {
                tests: defect.associated_tests.clone(),
                files,
                areas,
            });
        }

        Ok(ImpactInputs {
            commit_files,
            commit_areas,
            areas,
            fixed_defects,
            project_defect_tests,
            dependency_depth: self.config.area_dependency_depth,
        })
    }

    /// Files and areas changed by `ids`. Commits no longer in the store
    /// contribute nothing.
    async fn touched(&self, ids: &[CommitId]) -> Result<(HashSet<FileId>, HashSet<AreaId>)> {
        let lookups = ids.iter().map(|id| async move {
            let files = self.stores.commits.files_changed(id).await;
            let areas = self.stores.commits.areas_of(id).await;
            match (files, areas) {
                (Ok(files), Ok(areas)) => Ok((files, areas)),
                (Err(StorageError::NotFound { .. }), _)
                | (_, Err(StorageError::NotFound { .. })) => {
                    Ok((BTreeSet::new(), BTreeSet::new()))
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        });

        let mut files = HashSet::new();
        let mut areas = HashSet::new();
        for (f, a) in try_join_all(lookups).await? {
            files.extend(f);
            areas.extend(a);
        }
        Ok((files, areas))
    }

    // -----------------------------------------------------------------------
    // Derived views
    // -----------------------------------------------------------------------

    async fn top_percent(&self, req: &ClassifyRequest, pct: u8) -> Result<Vec<Test>> {
        if pct > 100 {
            return Err(EngineError::InvalidRequest(format!(
                "percentage must be at most 100, got {pct}"
            )));
        }
        if req.repo_kind == RepoKind::Perforce && req.target_branch.is_some() {
            return Err(EngineError::AmbiguousCommitReference(
                "percent selection against a target branch is undefined for perforce projects"
                    .to_string(),
            ));
        }

        let commits = selection::resolve(&self.graph, req).await?;
        let tests = self.stores.tests.tests(&req.project).await?;
        let total = tests.iter().map(|t| t.name.as_str()).collect::<HashSet<_>>().len();
        let limit = pct as usize * total / 100;

        if let Some((predictor, suite, runs)) = self.predictor_gate(req).await? {
            if runs >= self.config.ml_confidence {
                let ranked = predictor::bounded(
                    self.config.predictor_timeout(),
                    predictor.top_by_percent(&tests, &commits, pct),
                )
                .await;
                match ranked {
                    Ok(ids) => {
                        let mut picked = pick_by_ids(&tests, &ids);
                        picked.truncate(limit);
                        return Ok(picked);
                    }
                    Err(e) => obs::emit_predictor_fallback(suite.as_str(), &e),
                }
            }
        }

        let (sets, _) = self.tier_sets(req, &tests, &commits).await?;
        let tiered = sets.dedupe_by_name(&tests);
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates: Vec<Test> = Vec::new();
        for test in tiered.low.iter().chain(tiered.unassigned.iter()) {
            if seen.insert(test.name.clone()) {
                candidates.push(test.clone());
            }
        }

        if let Some(oracle) = &self.oracle {
            let similar = predictor::bounded(
                self.config.predictor_timeout(),
                oracle.similar_tests(&req.project, &commits),
            )
            .await;
            match similar {
                Ok(ids) => {
                    for test in pick_by_ids(&tests, &ids) {
                        if seen.insert(test.name.clone()) {
                            candidates.push(test);
                        }
                    }
                }
                Err(e) => obs::emit_lookup_degraded("similar_tests", &e),
            }
        }

        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn rerun(&self, req: &ClassifyRequest) -> Result<Vec<Test>> {
        let commit = self.view_commit(req).await?;
        let results = self
            .stores
            .runs
            .results_for_commit(&req.project, &commit.id, req.test_suite.as_ref())
            .await?;

        let mut by_test: BTreeMap<TestId, Vec<TestStatus>> = BTreeMap::new();
        for result in results {
            by_test.entry(result.test_id).or_default().push(result.status);
        }
        let ids: HashSet<TestId> = by_test
            .into_iter()
            .filter(|(_, statuses)| statuses.len() == 1 && statuses[0].is_failure())
            .map(|(id, _)| id)
            .collect();

        let tests = self.stores.tests.tests(&req.project).await?;
        Ok(unique_by_name(tests.into_iter().filter(|t| ids.contains(&t.id))))
    }

    /// `(ready, open)` views for the commit's suite runs.
    async fn defect_views(&self, req: &ClassifyRequest) -> Result<(Vec<Test>, Vec<Test>)> {
        let commit = self.view_commit(req).await?;
        let ran: BTreeSet<TestId> = self
            .stores
            .runs
            .results_for_commit(&req.project, &commit.id, req.test_suite.as_ref())
            .await?
            .into_iter()
            .map(|r| r.test_id)
            .collect();

        let mut ready_ids = HashSet::new();
        let mut open_ids = HashSet::new();
        for test_id in &ran {
            for defect in self.stores.defects.defects_for_test(test_id).await? {
                if defect.project_id != req.project || !defect.is_auto_managed() {
                    continue;
                }
                match defect.status {
                    DefectStatus::InProgress | DefectStatus::Verified => {
                        open_ids.insert(test_id.clone());
                    }
                    DefectStatus::Ready => {
                        ready_ids.insert(test_id.clone());
                    }
                    DefectStatus::New | DefectStatus::Closed => {}
                }
            }
        }

        let tests = self.stores.tests.tests(&req.project).await?;
        let open = unique_by_name(tests.iter().filter(|t| open_ids.contains(&t.id)).cloned());
        let open_names: HashSet<&str> = open.iter().map(|t| t.name.as_str()).collect();
        let ready = unique_by_name(
            tests
                .iter()
                .filter(|t| ready_ids.contains(&t.id) && !open_names.contains(t.name.as_str()))
                .cloned(),
        );
        Ok((ready, open))
    }

    async fn view_commit(&self, req: &ClassifyRequest) -> Result<Commit> {
        let id = req.commit.as_ref().ok_or_else(|| {
            EngineError::AmbiguousCommitReference("commit is required for this view".to_string())
        })?;
        selection::project_commit(&self.graph, &req.project, id).await
    }
}

fn is_fixed_project_defect(defect: &Defect) -> bool {
    defect.defect_type == DefectType::Project
        && defect.status == DefectStatus::Closed
        && matches!(
            defect.close_type,
            Some(CloseType::Fixed | CloseType::WontFix)
        )
}

/// Tests in `ids` order, skipping unknown ids and repeated names.
fn pick_by_ids(tests: &[Test], ids: &[TestId]) -> Vec<Test> {
    let mut seen: HashSet<&str> = HashSet::new();
    ids.iter()
        .filter_map(|id| tests.iter().find(|t| &t.id == id))
        .filter(|t| seen.insert(t.name.as_str()))
        .cloned()
        .collect()
}

/// One test per name (lowest id wins), ordered by name.
fn unique_by_name(tests: impl IntoIterator<Item = Test>) -> Vec<Test> {
    let mut by_name: BTreeMap<String, Test> = BTreeMap::new();
    for test in tests {
        match by_name.get(&test.name) {
            Some(existing) if existing.id <= test.id => {}
            _ => {
                by_name.insert(test.name.clone(), test);
            }
        }
    }
    by_name.into_values().collect()
}
