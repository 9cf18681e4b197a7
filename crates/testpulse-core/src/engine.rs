//! Engine facade wiring the components over one [`StoreSet`].
//!
//! The automaton and the tracer share one [`FingerprintLocks`] table, so a
//! trace write-back never interleaves with a transition of the same defect
//! chain.

use std::collections::HashMap;
use std::sync::Arc;

use testpulse_state::{Commit, CommitFilter, FileId, ProjectId};
use tracing::instrument;

use crate::classifier::{ImpactClassifier, MlPredictor, SimilarTestsOracle};
use crate::config::EngineConfig;
use crate::defect::{DefectAutomaton, FingerprintLocks};
use crate::error::Result;
use crate::graph::CommitGraph;
use crate::hotspot::{FileHotspot, HotspotScorer};
use crate::stores::StoreSet;
use crate::tracer::CausalityTracer;
use crate::worker::TraceWorker;

pub struct Engine {
    config: EngineConfig,
    stores: StoreSet,
    graph: CommitGraph,
    classifier: ImpactClassifier,
    automaton: DefectAutomaton,
    tracer: Arc<CausalityTracer>,
    scorer: HotspotScorer,
}

impl Engine {
    pub fn new(stores: StoreSet, config: EngineConfig) -> Self {
        let locks = FingerprintLocks::new();
        let graph = CommitGraph::new(stores.commits.clone(), stores.runs.clone(), &config.graph);
        let classifier =
            ImpactClassifier::new(stores.clone(), graph.clone(), config.classifier.clone());
        let automaton = DefectAutomaton::new(
            stores.clone(),
            graph.clone(),
            config.defects.clone(),
            locks.clone(),
        );
        let tracer = Arc::new(CausalityTracer::new(
            stores.clone(),
            config.tracer.clone(),
            locks,
        ));
        let scorer = HotspotScorer::new(config.hotspot.clone());
        Self {
            config,
            stores,
            graph,
            classifier,
            automaton,
            tracer,
            scorer,
        }
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn MlPredictor>) -> Self {
        self.classifier = self.classifier.with_predictor(predictor);
        self
    }

    pub fn with_similarity_oracle(mut self, oracle: Arc<dyn SimilarTestsOracle>) -> Self {
        self.classifier = self.classifier.with_similarity_oracle(oracle);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    pub fn classifier(&self) -> &ImpactClassifier {
        &self.classifier
    }

    pub fn automaton(&self) -> &DefectAutomaton {
        &self.automaton
    }

    pub fn tracer(&self) -> &Arc<CausalityTracer> {
        &self.tracer
    }

    pub fn scorer(&self) -> &HotspotScorer {
        &self.scorer
    }

    /// A worker draining the engine's job queue into its tracer.
    pub fn worker(&self) -> TraceWorker {
        TraceWorker::new(
            self.stores.jobs.clone(),
            Arc::clone(&self.tracer),
            self.config.tracer.worker_concurrency,
        )
    }

    /// Ranked file hotspots over the project's commits, optionally limited to
    /// one branch.
    #[instrument(skip(self))]
    pub async fn hotspots(
        &self,
        project: &ProjectId,
        branch: Option<&str>,
    ) -> Result<Vec<FileHotspot>> {
        let commits = self.project_commits(project, branch).await?;
        let mut hotspots = self.scorer.hotspots(&commits);

        let paths: HashMap<FileId, String> = self
            .stores
            .areas
            .files(project)
            .await?
            .into_iter()
            .map(|f| (f.id, f.path))
            .collect();
        for hotspot in &mut hotspots {
            if let Some(path) = paths.get(&hotspot.file_id) {
                hotspot.path = path.clone();
            }
        }
        Ok(hotspots)
    }

    /// The project's commits with `riskiness` filled in from the current
    /// hotspot scores, oldest first.
    pub async fn scored_commits(
        &self,
        project: &ProjectId,
        branch: Option<&str>,
    ) -> Result<Vec<Commit>> {
        let mut commits = self.project_commits(project, branch).await?;
        let scores = self.scorer.score(&commits);
        for commit in &mut commits {
            commit.riskiness = HotspotScorer::commit_riskiness(commit, &scores);
        }
        Ok(commits)
    }

    async fn project_commits(
        &self,
        project: &ProjectId,
        branch: Option<&str>,
    ) -> Result<Vec<Commit>> {
        let filter = match branch {
            Some(branch) => CommitFilter::on_branch(branch),
            None => CommitFilter::default(),
        };
        Ok(self.stores.commits.find(project, &filter).await?)
    }
}
