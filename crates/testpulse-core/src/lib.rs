//! testpulse core library
//!
//! Test-impact classification, defect lifecycle automation and causal commit
//! tracing over the stores defined in `testpulse-state`.

pub mod classifier;
pub mod config;
pub mod defect;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod hotspot;
pub mod metrics;
pub mod obs;
pub mod stores;
pub mod telemetry;
pub mod tracer;
pub mod worker;

pub use classifier::{
    Classification, ClassificationSource, ClassifyRequest, CommitSelection, ImpactClassifier,
    ImpactTier, MlPredictor, PredictorError, RepoKind, SimilarTestsOracle, Tier, TierPrediction,
    TieredTests,
};
pub use config::{
    ClassifierConfig, DecayCurve, DefectConfig, EngineConfig, GraphConfig, HotspotConfig,
    TracerConfig,
};
pub use defect::{DefectAutomaton, DefectHistory, DefectOutcome, FingerprintLocks, Transition};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use fingerprint::fingerprint;
pub use graph::CommitGraph;
pub use hotspot::{FileHotspot, HotspotBucket, HotspotScorer};
pub use stores::{MemoryStores, StoreSet};
pub use tracer::{CausalityTracer, TraceOutcome};
pub use worker::{TraceWorker, WorkerReport};

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// testpulse version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
