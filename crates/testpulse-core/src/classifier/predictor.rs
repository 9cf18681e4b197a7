//! External ML collaborators of the classifier.
//!
//! Both the tier predictor and the similar-tests oracle are explicit handles
//! owned by the caller and handed to [`super::ImpactClassifier`]. Every call
//! is bounded by a timeout, and every failure is a [`PredictorError`] that
//! the classifier recovers from by falling back to the rule-based tiers.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use testpulse_state::{Commit, ProjectId, SuiteId, Test, TestId};

use super::rules::{ImpactTier, TierSets};

/// Why predictor output was not used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredictorError {
    #[error("predictor unavailable: {0}")]
    Unavailable(String),

    #[error("predictor timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed prediction: {0}")]
    Malformed(String),
}

/// Raw tier output of a predictor, by test id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPrediction {
    #[serde(default)]
    pub high: Vec<TestId>,
    #[serde(default)]
    pub medium: Vec<TestId>,
    #[serde(default)]
    pub low: Vec<TestId>,
    #[serde(default)]
    pub unassigned: Vec<TestId>,
}

/// A trained test-impact model.
#[async_trait]
pub trait MlPredictor: Send + Sync {
    /// Whether a model has been loaded for `suite`.
    fn is_loaded(&self, suite: &SuiteId) -> bool;

    async fn classify(
        &self,
        tests: &[Test],
        commits: &[Commit],
    ) -> Result<TierPrediction, PredictorError>;

    /// The `percent` share of `tests` the model ranks most likely to fail.
    async fn top_by_percent(
        &self,
        tests: &[Test],
        commits: &[Commit],
        percent: u8,
    ) -> Result<Vec<TestId>, PredictorError>;
}

/// Ranks tests that historically failed alongside similar commits.
#[async_trait]
pub trait SimilarTestsOracle: Send + Sync {
    async fn similar_tests(
        &self,
        project: &ProjectId,
        commits: &[Commit],
    ) -> Result<Vec<TestId>, PredictorError>;
}

/// Await an external call for at most `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, PredictorError>
where
    F: Future<Output = Result<T, PredictorError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| PredictorError::Timeout(limit))?
}

/// Check a prediction against the project's tests and turn it into tier sets.
///
/// Unknown test ids and ids placed in two tiers make the whole prediction
/// malformed. Tests the model left out are treated as unassigned.
pub(crate) fn validate(
    prediction: TierPrediction,
    tests: &[Test],
) -> Result<TierSets, PredictorError> {
    let known: HashSet<&TestId> = tests.iter().map(|t| &t.id).collect();
    let mut assigned: HashMap<TestId, ImpactTier> = HashMap::new();

    for (tier, ids) in [
        (ImpactTier::High, prediction.high),
        (ImpactTier::Medium, prediction.medium),
        (ImpactTier::Low, prediction.low),
        (ImpactTier::Unassigned, prediction.unassigned),
    ] {
        for id in ids {
            if !known.contains(&id) {
                return Err(PredictorError::Malformed(format!("unknown test {id}")));
            }
            if let Some(previous) = assigned.insert(id.clone(), tier) {
                if previous != tier {
                    return Err(PredictorError::Malformed(format!(
                        "test {id} predicted as both {previous:?} and {tier:?}"
                    )));
                }
            }
        }
    }

    let mut sets = TierSets::default();
    for test in tests {
        let tier = assigned.get(&test.id).copied().unwrap_or(ImpactTier::Unassigned);
        sets.insert(tier, test.id.clone());
    }
    Ok(sets)
}
