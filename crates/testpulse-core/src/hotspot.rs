//! Bugspots-style file hotspot scoring.
//!
//! Every commit that touches a file adds a weight to that file's score. The
//! weight shrinks with the commit's age (see [`DecayCurve`]), so files changed
//! often and recently score highest. Scored files are then split into Red,
//! Orange and Green buckets by the configured fractions.
//!
//! The scorer holds no state besides its configuration and is safe to share
//! across threads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use testpulse_state::{Commit, FileId};

use crate::config::{DecayCurve, HotspotConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotspotBucket {
    Red,
    Orange,
    Green,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHotspot {
    pub file_id: FileId,
    /// Path from the project's file tree; the file id when the file is not
    /// registered there.
    pub path: String,
    pub score: f64,
    pub bucket: HotspotBucket,
}

#[derive(Debug, Clone, Default)]
pub struct HotspotScorer {
    config: HotspotConfig,
}

impl HotspotScorer {
    pub fn new(config: HotspotConfig) -> Self {
        Self { config }
    }

    /// Accumulated decayed weight per file over `commits`.
    ///
    /// Ages are measured against the newest commit in the slice, so the
    /// result depends only on the input, never on the wall clock.
    pub fn score(&self, commits: &[Commit]) -> HashMap<FileId, f64> {
        let mut scores: HashMap<FileId, f64> = HashMap::new();
        let (Some(oldest), Some(newest)) = (
            commits.iter().map(|c| c.timestamp).min(),
            commits.iter().map(|c| c.timestamp).max(),
        ) else {
            return scores;
        };
        let span_secs = (newest - oldest).num_seconds() as f64;

        for commit in commits {
            let weight = match self.config.decay {
                DecayCurve::Logistic => {
                    let t = if span_secs > 0.0 {
                        (commit.timestamp - oldest).num_seconds() as f64 / span_secs
                    } else {
                        1.0
                    };
                    1.0 / (1.0 + (-12.0 * t + 12.0).exp())
                }
                DecayCurve::ReciprocalAge => {
                    let age_days = (newest - commit.timestamp).num_seconds() as f64 / 86_400.0;
                    1.0 / (1.0 + age_days)
                }
            };
            for file in &commit.files {
                *scores.entry(file.clone()).or_insert(0.0) += weight;
            }
        }
        scores
    }

    /// Files ordered by descending score with their bucket assigned.
    ///
    /// Bucket sizes round up, so any non-empty input has at least one Red file
    /// when `red_fraction > 0`. Equal scores are ordered by file id.
    pub fn rank(&self, scores: &HashMap<FileId, f64>) -> Vec<FileHotspot> {
        let mut ranked: Vec<(&FileId, f64)> = scores.iter().map(|(f, s)| (f, *s)).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        let n = ranked.len() as f64;
        let red = (n * self.config.red_fraction).ceil() as usize;
        let orange = red + (n * self.config.orange_fraction).ceil() as usize;

        ranked
            .into_iter()
            .enumerate()
            .map(|(i, (file_id, score))| FileHotspot {
                file_id: file_id.clone(),
                path: file_id.to_string(),
                score,
                bucket: if i < red {
                    HotspotBucket::Red
                } else if i < orange {
                    HotspotBucket::Orange
                } else {
                    HotspotBucket::Green
                },
            })
            .collect()
    }

    /// Score then rank in one step.
    pub fn hotspots(&self, commits: &[Commit]) -> Vec<FileHotspot> {
        self.rank(&self.score(commits))
    }

    /// Mean score of the files a commit touches; 0 for commits without files.
    pub fn commit_riskiness(commit: &Commit, scores: &HashMap<FileId, f64>) -> f64 {
        if commit.files.is_empty() {
            return 0.0;
        }
        let total: f64 = commit
            .files
            .iter()
            .map(|f| scores.get(f).copied().unwrap_or(0.0))
            .sum();
        total / commit.files.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use testpulse_state::ProjectId;

    fn commit_at(days_ago: i64, files: &[&FileId]) -> Commit {
        let mut c = Commit::new(
            ProjectId::from("p"),
            format!("sha-{days_ago}"),
            Utc::now() - Duration::days(days_ago),
        );
        for f in files {
            c = c.touching(f);
        }
        c
    }

    #[test]
    fn recent_touch_outweighs_old_touch() {
        for decay in [DecayCurve::Logistic, DecayCurve::ReciprocalAge] {
            let scorer = HotspotScorer::new(HotspotConfig {
                decay,
                ..HotspotConfig::default()
            });
            let old = FileId::from("old.rs");
            let new = FileId::from("new.rs");
            let commits = vec![commit_at(30, &[&old]), commit_at(0, &[&new])];

            let scores = scorer.score(&commits);
            assert!(scores[&new] > scores[&old], "{decay:?}");
        }
    }

    #[test]
    fn frequency_increases_score() {
        let scorer = HotspotScorer::default();
        let busy = FileId::from("busy.rs");
        let quiet = FileId::from("quiet.rs");
        let commits = vec![
            commit_at(10, &[&busy, &quiet]),
            commit_at(5, &[&busy]),
            commit_at(0, &[&busy, &quiet]),
        ];

        let scores = scorer.score(&commits);
        assert!(scores[&busy] > scores[&quiet]);
    }

    #[test]
    fn empty_input_scores_nothing() {
        assert!(HotspotScorer::default().score(&[]).is_empty());
    }

    #[test]
    fn buckets_follow_configured_fractions() {
        let scorer = HotspotScorer::default();
        let scores: HashMap<FileId, f64> = (0..10)
            .map(|i| (FileId::from(format!("f{i}")), i as f64))
            .collect();

        let ranked = scorer.rank(&scores);
        assert_eq!(ranked[0].file_id, FileId::from("f9"));
        assert_eq!(ranked[0].bucket, HotspotBucket::Red);
        let count = |b| ranked.iter().filter(|h| h.bucket == b).count();
        assert_eq!(count(HotspotBucket::Red), 1);
        assert_eq!(count(HotspotBucket::Orange), 2);
        assert_eq!(count(HotspotBucket::Green), 7);
    }

    #[test]
    fn riskiness_is_mean_of_file_scores() {
        let a = FileId::from("a");
        let b = FileId::from("b");
        let commit = commit_at(0, &[&a, &b]);
        let scores: HashMap<FileId, f64> = [(a, 1.0), (b, 3.0)].into_iter().collect();
        assert_eq!(HotspotScorer::commit_riskiness(&commit, &scores), 2.0);
        assert_eq!(
            HotspotScorer::commit_riskiness(&commit_at(0, &[]), &scores),
            0.0
        );
    }
}
