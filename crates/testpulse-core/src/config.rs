//! Engine configuration.
//!
//! Configuration is read from a TOML document (every key optional) and then
//! overridden from `TESTPULSE_*` environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `TESTPULSE_MINIMAL_HISTORY` | `classifier.minimal_history` |
//! | `TESTPULSE_ML_CONFIDENCE` | `classifier.ml_confidence` |
//! | `TESTPULSE_PREDICTOR_TIMEOUT_MS` | `classifier.predictor_timeout_ms` |
//! | `TESTPULSE_FLAKY_HISTORY_LIMIT` | `defects.flaky_history_limit` |
//! | `TESTPULSE_TRACE_MAX_DEPTH` | `tracer.max_depth` |
//! | `TESTPULSE_LAST_RUN_WINDOW_HOURS` | `graph.last_run_window_hours` |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub classifier: ClassifierConfig,
    pub defects: DefectConfig,
    pub tracer: TracerConfig,
    pub graph: GraphConfig,
    pub hotspot: HotspotConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Suite runs required before the ML predictor is consulted at all.
    pub minimal_history: usize,
    /// Suite runs after which ML output is trusted without comparison.
    pub ml_confidence: usize,
    /// Upper bound on a single predictor call.
    pub predictor_timeout_ms: u64,
    /// Hops followed along area dependency edges for the Medium tier.
    pub area_dependency_depth: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            minimal_history: 50,
            ml_confidence: 500,
            predictor_timeout_ms: 5_000,
            area_dependency_depth: 5,
        }
    }
}

impl ClassifierConfig {
    pub fn predictor_timeout(&self) -> Duration {
        Duration::from_millis(self.predictor_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefectConfig {
    /// Recent statuses inspected when deciding whether a failure is flaky.
    pub flaky_history_limit: usize,
    /// Auto-close policy when a result's suite cannot be resolved.
    pub auto_close_default: bool,
}

impl Default for DefectConfig {
    fn default() -> Self {
        Self {
            flaky_history_limit: 10,
            auto_close_default: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub max_depth: usize,
    /// Trace jobs processed concurrently by a worker.
    pub worker_concurrency: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            worker_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Lookback window for "last run" commit resolution.
    pub last_run_window_hours: i64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            last_run_window_hours: 24,
        }
    }
}

impl GraphConfig {
    pub fn last_run_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.last_run_window_hours)
    }
}

/// Decay curve applied to a file touch by its age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayCurve {
    /// Bugspots: `1 / (1 + e^(-12t + 12))`, `t` = normalised position in the window.
    Logistic,
    /// `1 / (1 + age_days)` relative to the newest commit.
    ReciprocalAge,
}

/// Hotspot scoring knobs. The bucket fractions are tunables, not constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotspotConfig {
    pub decay: DecayCurve,
    /// Share of scored files placed in the Red bucket.
    pub red_fraction: f64,
    /// Share of scored files placed in the Orange bucket.
    pub orange_fraction: f64,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            decay: DecayCurve::Logistic,
            red_fraction: 0.10,
            orange_fraction: 0.20,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        let mut config: EngineConfig =
            toml::from_str(&raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TESTPULSE_*` overrides resolved through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| EngineError::Config(format!("{key}: cannot parse {value:?}")))
        }

        if let Some(v) = lookup("TESTPULSE_MINIMAL_HISTORY") {
            self.classifier.minimal_history = parse("TESTPULSE_MINIMAL_HISTORY", v)?;
        }
        if let Some(v) = lookup("TESTPULSE_ML_CONFIDENCE") {
            self.classifier.ml_confidence = parse("TESTPULSE_ML_CONFIDENCE", v)?;
        }
        if let Some(v) = lookup("TESTPULSE_PREDICTOR_TIMEOUT_MS") {
            self.classifier.predictor_timeout_ms = parse("TESTPULSE_PREDICTOR_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("TESTPULSE_FLAKY_HISTORY_LIMIT") {
            self.defects.flaky_history_limit = parse("TESTPULSE_FLAKY_HISTORY_LIMIT", v)?;
        }
        if let Some(v) = lookup("TESTPULSE_TRACE_MAX_DEPTH") {
            self.tracer.max_depth = parse("TESTPULSE_TRACE_MAX_DEPTH", v)?;
        }
        if let Some(v) = lookup("TESTPULSE_LAST_RUN_WINDOW_HOURS") {
            self.graph.last_run_window_hours = parse("TESTPULSE_LAST_RUN_WINDOW_HOURS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.classifier;
        if c.ml_confidence < c.minimal_history {
            return Err(EngineError::Config(format!(
                "classifier.ml_confidence ({}) must be >= classifier.minimal_history ({})",
                c.ml_confidence, c.minimal_history
            )));
        }
        if c.predictor_timeout_ms == 0 {
            return Err(EngineError::Config(
                "classifier.predictor_timeout_ms must be positive".to_string(),
            ));
        }
        if self.tracer.max_depth == 0 {
            return Err(EngineError::Config(
                "tracer.max_depth must be positive".to_string(),
            ));
        }
        if self.tracer.worker_concurrency == 0 {
            return Err(EngineError::Config(
                "tracer.worker_concurrency must be positive".to_string(),
            ));
        }
        if self.defects.flaky_history_limit < 2 {
            return Err(EngineError::Config(
                "defects.flaky_history_limit must be at least 2".to_string(),
            ));
        }
        if self.graph.last_run_window_hours < 0 {
            return Err(EngineError::Config(
                "graph.last_run_window_hours must not be negative".to_string(),
            ));
        }
        let h = &self.hotspot;
        let in_unit = |f: f64| (0.0..=1.0).contains(&f);
        if !in_unit(h.red_fraction)
            || !in_unit(h.orange_fraction)
            || h.red_fraction + h.orange_fraction > 1.0
        {
            return Err(EngineError::Config(format!(
                "hotspot fractions must lie in [0, 1] and sum to at most 1 (red {}, orange {})",
                h.red_fraction, h.orange_fraction
            )));
        }
        Ok(())
    }

    /// Render as TOML (used by `testpulse config`).
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }
}
