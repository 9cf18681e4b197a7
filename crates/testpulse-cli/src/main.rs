//! testpulse - test-impact prioritization CLI
//!
//! Runs the engine over a JSON project fixture held in memory.
//!
//! ## Commands
//!
//! - `classify`: tier the project's tests for a commit or commit range
//! - `hotspots`: rank files (or commits, with `--commits`) by decayed change frequency
//! - `replay`: feed the fixture's results through the defect automaton
//! - `config`: print the effective engine configuration

mod fixture;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use testpulse_core::{
    ClassifyRequest, DefectHistory, Engine, EngineConfig, HotspotBucket, RepoKind, Tier,
    TieredTests, METRICS,
};
use testpulse_state::{CommitId, DefectStore, Test};
use tracing::{info, Level};

use fixture::{LoadedProject, ProjectFixture};

#[derive(Parser)]
#[command(name = "testpulse")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Test-impact prioritization and defect lifecycle engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML); TESTPULSE_* variables override it
    #[arg(short, long, global = true, env = "TESTPULSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the project's tests by impact of a commit set
    Classify {
        /// Project fixture (JSON)
        #[arg(short, long)]
        fixture: PathBuf,

        /// Commit sha to classify (the later endpoint of a range)
        #[arg(long)]
        commit: String,

        /// Earlier endpoint of a commit range
        #[arg(long)]
        from: Option<String>,

        /// Branch the range or last run is resolved on
        #[arg(short, long)]
        branch: Option<String>,

        /// Leave the later endpoint out of the range
        #[arg(long)]
        exclusive: bool,

        /// Classify everything since the suite's previous run
        #[arg(long)]
        since_last_run: bool,

        /// Suite name (enables the predictor gate and last-run lookup)
        #[arg(short, long)]
        suite: Option<String>,

        /// Print one view instead of all tiers (high, medium, low,
        /// unassigned, rerun, ready-defect, open-defect or N%)
        #[arg(short, long)]
        tier: Option<String>,

        /// Treat the repository as Perforce
        #[arg(long)]
        perforce: bool,
    },

    /// Rank files by change hotspot score
    Hotspots {
        /// Project fixture (JSON)
        #[arg(short, long)]
        fixture: PathBuf,

        /// Only count commits on this branch
        #[arg(short, long)]
        branch: Option<String>,

        /// Maximum number of files to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Rank commits by riskiness instead of files
        #[arg(long)]
        commits: bool,
    },

    /// Replay the fixture's results through the defect automaton
    Replay {
        /// Project fixture (JSON)
        #[arg(short, long)]
        fixture: PathBuf,
    },

    /// Print the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    testpulse_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Classify {
            fixture,
            commit,
            from,
            branch,
            exclusive,
            since_last_run,
            suite,
            tier,
            perforce,
        } => {
            let loaded = load_fixture(&fixture)?;
            let mut req = if since_last_run {
                let (Some(branch), Some(suite)) = (&branch, &suite) else {
                    bail!("--since-last-run needs both --branch and --suite");
                };
                ClassifyRequest::since_last_run(
                    loaded.project.clone(),
                    CommitId::from(commit.as_str()),
                    branch.as_str(),
                    loaded.suite_id(suite),
                )
            } else if let Some(from) = &from {
                let Some(branch) = &branch else {
                    bail!("--from needs --branch");
                };
                ClassifyRequest::between(
                    loaded.project.clone(),
                    CommitId::from(from.as_str()),
                    CommitId::from(commit.as_str()),
                    branch.as_str(),
                    exclusive,
                )
            } else {
                let mut req = ClassifyRequest::single(
                    loaded.project.clone(),
                    CommitId::from(commit.as_str()),
                );
                req.target_branch = branch.clone();
                req
            };
            if let Some(suite) = &suite {
                req = req.with_suite(loaded.suite_id(suite));
            }
            if perforce {
                req = req.with_repo_kind(RepoKind::Perforce);
            }
            cmd_classify(config, loaded, &req, tier.as_deref(), cli.json).await
        }
        Commands::Hotspots {
            fixture,
            branch,
            limit,
            commits,
        } => {
            let loaded = load_fixture(&fixture)?;
            if commits {
                cmd_risky_commits(config, loaded, branch.as_deref(), limit, cli.json).await
            } else {
                cmd_hotspots(config, loaded, branch.as_deref(), limit, cli.json).await
            }
        }
        Commands::Replay { fixture } => cmd_replay(config, load_fixture(&fixture)?, cli.json).await,
        Commands::Config => cmd_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::from_env(),
    };
    config.context("Failed to load engine configuration")
}

fn load_fixture(path: &Path) -> Result<LoadedProject> {
    ProjectFixture::load(path)?
        .into_project()
        .with_context(|| format!("Failed to seed stores from {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_tests(label: &str, tests: &[Test]) {
    println!("{label} ({}):", tests.len());
    for test in tests {
        println!("  {}", test.name);
    }
}

/// Classify or select one view
async fn cmd_classify(
    config: EngineConfig,
    loaded: LoadedProject,
    req: &ClassifyRequest,
    tier: Option<&str>,
    json: bool,
) -> Result<()> {
    loaded.ingest_all();
    let engine = Engine::new(loaded.stores.store_set(), config);

    if let Some(raw) = tier {
        let tier: Tier = raw.parse().context("Invalid --tier")?;
        let tests = engine
            .classifier()
            .select(req, tier)
            .await
            .context("Selection failed")?;
        if json {
            return print_json(&tests);
        }
        print_tests(raw, &tests);
        return Ok(());
    }

    let classification = engine
        .classifier()
        .classify(req)
        .await
        .context("Classification failed")?;
    if json {
        return print_json(&classification);
    }

    let commits: Vec<&str> = classification.commits.iter().map(|c| c.as_str()).collect();
    println!("Commits: {}", commits.join(", "));
    println!("Source:  {}", classification.source);
    println!();
    let TieredTests {
        high,
        medium,
        low,
        unassigned,
    } = &classification.tiers;
    print_tests("High", high);
    print_tests("Medium", medium);
    print_tests("Low", low);
    print_tests("Unassigned", unassigned);
    Ok(())
}

/// Rank files by hotspot score
async fn cmd_hotspots(
    config: EngineConfig,
    loaded: LoadedProject,
    branch: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let engine = Engine::new(loaded.stores.store_set(), config);
    let mut hotspots = engine.hotspots(&loaded.project, branch).await?;
    hotspots.truncate(limit);

    if json {
        return print_json(&hotspots);
    }
    if hotspots.is_empty() {
        println!("No files changed");
        return Ok(());
    }
    for hotspot in hotspots {
        let bucket = match hotspot.bucket {
            HotspotBucket::Red => "red",
            HotspotBucket::Orange => "orange",
            HotspotBucket::Green => "green",
        };
        println!("{:>8.3}  {:<6}  {}", hotspot.score, bucket, hotspot.path);
    }
    Ok(())
}

#[derive(Serialize)]
struct CommitRisk {
    sha: String,
    timestamp: String,
    riskiness: f64,
}

/// Rank commits by the mean hotspot score of the files they touch
async fn cmd_risky_commits(
    config: EngineConfig,
    loaded: LoadedProject,
    branch: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let engine = Engine::new(loaded.stores.store_set(), config);
    let mut commits = engine.scored_commits(&loaded.project, branch).await?;
    commits.sort_by(|a, b| {
        b.riskiness
            .partial_cmp(&a.riskiness)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
    commits.truncate(limit);

    let ranked: Vec<CommitRisk> = commits
        .iter()
        .map(|c| CommitRisk {
            sha: c.sha.clone(),
            timestamp: c.timestamp.to_rfc3339(),
            riskiness: c.riskiness,
        })
        .collect();
    if json {
        return print_json(&ranked);
    }
    for commit in &ranked {
        println!("{:>8.3}  {}  {}", commit.riskiness, commit.sha, commit.timestamp);
    }
    Ok(())
}

#[derive(Serialize)]
struct DefectSummary {
    id: String,
    status: String,
    defect_type: String,
    tests: Vec<String>,
    caused_by: Vec<String>,
    closed_by: Vec<String>,
    reopened_from: Vec<String>,
}

/// Replay results in fixture order, then drain the trace queue
async fn cmd_replay(config: EngineConfig, loaded: LoadedProject, json: bool) -> Result<()> {
    let engine = Engine::new(loaded.stores.store_set(), config);

    for result in &loaded.results {
        loaded.stores.runs.insert_result(result.clone());
        let outcome = engine
            .automaton()
            .handle_result(result)
            .await
            .with_context(|| format!("Failed to apply result {}", result.id))?;
        for transition in &outcome.transitions {
            info!(test_id = %result.test_id, transition = ?transition, "replayed");
        }
    }

    let report = engine.worker().drain().await.context("Trace worker failed")?;
    METRICS.flush();

    let defects = loaded.stores.defects.defects(&loaded.project).await?;
    let mut summaries = Vec::with_capacity(defects.len());
    for defect in &defects {
        let history = DefectHistory::chain(loaded.stores.defects.as_ref(), &defect.id).await?;
        summaries.push(DefectSummary {
            id: defect.id.to_string(),
            status: format!("{:?}", defect.status),
            defect_type: format!("{:?}", defect.defect_type),
            tests: defect.associated_tests.iter().map(|t| t.to_string()).collect(),
            caused_by: defect.caused_by_commits.iter().map(|c| c.to_string()).collect(),
            closed_by: defect.closed_by_commits.iter().map(|c| c.to_string()).collect(),
            reopened_from: history.iter().skip(1).map(|d| d.id.to_string()).collect(),
        });
    }

    if json {
        return print_json(&serde_json::json!({
            "defects": summaries,
            "worker": report,
        }));
    }

    println!(
        "Replayed {} results: {} defects, {} traces completed, {} failed",
        loaded.results.len(),
        summaries.len(),
        report.completed,
        report.failed
    );
    for summary in &summaries {
        println!();
        println!("defect {}", summary.id);
        println!("  Status:    {} ({})", summary.status, summary.defect_type);
        println!("  Tests:     {}", summary.tests.join(", "));
        println!("  Caused by: {}", summary.caused_by.join(", "));
        if !summary.closed_by.is_empty() {
            println!("  Closed by: {}", summary.closed_by.join(", "));
        }
        if !summary.reopened_from.is_empty() {
            println!("  Reopened:  {}", summary.reopened_from.join(" <- "));
        }
    }
    for (job_id, error) in &report.failures {
        println!("trace job {job_id} failed: {error}");
    }
    Ok(())
}

fn cmd_config(config: &EngineConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
