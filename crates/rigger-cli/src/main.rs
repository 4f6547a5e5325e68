//! Rigger - matrix CI driver
//!
//! The `rigger` command runs a pipeline declaration across its
//! platform x target-triple matrix.
//!
//! ## Commands
//!
//! - `run`: fetch, stage, build and test every job, then report
//! - `plan`: show the jobs, artifacts and environment without running anything
//!
//! ## Exit codes
//!
//! - `0`: every job succeeded, or the branch gate skipped the pipeline
//! - `1`: at least one job failed or was cancelled
//! - `2`: the pipeline declaration is invalid

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

use rigger_ci::{
    plan_job, CancellationToken, CiError, Pipeline, PipelineConfig, StagedArtifacts,
    WorkspaceLayout,
};

/// Exit code for an invalid pipeline declaration.
const EXIT_CONFIGURATION: i32 = 2;

/// CI variables consulted, in order, when no branch is given.
const BRANCH_ENV_FALLBACKS: &[&str] = &["APPVEYOR_REPO_BRANCH", "GITHUB_REF_NAME", "CI_COMMIT_BRANCH"];

#[derive(Parser)]
#[command(name = "rigger")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Matrix CI orchestration: per-triple toolchains, dependencies, build and test", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for every job in the matrix
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Write the JSON report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Ignore SHA-256 pins on artifacts
        #[arg(long)]
        no_verify: bool,
    },

    /// Show resolved jobs, artifact destinations and environment
    Plan {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Pipeline declaration (JSON)
    #[arg(short, long, env = "RIGGER_CONFIG", default_value = "rigger.json")]
    config: PathBuf,

    /// Branch being built (falls back to common CI variables)
    #[arg(short, long, env = "RIGGER_BRANCH")]
    branch: Option<String>,

    /// Root directory for per-job downloads, dependencies and toolchains
    #[arg(long, env = "RIGGER_WORK_ROOT", default_value = ".rigger")]
    work_root: PathBuf,
}

impl TargetArgs {
    fn branch(&self) -> Option<String> {
        resolve_branch(self.branch.clone(), |key| std::env::var(key).ok())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    rigger_ci::init_tracing(cli.json, level);

    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            target,
            report,
            no_verify,
        } => cmd_run(&target, report.as_deref(), no_verify).await,
        Commands::Plan { target } => cmd_plan(&target).map(|()| 0),
    }
}

/// Explicit branch first, then the first non-empty CI variable.
fn resolve_branch<F>(explicit: Option<String>, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    explicit.filter(|b| !b.is_empty()).or_else(|| {
        BRANCH_ENV_FALLBACKS
            .iter()
            .filter_map(|key| lookup(key))
            .find(|b| !b.is_empty())
    })
}

/// Configuration problems exit with 2, everything else with 1.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let is_config = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<CiError>())
        .any(CiError::is_configuration);
    if is_config {
        EXIT_CONFIGURATION
    } else {
        1
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::from_path(path)
        .with_context(|| format!("Failed to load pipeline from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid pipeline in {}", path.display()))?;
    Ok(config)
}

async fn cmd_run(target: &TargetArgs, report_path: Option<&Path>, no_verify: bool) -> Result<i32> {
    let mut config = load_config(&target.config)?;
    if no_verify {
        warn!("Artifact digest verification disabled");
        config.verify_digests = false;
    }

    let branch = target.branch();
    println!("Running pipeline: {}", target.config.display());
    println!("Branch: {}", branch.as_deref().unwrap_or("(unknown)"));
    println!(
        "Matrix: {} platform(s) x {} triple(s)",
        config.matrix.platforms.len(),
        config.matrix.triples.len()
    );
    println!();

    let pipeline = Pipeline::new(config, WorkspaceLayout::new(&target.work_root))
        .context("Failed to set up pipeline")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing running commands, starting nothing new");
            on_signal.cancel();
        }
    });

    let report = pipeline
        .run(branch.as_deref(), cancel)
        .await
        .context("Pipeline failed to run")?;

    println!("Run ID: {}", report.run_id);
    for line in report.summary_lines() {
        println!("{}", line);
    }

    if let Some(path) = report_path {
        let json = report.to_json_pretty()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(report.exit_code())
}

fn cmd_plan(target: &TargetArgs) -> Result<()> {
    let config = load_config(&target.config)?;
    let layout = WorkspaceLayout::new(&target.work_root);
    let pipeline = Pipeline::new(config, layout).context("Failed to set up pipeline")?;

    let branch = target.branch();
    let resolution = pipeline.resolve(branch.as_deref())?;
    println!("Gate: {}", resolution.gate.message);
    if resolution.is_skipped() {
        return Ok(());
    }

    for job in resolution.jobs() {
        let plan = plan_job(pipeline.config(), job, pipeline.layout())?;
        println!();
        println!("{}", job.label());
        for spec in plan.artifacts() {
            let pin = if spec.sha256.is_some() { " (pinned)" } else { "" };
            println!(
                "  fetch {} {}{}\n     -> {}",
                spec.name,
                spec.source_url,
                pin,
                spec.destination_path.display()
            );
        }
        println!("  install -> {}", plan.install_dir.display());

        let staged = StagedArtifacts {
            install_dir: plan.install_dir.clone(),
            deps_dir: plan.deps_dir.clone(),
            files: Vec::new(),
        };
        let env = pipeline.composer().compose(job, &staged)?;
        for dir in env.path_prefix_additions.iter().rev() {
            println!("  PATH += {}", dir.display());
        }
        for (key, value) in &env.extra_vars {
            println!("  {}={}", key, value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const EXAMPLE: &str = include_str!("../rigger.example.json");

    #[test]
    fn test_example_pipeline_is_valid() {
        let config = PipelineConfig::from_json(EXAMPLE).expect("example must parse");
        config.validate().expect("example must validate");
        assert_eq!(config.matrix.cardinality(), 2);
    }

    #[test]
    fn test_explicit_branch_wins() {
        let branch = resolve_branch(Some("auto".to_string()), |_| Some("master".to_string()));
        assert_eq!(branch.as_deref(), Some("auto"));
    }

    #[test]
    fn test_branch_env_fallback_order() {
        let env: HashMap<&str, &str> = [("GITHUB_REF_NAME", "main"), ("CI_COMMIT_BRANCH", "dev")]
            .into_iter()
            .collect();
        let branch = resolve_branch(None, |key| env.get(key).map(|v| v.to_string()));
        assert_eq!(branch.as_deref(), Some("main"));

        let empty_first: HashMap<&str, &str> =
            [("APPVEYOR_REPO_BRANCH", ""), ("CI_COMMIT_BRANCH", "dev")]
                .into_iter()
                .collect();
        let branch = resolve_branch(Some(String::new()), |key| {
            empty_first.get(key).map(|v| v.to_string())
        });
        assert_eq!(branch.as_deref(), Some("dev"));

        assert_eq!(resolve_branch(None, |_| None), None);
    }

    #[test]
    fn test_configuration_errors_exit_2() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, r#"{ "matrix": { "platforms": [], "triples": ["t1"] } }"#).unwrap();
        let err = load_config(&path).unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_CONFIGURATION);

        let missing = load_config(&dir.path().join("missing.json")).unwrap_err();
        assert_eq!(exit_code_for(&missing), EXIT_CONFIGURATION);

        let other = anyhow::anyhow!("disk on fire");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "rigger",
            "--json",
            "run",
            "--config",
            "ci.json",
            "--branch",
            "master",
            "--no-verify",
        ])
        .expect("parse failed");
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                target, no_verify, ..
            } => {
                assert_eq!(target.config, PathBuf::from("ci.json"));
                assert_eq!(target.branch.as_deref(), Some("master"));
                assert!(no_verify);
            }
            Commands::Plan { .. } => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_run_skips_on_closed_gate() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("rigger.json");
        std::fs::write(&config, EXAMPLE).unwrap();
        let report = dir.path().join("report.json");

        let target = TargetArgs {
            config,
            branch: Some("feature/nothing".to_string()),
            work_root: dir.path().join("work"),
        };
        let code = cmd_run(&target, Some(&report), false).await.unwrap();
        assert_eq!(code, 0);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(json["status"], "skipped");
        assert!(!dir.path().join("work").exists());
    }
}
