//! Pipeline driver.
//!
//! Resolves the matrix once, then runs every job through
//! fetch -> stage -> compose -> build/test. Jobs are independent: they run
//! concurrently (bounded by `max_parallel`) and one job's failure never
//! stops the others.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::{plan_job, WorkspaceLayout};
use crate::config::PipelineConfig;
use crate::env::EnvironmentComposer;
use crate::error::Result;
use crate::fetch::{ArtifactFetcher, ArtifactSource, UrlSource};
use crate::matrix::{JobDescriptor, MatrixResolver, Resolution};
use crate::obs::{self, JobSpan};
use crate::outcome::{Phase, PhaseTracker, RunOutcome};
use crate::report::{PipelineReport, PipelineStatus};
use crate::runner::{BuildTestRunner, CommandExecutor, CommandSpec, ProcessExecutor};
use crate::stage::{sweep_partials, FilesystemStager, Installer, ProcessInstaller};

/// Orchestrates a whole pipeline invocation.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    config: PipelineConfig,
    layout: WorkspaceLayout,
    fetcher: ArtifactFetcher,
    stager: FilesystemStager,
    composer: EnvironmentComposer,
    runner: BuildTestRunner,
}

impl Pipeline {
    /// Pipeline backed by real downloads, installers and child processes.
    pub fn new(config: PipelineConfig, layout: WorkspaceLayout) -> Result<Self> {
        let source = Arc::new(UrlSource::new()?);
        Self::with_collaborators(
            config,
            layout,
            source,
            Arc::new(ProcessInstaller),
            Arc::new(ProcessExecutor),
        )
    }

    /// Pipeline with explicit collaborators. The configuration is validated
    /// here, before any job is resolved.
    pub fn with_collaborators(
        config: PipelineConfig,
        layout: WorkspaceLayout,
        source: Arc<dyn ArtifactSource>,
        installer: Arc<dyn Installer>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        config.validate()?;

        let fetcher = ArtifactFetcher::new(source)
            .with_timeout_secs(config.timeouts.fetch_secs)
            .with_verification(config.verify_digests);
        let stager = FilesystemStager::new(installer, &config.toolchain, &config.timeouts);
        let composer = EnvironmentComposer::from_config(&config);
        let runner = BuildTestRunner::new(
            executor,
            CommandSpec::new(Phase::Build, config.build.clone(), config.timeouts.build_secs),
            CommandSpec::new(Phase::Test, config.test.clone(), config.timeouts.test_secs),
            config.work_dir.clone(),
        );

        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                layout,
                fetcher,
                stager,
                composer,
                runner,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.inner.layout
    }

    pub fn composer(&self) -> &EnvironmentComposer {
        &self.inner.composer
    }

    /// Resolve the matrix for `branch` without running anything.
    pub fn resolve(&self, branch: Option<&str>) -> Result<Resolution> {
        let config = &self.inner.config;
        MatrixResolver::resolve(&config.matrix, &config.branch_gate, branch)
    }

    /// Run the pipeline for `branch`.
    ///
    /// Only configuration problems are returned as `Err`; every job failure
    /// is captured in the report. Cancelling `cancel` stops new jobs and new
    /// phases from starting, while commands already running are allowed to
    /// finish.
    pub async fn run(&self, branch: Option<&str>, cancel: CancellationToken) -> Result<PipelineReport> {
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let config_digest = self.inner.config.digest()?;

        let resolution = self.resolve(branch)?;
        if resolution.is_skipped() {
            obs::emit_pipeline_skipped(&run_id, &resolution.gate.message);
            return Ok(PipelineReport {
                run_id,
                config_digest,
                gate: resolution.gate,
                started_at,
                status: PipelineStatus::Skipped,
                outcomes: Vec::new(),
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let jobs = resolution.jobs;
        obs::emit_pipeline_started(&run_id, &config_digest, jobs.len());

        let permits = self
            .inner
            .config
            .max_parallel
            .unwrap_or(jobs.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut handles: Vec<(JobDescriptor, PhaseTracker, Option<JoinHandle<RunOutcome>>)> =
            Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!(job = %job.label(), "Not dispatched");
                handles.push((job, PhaseTracker::new(), None));
                continue;
            };

            let inner = self.inner.clone();
            let cancel = cancel.clone();
            let task_job = job.clone();
            let tracker = PhaseTracker::new();
            let task_tracker = tracker.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let span_job = task_job.clone();
                JobSpan::instrument(&span_job, inner.run_job(task_job, cancel, task_tracker)).await
            });
            handles.push((job, tracker, Some(handle)));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (job, tracker, handle) in handles {
            let outcome = match handle {
                None => {
                    let outcome = RunOutcome::cancelled(job, Phase::Fetch, 0);
                    obs::emit_job_finished(&outcome);
                    outcome
                }
                Some(handle) => match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let phase = tracker.current();
                        let outcome =
                            RunOutcome::failed(job, phase, format!("job task aborted: {}", e), 0);
                        obs::emit_job_finished(&outcome);
                        outcome
                    }
                },
            };
            outcomes.push(outcome);
        }

        let status = PipelineStatus::from_outcomes(&outcomes);
        let duration_ms = start.elapsed().as_millis() as u64;
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        obs::emit_pipeline_finished(&run_id, status.as_str(), duration_ms, failed);

        Ok(PipelineReport {
            run_id,
            config_digest,
            gate: resolution.gate,
            started_at,
            status,
            outcomes,
            duration_ms,
        })
    }
}

impl PipelineInner {
    /// One job, start to finish. Always yields an outcome.
    ///
    /// `tracker` is advanced before each phase starts.
    async fn run_job(&self, job: JobDescriptor, cancel: CancellationToken, tracker: PhaseTracker) -> RunOutcome {
        let start = Instant::now();
        let elapsed = || start.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            return finish(RunOutcome::cancelled(job, Phase::Fetch, elapsed()));
        }
        obs::emit_job_started(&job);

        let plan = match plan_job(&self.config, &job, &self.layout) {
            Ok(plan) => plan,
            Err(e) => return finish(RunOutcome::failed(job, Phase::Fetch, e.to_string(), elapsed())),
        };

        let artifacts = plan.artifacts();
        for spec in &artifacts {
            if let Some(parent) = spec.destination_path.parent() {
                sweep_partials(parent);
            }
        }

        let results = self.fetcher.fetch_all(&artifacts).await;
        if let Some(bad) = results.iter().find(|r| !r.is_ok()) {
            let error = bad
                .error
                .clone()
                .unwrap_or_else(|| format!("failed to fetch {}", bad.spec.source_url));
            return finish(RunOutcome::failed(job, Phase::Fetch, error, elapsed()));
        }

        if cancel.is_cancelled() {
            return finish(RunOutcome::cancelled(job, Phase::Stage, elapsed()));
        }
        tracker.enter(Phase::Stage);

        let staged = match self.stager.stage(&job, &plan, results).await {
            Ok(staged) => staged,
            Err(e) => return finish(RunOutcome::failed(job, Phase::Stage, e.to_string(), elapsed())),
        };

        if cancel.is_cancelled() {
            return finish(RunOutcome::cancelled(job, Phase::Build, elapsed()));
        }

        let env = match self.composer.compose(&job, &staged) {
            Ok(env) => env,
            Err(e) => return finish(RunOutcome::failed(job, Phase::Stage, e.to_string(), elapsed())),
        };
        info!(
            job = %job.label(),
            prepends = env.path_prefix_additions.len(),
            "Environment composed"
        );

        let mut outcome = self.runner.run_tracked(&job, &env, &cancel, &tracker).await;
        outcome.duration_ms = elapsed();
        finish(outcome)
    }
}

fn finish(outcome: RunOutcome) -> RunOutcome {
    obs::emit_job_finished(&outcome);
    outcome
}
