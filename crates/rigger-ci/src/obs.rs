//! Structured observability hooks for pipeline and job lifecycle events.
//!
//! This module provides:
//! - Job-scoped tracing spans via the `JobSpan` guard
//! - Emission functions for key lifecycle events: pipeline start/finish,
//!   artifact fetch/stage, toolchain install, command exit, job finish
//!
//! Events are emitted at `info!` level with an `event` field. For JSON
//! output, run the CLI with `--json`.

use std::path::Path;

use tracing::{info, warn, Instrument};

use crate::artifact::ArtifactSpec;
use crate::error::CiError;
use crate::matrix::JobDescriptor;
use crate::outcome::{Phase, RunOutcome};

/// Tracing span tagged with a job's platform and triple.
pub struct JobSpan;

impl JobSpan {
    /// Span for all records emitted while `job` runs.
    pub fn for_job(job: &JobDescriptor) -> tracing::Span {
        tracing::info_span!(
            "rigger.job",
            platform = %job.platform,
            triple = %job.target_triple
        )
    }

    /// Run `fut` inside the job's span.
    pub fn instrument<F: std::future::Future>(
        job: &JobDescriptor,
        fut: F,
    ) -> tracing::instrument::Instrumented<F> {
        fut.instrument(Self::for_job(job))
    }
}

/// Emit event: pipeline started with its run id and job count.
pub fn emit_pipeline_started(run_id: &str, config_digest: &str, jobs: usize) {
    info!(
        event = "pipeline.started",
        run_id = %run_id,
        config = %&config_digest[..12.min(config_digest.len())],
        jobs = jobs,
    );
}

/// Emit event: branch gate closed, nothing will run.
pub fn emit_pipeline_skipped(run_id: &str, reason: &str) {
    info!(event = "pipeline.skipped", run_id = %run_id, reason = %reason);
}

/// Emit event: pipeline finished.
pub fn emit_pipeline_finished(run_id: &str, status: &str, duration_ms: u64, failed: usize) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        failed_jobs = failed,
    );
}

/// Emit event: a job was dispatched.
pub fn emit_job_started(job: &JobDescriptor) {
    info!(event = "job.started", job = %job.label());
}

/// Emit event: a job produced its terminal outcome.
pub fn emit_job_finished(outcome: &RunOutcome) {
    if outcome.is_success() {
        info!(
            event = "job.finished",
            job = %outcome.job.label(),
            success = true,
            duration_ms = outcome.duration_ms,
        );
    } else {
        warn!(
            event = "job.finished",
            job = %outcome.job.label(),
            success = false,
            phase = %outcome.phase,
            error = outcome.error.as_deref().unwrap_or(""),
            duration_ms = outcome.duration_ms,
        );
    }
}

pub fn emit_artifact_fetched(spec: &ArtifactSpec, bytes: usize, duration_ms: u64) {
    info!(
        event = "artifact.fetched",
        artifact = %spec.name,
        triple = %spec.triple,
        bytes = bytes,
        duration_ms = duration_ms,
    );
}

pub fn emit_artifact_fetch_failed(spec: &ArtifactSpec, error: &CiError) {
    warn!(
        event = "artifact.fetch_failed",
        artifact = %spec.name,
        triple = %spec.triple,
        url = %spec.source_url,
        error = %error,
    );
}

pub fn emit_artifact_staged(spec: &ArtifactSpec) {
    info!(
        event = "artifact.staged",
        artifact = %spec.name,
        path = %spec.destination_path.display(),
    );
}

pub fn emit_toolchain_installed(job: &JobDescriptor, install_dir: &Path) {
    info!(
        event = "toolchain.installed",
        job = %job.label(),
        install_dir = %install_dir.display(),
    );
}

/// Emit event: build or test command exited.
pub fn emit_command_exited(job: &JobDescriptor, phase: Phase, exit_code: i32, duration_ms: u64) {
    info!(
        event = "command.exited",
        job = %job.label(),
        phase = %phase,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_span_instrument() {
        let job = JobDescriptor::new("x64", "t1", true);
        let value = JobSpan::instrument(&job, async { 7 }).await;
        assert_eq!(value, 7);
    }
}
