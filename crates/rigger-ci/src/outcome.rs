//! Per-job terminal records.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::matrix::JobDescriptor;

/// Phase of a job's lifecycle, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch = 0,
    Stage = 1,
    Build = 2,
    Test = 3,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Build => "build",
            Phase::Test => "test",
        }
    }
}

/// Last phase a running job entered, readable from outside the job's task.
///
/// The pipeline reads it when a job task dies without producing an outcome.
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    current: Arc<AtomicU8>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, phase: Phase) {
        self.current.store(phase as u8, Ordering::Release);
    }

    pub fn current(&self) -> Phase {
        match self.current.load(Ordering::Acquire) {
            1 => Phase::Stage,
            2 => Phase::Build,
            3 => Phase::Test,
            _ => Phase::Fetch,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "phase")]
pub enum JobStatus {
    Succeeded,
    Failed(Phase),
    /// Stopped by pipeline cancellation before the given phase ran.
    Cancelled(Phase),
}

/// Terminal, immutable record of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutcome {
    /// The job this outcome belongs to.
    pub job: JobDescriptor,

    /// Last phase the job entered.
    pub phase: Phase,

    /// Terminal status.
    pub status: JobStatus,

    /// Build exit code, `None` if the build never ran.
    pub build_exit: Option<i32>,

    /// Test exit code, `None` if the tests never ran.
    pub test_exit: Option<i32>,

    /// Failure description, if any.
    pub error: Option<String>,

    /// Wall-clock duration of the job in milliseconds.
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Job completed build and test with exit 0.
    pub fn succeeded(job: JobDescriptor, duration_ms: u64) -> Self {
        Self {
            job,
            phase: Phase::Test,
            status: JobStatus::Succeeded,
            build_exit: Some(0),
            test_exit: Some(0),
            error: None,
            duration_ms,
        }
    }

    /// Job failed during `phase` before any command ran.
    pub fn failed(job: JobDescriptor, phase: Phase, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job,
            phase,
            status: JobStatus::Failed(phase),
            build_exit: None,
            test_exit: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    /// Job was cancelled before `phase` started.
    pub fn cancelled(job: JobDescriptor, phase: Phase, duration_ms: u64) -> Self {
        Self {
            job,
            phase,
            status: JobStatus::Cancelled(phase),
            build_exit: None,
            test_exit: None,
            error: Some("pipeline cancelled".to_string()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// Phase that failed or was cancelled, if any.
    pub fn failed_phase(&self) -> Option<Phase> {
        match self.status {
            JobStatus::Succeeded => None,
            JobStatus::Failed(phase) | JobStatus::Cancelled(phase) => Some(phase),
        }
    }

    /// Non-zero code describing this job: the failing command's exit code, or 1.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            JobStatus::Succeeded => 0,
            JobStatus::Failed(Phase::Build) => nonzero(self.build_exit),
            JobStatus::Failed(Phase::Test) => nonzero(self.test_exit),
            _ => 1,
        }
    }
}

fn nonzero(code: Option<i32>) -> i32 {
    match code {
        Some(0) | None => 1,
        Some(c) => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobDescriptor {
        JobDescriptor::new("x64", "x86_64-pc-windows-gnu", true)
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Fetch < Phase::Stage);
        assert!(Phase::Stage < Phase::Build);
        assert!(Phase::Build < Phase::Test);
    }

    #[test]
    fn test_tracker_shared_between_clones() {
        let tracker = PhaseTracker::new();
        assert_eq!(tracker.current(), Phase::Fetch);

        let seen_by_pipeline = tracker.clone();
        for phase in [Phase::Stage, Phase::Build, Phase::Test] {
            tracker.enter(phase);
            assert_eq!(seen_by_pipeline.current(), phase);
        }
    }

    #[test]
    fn test_failed_fetch_never_ran_commands() {
        let outcome = RunOutcome::failed(job(), Phase::Fetch, "404", 3);
        assert_eq!(outcome.status, JobStatus::Failed(Phase::Fetch));
        assert!(outcome.build_exit.is_none());
        assert!(outcome.test_exit.is_none());
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.failed_phase(), Some(Phase::Fetch));
    }

    #[test]
    fn test_exit_code_uses_failing_command() {
        let mut outcome = RunOutcome::failed(job(), Phase::Build, "exit 101", 3);
        outcome.build_exit = Some(101);
        assert_eq!(outcome.exit_code(), 101);

        let ok = RunOutcome::succeeded(job(), 10);
        assert_eq!(ok.exit_code(), 0);
        assert!(ok.is_success());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(JobStatus::Failed(Phase::Test)).unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "phase": "test"}));
        let json = serde_json::to_value(JobStatus::Succeeded).unwrap();
        assert_eq!(json, serde_json::json!({"state": "succeeded"}));
    }
}
