//! Aggregate pipeline report.
//!
//! Machine-readable (JSON) and human-readable (summary lines) views of a
//! whole pipeline invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gate::GateVerdict;
use crate::outcome::{JobStatus, RunOutcome};

/// Overall pipeline status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
    /// Branch gate closed; nothing ran.
    Skipped,
    Cancelled,
}

impl PipelineStatus {
    /// Derive the overall status from job outcomes.
    pub fn from_outcomes(outcomes: &[RunOutcome]) -> Self {
        if outcomes
            .iter()
            .any(|o| matches!(o.status, JobStatus::Failed(_)))
        {
            PipelineStatus::Failed
        } else if outcomes
            .iter()
            .any(|o| matches!(o.status, JobStatus::Cancelled(_)))
        {
            PipelineStatus::Cancelled
        } else {
            PipelineStatus::Succeeded
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Skipped => "skipped",
            PipelineStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of a complete pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineReport {
    pub run_id: String,

    /// SHA-256 fingerprint of the pipeline configuration.
    pub config_digest: String,

    /// Branch gate verdict for this invocation.
    pub gate: GateVerdict,

    pub started_at: DateTime<Utc>,

    pub status: PipelineStatus,

    /// One outcome per resolved job, in matrix order.
    pub outcomes: Vec<RunOutcome>,

    pub duration_ms: u64,
}

impl PipelineReport {
    /// Driver exit code: 0 on success or skip, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            PipelineStatus::Succeeded | PipelineStatus::Skipped => 0,
            PipelineStatus::Failed | PipelineStatus::Cancelled => 1,
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Outcomes that did not succeed.
    pub fn failed(&self) -> Vec<&RunOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success()).collect()
    }

    /// Pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable summary, one line per job plus a footer.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if self.status == PipelineStatus::Skipped {
            lines.push(format!("Pipeline skipped: {}", self.gate.message));
            return lines;
        }

        for outcome in &self.outcomes {
            let line = match outcome.status {
                JobStatus::Succeeded => format!(
                    "  ✓ {} ({}ms)",
                    outcome.job.label(),
                    outcome.duration_ms
                ),
                JobStatus::Failed(phase) => format!(
                    "  ✗ {} failed in {} phase (exit code {}, {}ms)",
                    outcome.job.label(),
                    phase,
                    outcome.exit_code(),
                    outcome.duration_ms
                ),
                JobStatus::Cancelled(phase) => format!(
                    "  - {} cancelled before {} phase",
                    outcome.job.label(),
                    phase
                ),
            };
            lines.push(line);
            if let Some(error) = outcome.error.as_deref().filter(|_| !outcome.is_success()) {
                if let Some(first) = error.lines().next() {
                    lines.push(format!("      {}", first));
                }
            }
        }

        lines.push(format!(
            "Summary: {}/{} jobs succeeded ({}), {}ms",
            self.succeeded_count(),
            self.outcomes.len(),
            self.status.as_str(),
            self.duration_ms
        ));
        lines
    }
}
