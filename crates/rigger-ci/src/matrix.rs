//! Matrix resolution: platform axis x target-triple axis -> job descriptors.

use serde::{Deserialize, Serialize};

use crate::error::{CiError, Result};
use crate::gate::{BranchGate, GateVerdict};

/// Declarative build matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatrixConfig {
    /// Platform axis (e.g. `x64`).
    pub platforms: Vec<String>,

    /// Target triple axis (e.g. `x86_64-pc-windows-gnu`).
    pub triples: Vec<String>,
}

impl MatrixConfig {
    pub fn new<P, T>(platforms: P, triples: T) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            platforms: platforms.into_iter().map(Into::into).collect(),
            triples: triples.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of jobs the matrix expands to.
    pub fn cardinality(&self) -> usize {
        self.platforms.len() * self.triples.len()
    }

    /// Check both axes are non-empty, duplicate-free, and path-safe.
    pub fn validate(&self) -> Result<()> {
        validate_axis("platforms", &self.platforms)?;
        validate_axis("triples", &self.triples)
    }
}

fn validate_axis(axis: &str, values: &[String]) -> Result<()> {
    if values.is_empty() {
        return Err(CiError::config(format!("matrix axis '{}' is empty", axis)));
    }
    let mut seen = std::collections::HashSet::new();
    for value in values {
        if !is_path_segment(value) {
            return Err(CiError::config(format!(
                "matrix axis '{}' has invalid value '{}' (allowed: A-Z a-z 0-9 . _ -)",
                axis, value
            )));
        }
        // Job directories are named after these values, and some filesystems
        // fold case.
        if !seen.insert(value.to_ascii_lowercase()) {
            return Err(CiError::config(format!(
                "matrix axis '{}' lists '{}' more than once (values are compared case-insensitively)",
                axis, value
            )));
        }
    }
    Ok(())
}

/// Whether `value` can be used verbatim as a single directory name.
pub fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// One concrete cell of the matrix. Immutable once resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobDescriptor {
    pub platform: String,
    pub target_triple: String,
    /// Gate verdict the job was resolved under (always `true` for dispatched jobs).
    pub branch_gate: bool,
}

impl JobDescriptor {
    pub fn new(platform: impl Into<String>, target_triple: impl Into<String>, branch_gate: bool) -> Self {
        Self {
            platform: platform.into(),
            target_triple: target_triple.into(),
            branch_gate,
        }
    }

    /// Short label used in logs and reports (`x64/x86_64-pc-windows-gnu`).
    pub fn label(&self) -> String {
        format!("{}/{}", self.platform, self.target_triple)
    }
}

/// Result of resolving a matrix under a branch gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Verdict of the single gate evaluation for this invocation.
    pub gate: GateVerdict,
    /// Jobs to dispatch in matrix order (empty when the gate is closed).
    pub jobs: Vec<JobDescriptor>,
}

impl Resolution {
    pub fn jobs(&self) -> &[JobDescriptor] {
        &self.jobs
    }

    /// Gate closed: nothing runs and the pipeline is reported as skipped.
    pub fn is_skipped(&self) -> bool {
        !self.gate.open
    }
}

/// Expands a matrix into job descriptors.
pub struct MatrixResolver;

impl MatrixResolver {
    /// Resolve the matrix once for this pipeline invocation.
    ///
    /// The matrix is validated before the gate is consulted, so a malformed
    /// matrix is reported even on branches the gate would skip.
    pub fn resolve(
        matrix: &MatrixConfig,
        gate: &BranchGate,
        branch: Option<&str>,
    ) -> Result<Resolution> {
        matrix.validate()?;

        let verdict = gate.evaluate(branch);
        if !verdict.open {
            return Ok(Resolution {
                gate: verdict,
                jobs: Vec::new(),
            });
        }

        let jobs = matrix
            .platforms
            .iter()
            .flat_map(|platform| {
                matrix
                    .triples
                    .iter()
                    .map(move |triple| JobDescriptor::new(platform.clone(), triple.clone(), true))
            })
            .collect();

        Ok(Resolution {
            gate: verdict,
            jobs,
        })
    }
}
