//! Branch gate evaluation.
//!
//! The gate is a pure pre-check evaluated once per pipeline invocation. A
//! closed gate means no job is resolved and the run is reported as skipped.

use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    /// Whether the pipeline may run.
    pub open: bool,

    /// Branch the gate was evaluated against.
    pub branch: Option<String>,

    /// Summary message.
    pub message: String,
}

/// Branch patterns admitted to run the pipeline.
///
/// A pattern is either an exact branch name or a prefix ending in `*`
/// (`release/*`). An empty pattern list admits every branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchGate {
    #[serde(default)]
    pub branches: Vec<String>,
}

impl BranchGate {
    /// Gate admitting only the given patterns.
    pub fn only<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            branches: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate the gate against the current branch.
    ///
    /// An unknown branch closes any gate that declares patterns.
    pub fn evaluate(&self, branch: Option<&str>) -> GateVerdict {
        let branch_owned = branch.map(str::to_string);

        if self.branches.is_empty() {
            return GateVerdict {
                open: true,
                branch: branch_owned,
                message: "No branch restriction".to_string(),
            };
        }

        let Some(name) = branch else {
            return GateVerdict {
                open: false,
                branch: None,
                message: "Branch unknown; gate requires one of the configured branches".to_string(),
            };
        };

        match self.branches.iter().find(|p| pattern_matches(p, name)) {
            Some(pattern) => GateVerdict {
                open: true,
                branch: branch_owned,
                message: format!("Branch '{}' matches '{}'", name, pattern),
            },
            None => GateVerdict {
                open: false,
                branch: branch_owned,
                message: format!(
                    "Branch '{}' is not in [{}]",
                    name,
                    self.branches.join(", ")
                ),
            },
        }
    }
}

fn pattern_matches(pattern: &str, branch: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => branch.starts_with(prefix),
        None => pattern == branch,
    }
}
