//! Per-job process environment composition.
//!
//! The composer never touches the process environment. It produces a
//! [`StagedEnvironment`] value that is applied to child commands only, so
//! parallel jobs cannot see each other's search paths.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::job_vars;
use crate::config::{render_template, PipelineConfig};
use crate::error::{CiError, Result};
use crate::matrix::JobDescriptor;
use crate::stage::StagedArtifacts;

/// Auxiliary toolchain directory per target triple.
///
/// Lookup is total: an unknown triple has no auxiliary entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxiliaryPaths {
    table: BTreeMap<String, PathBuf>,
}

impl AuxiliaryPaths {
    pub fn new(table: BTreeMap<String, PathBuf>) -> Self {
        Self { table }
    }

    pub fn lookup(&self, triple: &str) -> Option<&Path> {
        self.table.get(triple).map(PathBuf::as_path)
    }
}

/// Environment handed to the build/test runner for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagedEnvironment {
    pub install_dir: PathBuf,

    /// Search-path entries in the order they were prepended. Later entries
    /// take precedence over earlier ones.
    pub path_prefix_additions: Vec<PathBuf>,

    pub extra_vars: BTreeMap<String, String>,
}

impl StagedEnvironment {
    /// Effective search path: prepended entries (last first) ahead of `inherited`.
    pub fn search_path(&self, inherited: Option<&std::ffi::OsStr>) -> Result<OsString> {
        let mut entries: Vec<PathBuf> = self.path_prefix_additions.iter().rev().cloned().collect();
        if let Some(inherited) = inherited {
            entries.extend(std::env::split_paths(inherited));
        }
        std::env::join_paths(entries)
            .map_err(|e| CiError::config(format!("cannot compose search path: {}", e)))
    }

    /// Variables to set on a child process: `PATH` plus the extra variables.
    pub fn child_vars(&self) -> Result<Vec<(OsString, OsString)>> {
        let inherited = std::env::var_os("PATH");
        let mut vars = vec![(OsString::from("PATH"), self.search_path(inherited.as_deref())?)];
        vars.extend(
            self.extra_vars
                .iter()
                .filter(|(k, _)| !k.eq_ignore_ascii_case("PATH"))
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        Ok(vars)
    }
}

/// Builds [`StagedEnvironment`] values from the pipeline declaration.
#[derive(Debug, Clone)]
pub struct EnvironmentComposer {
    bin_dir: String,
    aux: AuxiliaryPaths,
    extra_vars: BTreeMap<String, String>,
}

impl EnvironmentComposer {
    pub fn new(bin_dir: impl Into<String>, aux: AuxiliaryPaths, extra_vars: BTreeMap<String, String>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            aux,
            extra_vars,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.toolchain.bin_dir.clone(),
            AuxiliaryPaths::new(config.aux_paths.clone()),
            config.extra_vars.clone(),
        )
    }

    /// Compose the environment for `job`.
    ///
    /// Prepend order is fixed: toolchain executables first, then the
    /// triple's auxiliary directory (if any), which therefore wins lookups.
    pub fn compose(&self, job: &JobDescriptor, staged: &StagedArtifacts) -> Result<StagedEnvironment> {
        let mut path_prefix_additions = vec![staged.install_dir.join(&self.bin_dir)];
        if let Some(aux) = self.aux.lookup(&job.target_triple) {
            path_prefix_additions.push(aux.to_path_buf());
        }

        let mut vars = job_vars(job);
        vars.insert("install_dir", staged.install_dir.display().to_string());
        vars.insert("deps_dir", staged.deps_dir.display().to_string());

        let mut extra_vars = BTreeMap::new();
        for (key, template) in &self.extra_vars {
            if key.eq_ignore_ascii_case("TARGET") {
                continue;
            }
            extra_vars.insert(key.clone(), render_template(template, &vars)?);
        }
        extra_vars.insert("TARGET".to_string(), job.target_triple.clone());

        Ok(StagedEnvironment {
            install_dir: staged.install_dir.clone(),
            path_prefix_additions,
            extra_vars,
        })
    }
}
