//! Artifact declarations and the per-job directory layout.
//!
//! Every staged path is derived from the job's platform and triple:
//!
//! ```text
//! <root>/<platform>/<triple>/downloads/   fetched installers
//! <root>/<platform>/<triple>/deps/        native dependencies
//! <root>/<platform>/<triple>/toolchain/   default install directory
//! ```
//!
//! Matrix validation guarantees both segments are plain directory names, so
//! two jobs with different triples never share a destination.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{render_template, PipelineConfig};
use crate::error::Result;
use crate::matrix::{is_path_segment, JobDescriptor};

/// Kind of downloadable artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Self-installing toolchain executable.
    Toolchain,
    /// Native library placed on disk for the build to find.
    NativeDependency,
}

/// A single artifact to fetch and stage for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub kind: ArtifactKind,
    pub name: String,
    pub source_url: String,
    /// Always beneath the job's triple-keyed directory.
    pub destination_path: PathBuf,
    pub triple: String,
    /// Pinned SHA-256 hex digest, if any.
    pub sha256: Option<String>,
}

/// Root of all per-job working directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned exclusively by `job`.
    pub fn job_root(&self, job: &JobDescriptor) -> PathBuf {
        self.root.join(&job.platform).join(&job.target_triple)
    }

    pub fn downloads_dir(&self, job: &JobDescriptor) -> PathBuf {
        self.job_root(job).join("downloads")
    }

    pub fn deps_dir(&self, job: &JobDescriptor) -> PathBuf {
        self.job_root(job).join("deps")
    }
}

/// Everything a job needs fetched and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub toolchain: ArtifactSpec,
    pub dependencies: Vec<ArtifactSpec>,
    pub install_dir: PathBuf,
    pub deps_dir: PathBuf,
}

impl JobPlan {
    /// Toolchain first, then dependencies in declaration order.
    pub fn artifacts(&self) -> Vec<ArtifactSpec> {
        std::iter::once(self.toolchain.clone())
            .chain(self.dependencies.iter().cloned())
            .collect()
    }
}

/// Template variables available to artifact declarations.
pub(crate) fn job_vars(job: &JobDescriptor) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("platform", job.platform.clone());
    vars.insert("triple", job.target_triple.clone());
    vars
}

/// Resolve the artifact declarations of `config` for one job.
pub fn plan_job(
    config: &PipelineConfig,
    job: &JobDescriptor,
    layout: &WorkspaceLayout,
) -> Result<JobPlan> {
    let vars = job_vars(job);
    let triple = &job.target_triple;

    let toolchain_url = render_template(&config.toolchain.url, &vars)?;
    let toolchain = ArtifactSpec {
        kind: ArtifactKind::Toolchain,
        name: "toolchain".to_string(),
        destination_path: layout
            .downloads_dir(job)
            .join(installer_file_name(&toolchain_url)),
        source_url: toolchain_url,
        triple: triple.clone(),
        sha256: config.toolchain.sha256.get(triple).map(|d| d.to_ascii_lowercase()),
    };

    let rendered_install = PathBuf::from(render_template(&config.toolchain.install_dir, &vars)?);
    let install_dir = if rendered_install.is_absolute() {
        rendered_install
    } else {
        layout.job_root(job).join(rendered_install)
    };

    let deps_dir = layout.deps_dir(job);
    let dependencies = config
        .dependencies
        .iter()
        .map(|dep| {
            Ok(ArtifactSpec {
                kind: ArtifactKind::NativeDependency,
                name: dep.name.clone(),
                source_url: render_template(&dep.url, &vars)?,
                destination_path: deps_dir.join(render_template(&dep.destination, &vars)?),
                triple: triple.clone(),
                sha256: dep.sha256.get(triple).map(|d| d.to_ascii_lowercase()),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(JobPlan {
        toolchain,
        dependencies,
        install_dir,
        deps_dir,
    })
}

/// Last URL path segment, or a fixed name when it is not a plain file name.
fn installer_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('/').next() {
        Some(name) if is_path_segment(name) => name.to_string(),
        _ => "toolchain-installer".to_string(),
    }
}
