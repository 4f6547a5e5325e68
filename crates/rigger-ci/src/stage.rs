//! Filesystem staging: toolchain installation and native-dependency placement.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::artifact::{job_vars, ArtifactKind, JobPlan};
use crate::config::{render_template, Timeouts, ToolchainConfig};
use crate::error::{CiError, Result};
use crate::fetch::FetchResult;
use crate::matrix::JobDescriptor;
use crate::obs;

/// Runs a downloaded toolchain installer.
///
/// Contract: success is signalled by exit code only.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, installer: &Path, args: &[String], timeout: Option<Duration>) -> Result<()>;
}

/// Installer that executes the artifact as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessInstaller;

/// `ETXTBSY`: a freshly written executable may still be open in a forked child.
#[cfg(unix)]
const TEXT_FILE_BUSY: i32 = 26;

impl ProcessInstaller {
    fn spawn(installer: &Path, args: &[String]) -> std::io::Result<tokio::process::Child> {
        Command::new(installer)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    async fn spawn_with_retry(installer: &Path, args: &[String]) -> std::io::Result<tokio::process::Child> {
        let mut attempts = 0;
        loop {
            match Self::spawn(installer, args) {
                #[cfg(unix)]
                Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempts < 5 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20 * attempts)).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Installer for ProcessInstaller {
    async fn install(&self, installer: &Path, args: &[String], timeout: Option<Duration>) -> Result<()> {
        let install_err = |reason: String| CiError::Install {
            installer: installer.to_path_buf(),
            reason,
        };

        let child = Self::spawn_with_retry(installer, args)
            .await
            .map_err(|e| install_err(format!("cannot start installer: {}", e)))?;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| install_err(format!("timed out after {} seconds", limit.as_secs())))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| install_err(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(install_err(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }
}

/// Paths produced by a successful staging step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifacts {
    pub install_dir: PathBuf,
    pub deps_dir: PathBuf,
    /// Every file written, toolchain installer first.
    pub files: Vec<PathBuf>,
}

/// Writes fetched artifacts to their triple-keyed destinations and runs the
/// toolchain installer.
pub struct FilesystemStager {
    installer: Arc<dyn Installer>,
    components: Vec<String>,
    installer_args: Vec<String>,
    install_timeout: Option<Duration>,
}

impl FilesystemStager {
    pub fn new(installer: Arc<dyn Installer>, toolchain: &ToolchainConfig, timeouts: &Timeouts) -> Self {
        Self {
            installer,
            components: toolchain.components.clone(),
            installer_args: toolchain.installer_args.clone(),
            install_timeout: (timeouts.install_secs > 0)
                .then(|| Duration::from_secs(timeouts.install_secs)),
        }
    }

    /// Installer argv for `job`, rendered from the argument template.
    pub fn installer_args(&self, job: &JobDescriptor, install_dir: &Path) -> Result<Vec<String>> {
        let mut vars = job_vars(job);
        vars.insert("components", self.components.join(","));
        vars.insert("install_dir", install_dir.display().to_string());
        self.installer_args
            .iter()
            .map(|arg| render_template(arg, &vars))
            .collect()
    }

    /// Stage all fetched artifacts for one job.
    ///
    /// Every result must be `Ok`; the toolchain is installed before any
    /// dependency is written. No rollback is attempted on failure.
    pub async fn stage(
        &self,
        job: &JobDescriptor,
        plan: &JobPlan,
        results: Vec<FetchResult>,
    ) -> Result<StagedArtifacts> {
        if let Some(bad) = results.iter().find(|r| !r.is_ok()) {
            return Err(CiError::Transport {
                url: bad.spec.source_url.clone(),
                reason: bad
                    .error
                    .clone()
                    .unwrap_or_else(|| "artifact was not fetched".to_string()),
            });
        }

        let (toolchains, dependencies): (Vec<_>, Vec<_>) = results
            .into_iter()
            .partition(|r| r.spec.kind == ArtifactKind::Toolchain);

        let mut files = Vec::with_capacity(toolchains.len() + dependencies.len());

        for toolchain in toolchains {
            let path = toolchain.spec.destination_path.clone();
            write_atomic_async(path.clone(), toolchain.bytes, true).await?;
            obs::emit_artifact_staged(&toolchain.spec);

            let args = self.installer_args(job, &plan.install_dir)?;
            debug!(installer = %path.display(), args = ?args, "Running toolchain installer");
            self.installer.install(&path, &args, self.install_timeout).await?;
            obs::emit_toolchain_installed(job, &plan.install_dir);
            files.push(path);
        }

        for dependency in dependencies {
            let path = dependency.spec.destination_path.clone();
            write_atomic_async(path.clone(), dependency.bytes, false).await?;
            obs::emit_artifact_staged(&dependency.spec);
            files.push(path);
        }

        Ok(StagedArtifacts {
            install_dir: plan.install_dir.clone(),
            deps_dir: plan.deps_dir.clone(),
            files,
        })
    }
}

/// Write `bytes` to `dest` via a temp file in the same directory and a rename.
///
/// Creates the parent directory if missing and replaces any stale copy. A
/// failure never leaves a partial file at `dest`.
pub fn write_atomic(dest: &Path, bytes: &[u8], executable: bool) -> Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| CiError::stage(parent, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".rigger-")
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|e| CiError::stage(dest, e))?;
    tmp.write_all(bytes).map_err(|e| CiError::stage(dest, e))?;
    tmp.as_file().sync_all().map_err(|e| CiError::stage(dest, e))?;

    if executable {
        set_executable(tmp.as_file()).map_err(|e| CiError::stage(dest, e))?;
    }

    let file = tmp.persist(dest).map_err(|e| CiError::stage(dest, e.error))?;
    // Close before anything tries to execute the file.
    drop(file);
    Ok(())
}

/// [`write_atomic`] on the blocking pool, so large artifacts and `fsync`
/// do not stall the runtime threads other jobs are using.
pub async fn write_atomic_async(dest: PathBuf, bytes: Vec<u8>, executable: bool) -> Result<()> {
    let target = dest.clone();
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes, executable))
        .await
        .map_err(|e| CiError::stage(dest, std::io::Error::other(e)))?
}

#[cfg(unix)]
fn set_executable(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

/// Remove leftover `.part` files from an interrupted run. Best effort.
pub fn sweep_partials(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(".rigger-") && name.ends_with(".part") {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "Could not remove partial file");
            }
        }
    }
}
