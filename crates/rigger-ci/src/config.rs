//! Pipeline configuration document.
//!
//! A pipeline is declared as a JSON document: the matrix, the branch gate,
//! the per-triple toolchain and native-dependency artifacts, the auxiliary
//! search-path table, and the build/test commands. URL and path values are
//! templates over `{platform}` and `{triple}`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CiError, Result};
use crate::gate::BranchGate;
use crate::matrix::MatrixConfig;

/// Complete pipeline declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Platform x triple matrix.
    pub matrix: MatrixConfig,

    /// Branches allowed to run the pipeline.
    #[serde(default)]
    pub branch_gate: BranchGate,

    /// Self-installing toolchain artifact.
    pub toolchain: ToolchainConfig,

    /// Native dependencies placed per triple.
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,

    /// Auxiliary toolchain directory per target triple (e.g. a MinGW `bin`).
    #[serde(default)]
    pub aux_paths: BTreeMap<String, PathBuf>,

    /// Extra environment variables for build/test. Values are templates over
    /// `{platform}`, `{triple}`, `{install_dir}` and `{deps_dir}`.
    #[serde(default)]
    pub extra_vars: BTreeMap<String, String>,

    /// Build command argv.
    pub build: Vec<String>,

    /// Test command argv.
    pub test: Vec<String>,

    /// Working directory for build and test.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Per-operation timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Maximum number of jobs running at once (default: all).
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Enforce SHA-256 pins when present.
    #[serde(default = "default_true")]
    pub verify_digests: bool,
}

/// Toolchain installer artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolchainConfig {
    /// Installer download URL template.
    pub url: String,

    /// Optional SHA-256 pin per target triple.
    #[serde(default)]
    pub sha256: BTreeMap<String, String>,

    /// Installation directory template. Relative paths live under the job directory.
    #[serde(default = "default_install_dir")]
    pub install_dir: String,

    /// Executable sub-directory of the install directory.
    #[serde(default = "default_bin_dir")]
    pub bin_dir: String,

    /// Components passed to the installer as `{components}` (comma-joined).
    #[serde(default)]
    pub components: Vec<String>,

    /// Installer argument template. Supports `{components}` and `{install_dir}`.
    #[serde(default = "default_installer_args")]
    pub installer_args: Vec<String>,
}

/// Native dependency artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyConfig {
    /// Name used in logs and reports.
    pub name: String,

    /// Download URL template.
    pub url: String,

    /// Destination template, relative to the job's dependency directory.
    pub destination: String,

    /// Optional SHA-256 pin per target triple.
    #[serde(default)]
    pub sha256: BTreeMap<String, String>,
}

/// Timeouts in seconds. Zero disables the timeout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    #[serde(default = "default_install_secs")]
    pub install_secs: u64,
    #[serde(default = "default_command_secs")]
    pub build_secs: u64,
    #[serde(default = "default_command_secs")]
    pub test_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            install_secs: default_install_secs(),
            build_secs: default_command_secs(),
            test_secs: default_command_secs(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_install_dir() -> String {
    "toolchain".to_string()
}

fn default_bin_dir() -> String {
    "bin".to_string()
}

/// Inno Setup style flags: silent, no restart, components, target directory.
pub fn default_installer_args() -> Vec<String> {
    vec![
        "/VERYSILENT".to_string(),
        "/NORESTART".to_string(),
        "/COMPONENTS={components}".to_string(),
        "/DIR={install_dir}".to_string(),
    ]
}

fn default_fetch_secs() -> u64 {
    300
}

fn default_install_secs() -> u64 {
    600
}

fn default_command_secs() -> u64 {
    3600
}

impl PipelineConfig {
    /// Parse a pipeline document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a pipeline document from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CiError::config(format!("cannot read pipeline file {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Pre-flight validation. Any failure is a configuration error.
    pub fn validate(&self) -> Result<()> {
        self.matrix.validate()?;

        check_argv("build", &self.build)?;
        check_argv("test", &self.test)?;

        if self.toolchain.url.trim().is_empty() {
            return Err(CiError::config("toolchain url is empty"));
        }
        check_template("toolchain.url", &self.toolchain.url, TemplateScope::Artifact)?;
        check_template(
            "toolchain.install_dir",
            &self.toolchain.install_dir,
            TemplateScope::Artifact,
        )?;
        self.check_install_dir()?;
        for arg in &self.toolchain.installer_args {
            check_template("toolchain.installer_args", arg, TemplateScope::Installer)?;
        }
        check_pins("toolchain", &self.toolchain.sha256)?;

        let mut names = std::collections::HashSet::new();
        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                return Err(CiError::config("dependency with empty name"));
            }
            if !names.insert(dep.name.as_str()) {
                return Err(CiError::config(format!(
                    "dependency '{}' declared more than once",
                    dep.name
                )));
            }
            check_template(&format!("{}.url", dep.name), &dep.url, TemplateScope::Artifact)?;
            check_template(
                &format!("{}.destination", dep.name),
                &dep.destination,
                TemplateScope::Artifact,
            )?;
            check_relative(&dep.name, &dep.destination)?;
            check_pins(&dep.name, &dep.sha256)?;
        }
        self.check_destinations()?;

        for (key, value) in &self.extra_vars {
            if key.is_empty() || key.contains('=') {
                return Err(CiError::config(format!("invalid variable name '{}'", key)));
            }
            if RESERVED_VARS.iter().any(|r| key.eq_ignore_ascii_case(r)) {
                return Err(CiError::config(format!(
                    "variable '{}' is composed per job and cannot be declared in extra_vars",
                    key
                )));
            }
            check_template(key, value, TemplateScope::Environment)?;
        }

        if self.max_parallel == Some(0) {
            return Err(CiError::config("max_parallel must be at least 1"));
        }

        Ok(())
    }

    /// Deterministic SHA-256 fingerprint of the configuration.
    pub fn digest(&self) -> Result<String> {
        // BTreeMap fields keep the serialization order stable.
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// The install directory must be distinct per job.
    ///
    /// Relative templates resolve under the job directory and may not climb
    /// out of it or land on the downloads or deps directories. Absolute
    /// templates must carry `{triple}`, and `{platform}` too when the matrix
    /// has more than one platform.
    fn check_install_dir(&self) -> Result<()> {
        let template = self.toolchain.install_dir.as_str();
        if template.trim().is_empty() {
            return Err(CiError::config("toolchain.install_dir is empty"));
        }

        if is_absolute_template(template) {
            let mut required = vec!["triple"];
            if self.matrix.platforms.len() > 1 {
                required.push("platform");
            }
            let used = placeholders(template).map_err(CiError::config)?;
            for key in required {
                if !used.contains(&key) {
                    return Err(CiError::config(format!(
                        "toolchain.install_dir '{}' is absolute and must contain '{{{}}}' so jobs do not share it",
                        template, key
                    )));
                }
            }
            return Ok(());
        }

        let components = normalized(Path::new(template)).ok_or_else(|| {
            CiError::config(format!(
                "toolchain.install_dir '{}' must stay inside the job directory",
                template
            ))
        })?;
        match components.first().and_then(|c| c.to_str()) {
            None => Err(CiError::config(
                "toolchain.install_dir must not be the job directory itself",
            )),
            Some(first) if JOB_SUBDIRS.iter().any(|d| first.eq_ignore_ascii_case(d)) => {
                Err(CiError::config(format!(
                    "toolchain.install_dir '{}' overlaps the job's {} directory",
                    template, first
                )))
            }
            Some(_) => Ok(()),
        }
    }

    /// Rendered dependency destinations must be distinct files within each job.
    fn check_destinations(&self) -> Result<()> {
        for platform in &self.matrix.platforms {
            for triple in &self.matrix.triples {
                let mut vars = BTreeMap::new();
                vars.insert("platform", platform.clone());
                vars.insert("triple", triple.clone());

                let mut placed: Vec<(&str, PathBuf)> = Vec::with_capacity(self.dependencies.len());
                for dep in &self.dependencies {
                    let rendered = render_template(&dep.destination, &vars)?;
                    let path = normalized(Path::new(&rendered))
                        .filter(|c| !c.is_empty())
                        .map(|c| c.iter().collect::<PathBuf>())
                        .ok_or_else(|| {
                            CiError::config(format!(
                                "{}: destination '{}' does not name a file inside the dependency directory",
                                dep.name, dep.destination
                            ))
                        })?;

                    let key = PathBuf::from(path.to_string_lossy().to_ascii_lowercase());
                    if let Some((other, _)) = placed
                        .iter()
                        .find(|(_, p)| p.starts_with(&key) || key.starts_with(p))
                    {
                        return Err(CiError::config(format!(
                            "dependencies '{}' and '{}' collide at '{}' for {}/{}",
                            other,
                            dep.name,
                            path.display(),
                            platform,
                            triple
                        )));
                    }
                    placed.push((dep.name.as_str(), key));
                }
            }
        }
        Ok(())
    }
}

/// Directories every job owns besides its install directory.
const JOB_SUBDIRS: &[&str] = &["downloads", "deps"];

/// Variables the environment composer sets itself.
const RESERVED_VARS: &[&str] = &["PATH", "TARGET"];

/// `/x`, `\\x`, or a drive-letter path such as `C:\x`, on any host.
fn is_absolute_template(template: &str) -> bool {
    let bytes = template.as_bytes();
    Path::new(template).is_absolute()
        || template.starts_with('/')
        || template.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Normal components of a relative path with `.` dropped, or `None` if the
/// path is rooted or climbs with `..`.
fn normalized(path: &Path) -> Option<Vec<&std::ffi::OsStr>> {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

fn check_argv(name: &str, argv: &[String]) -> Result<()> {
    match argv.first() {
        Some(exe) if !exe.trim().is_empty() => Ok(()),
        _ => Err(CiError::config(format!("{} command is empty", name))),
    }
}

fn check_pins(owner: &str, pins: &BTreeMap<String, String>) -> Result<()> {
    for (triple, digest) in pins {
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CiError::config(format!(
                "{}: sha256 pin for '{}' is not a 64-character hex digest",
                owner, triple
            )));
        }
    }
    Ok(())
}

fn check_relative(owner: &str, destination: &str) -> Result<()> {
    let path = Path::new(destination);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if destination.trim().is_empty() || escapes {
        return Err(CiError::config(format!(
            "{}: destination '{}' must be a relative path inside the dependency directory",
            owner, destination
        )));
    }
    Ok(())
}

/// Which placeholders a template may use.
#[derive(Debug, Clone, Copy)]
enum TemplateScope {
    Artifact,
    Installer,
    Environment,
}

impl TemplateScope {
    fn allows(&self, key: &str) -> bool {
        match self {
            TemplateScope::Artifact => matches!(key, "platform" | "triple"),
            TemplateScope::Installer => {
                matches!(key, "platform" | "triple" | "components" | "install_dir")
            }
            TemplateScope::Environment => {
                matches!(key, "platform" | "triple" | "install_dir" | "deps_dir")
            }
        }
    }
}

fn check_template(field: &str, template: &str, scope: TemplateScope) -> Result<()> {
    for key in placeholders(template).map_err(|e| CiError::config(format!("{}: {}", field, e)))? {
        if !scope.allows(key) {
            return Err(CiError::config(format!(
                "{}: unknown placeholder '{{{}}}'",
                field, key
            )));
        }
    }
    Ok(())
}

fn placeholders(template: &str) -> std::result::Result<Vec<&str>, String> {
    let mut keys = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{}'", template))?;
        keys.push(&after[..close]);
        rest = &after[close + 1..];
    }
    Ok(keys)
}

/// Substitute `{key}` placeholders from `vars`.
///
/// Unknown placeholders are a configuration error.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            CiError::config(format!("unterminated placeholder in '{}'", template))
        })?;
        let key = &after[..close];
        let value = vars.get(key).ok_or_else(|| {
            CiError::config(format!("unknown placeholder '{{{}}}' in '{}'", key, template))
        })?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
