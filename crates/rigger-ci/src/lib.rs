//! Rigger CI - matrix build orchestration
//!
//! Runs a build/test pipeline across a platform x target-triple matrix:
//! - Resolves the matrix under a branch gate
//! - Fetches the toolchain installer and native dependencies per triple
//! - Stages them into triple-keyed directories and runs the installer
//! - Composes the child environment (search path, extra variables)
//! - Runs build then test and reports one outcome per job

pub mod artifact;
pub mod config;
pub mod env;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod matrix;
pub mod obs;
pub mod outcome;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use artifact::{plan_job, ArtifactKind, ArtifactSpec, JobPlan, WorkspaceLayout};
pub use config::{DependencyConfig, PipelineConfig, Timeouts, ToolchainConfig};
pub use env::{AuxiliaryPaths, EnvironmentComposer, StagedEnvironment};
pub use error::{CiError, Result};
pub use fetch::{ArtifactFetcher, ArtifactSource, FetchResult, FetchStatus, UrlSource};
pub use gate::{BranchGate, GateVerdict};
pub use matrix::{JobDescriptor, MatrixConfig, MatrixResolver, Resolution};
pub use outcome::{JobStatus, Phase, RunOutcome};
pub use pipeline::Pipeline;
pub use report::{PipelineReport, PipelineStatus};
pub use runner::{BuildTestRunner, CommandExecutor, CommandResult, CommandSpec, ProcessExecutor};
pub use stage::{FilesystemStager, Installer, ProcessInstaller, StagedArtifacts};
pub use telemetry::init_tracing;
pub use tokio_util::sync::CancellationToken;
