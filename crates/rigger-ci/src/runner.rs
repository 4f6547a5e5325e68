//! Build/test execution.
//!
//! The runner is a small state machine:
//! `NotStarted -> Building -> Testing -> Succeeded`, with any non-zero exit
//! moving straight to the terminal `Failed(phase)`. Testing is never entered
//! after a failed build.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::env::StagedEnvironment;
use crate::error::{CiError, Result};
use crate::matrix::JobDescriptor;
use crate::obs;
use crate::outcome::{JobStatus, Phase, PhaseTracker, RunOutcome};

/// Number of trailing output lines kept for reports.
const OUTPUT_TAIL_LINES: usize = 40;

/// An opaque external command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Phase the command belongs to.
    pub phase: Phase,

    /// Command to execute (first element is the executable).
    pub argv: Vec<String>,

    /// Timeout in seconds (0 disables).
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(phase: Phase, argv: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            phase,
            argv,
            timeout_secs,
        }
    }

    /// Space-joined argv for logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub phase: Phase,

    /// Exit code (0 = success, -1 = terminated by signal).
    pub exit_code: i32,

    /// Last lines of stdout.
    pub stdout_tail: String,

    /// Last lines of stderr.
    pub stderr_tail: String,

    pub duration_ms: u64,
}

impl CommandResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes build/test commands. Substituted in tests to observe invocations.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &CommandSpec,
        env: &StagedEnvironment,
        work_dir: &Path,
    ) -> Result<CommandResult>;
}

/// Executor that spawns real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        spec: &CommandSpec,
        env: &StagedEnvironment,
        work_dir: &Path,
    ) -> Result<CommandResult> {
        let start = Instant::now();
        let run_err = |reason: String| CiError::Run {
            phase: spec.phase,
            command: spec.display(),
            reason,
        };

        let Some((exe, args)) = spec.argv.split_first() else {
            return Err(run_err("empty command".to_string()));
        };

        let child = Command::new(exe)
            .args(args)
            .envs(env.child_vars()?)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| run_err(format!("cannot start: {}", e)))?;

        let output = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| run_err(format!("timed out after {} seconds", spec.timeout_secs)))?
        } else {
            child.wait_with_output().await
        }
        .map_err(|e| run_err(e.to_string()))?;

        Ok(CommandResult {
            phase: spec.phase,
            exit_code: output.status.code().unwrap_or(-1),
            stdout_tail: tail(&String::from_utf8_lossy(&output.stdout)),
            stderr_tail: tail(&String::from_utf8_lossy(&output.stderr)),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

/// Runner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Building,
    Testing,
    Succeeded,
    Failed(Phase),
}

impl RunState {
    /// Leave `NotStarted`; the build always runs first.
    pub fn start(self) -> Self {
        match self {
            RunState::NotStarted => RunState::Building,
            other => other,
        }
    }

    /// Advance after a command in the current state exited with `exit_code`.
    pub fn after_exit(self, exit_code: i32) -> Self {
        match (self, exit_code) {
            (RunState::Building, 0) => RunState::Testing,
            (RunState::Building, _) => RunState::Failed(Phase::Build),
            (RunState::Testing, 0) => RunState::Succeeded,
            (RunState::Testing, _) => RunState::Failed(Phase::Test),
            (other, _) => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed(_))
    }
}

/// Runs a job's build then test command with its composed environment.
pub struct BuildTestRunner {
    executor: Arc<dyn CommandExecutor>,
    build: CommandSpec,
    test: CommandSpec,
    work_dir: PathBuf,
}

impl BuildTestRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        build: CommandSpec,
        test: CommandSpec,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            build,
            test,
            work_dir: work_dir.into(),
        }
    }

    /// Run build, then test if the build passed.
    ///
    /// Cancellation is honored between the two commands only; a running
    /// command is allowed to finish.
    pub async fn run(
        &self,
        job: &JobDescriptor,
        env: &StagedEnvironment,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        self.run_tracked(job, env, cancel, &PhaseTracker::new()).await
    }

    /// [`run`](Self::run), recording each command's phase in `tracker`
    /// before it starts.
    pub async fn run_tracked(
        &self,
        job: &JobDescriptor,
        env: &StagedEnvironment,
        cancel: &CancellationToken,
        tracker: &PhaseTracker,
    ) -> RunOutcome {
        let start = Instant::now();
        let mut outcome = RunOutcome {
            job: job.clone(),
            phase: Phase::Build,
            status: JobStatus::Failed(Phase::Build),
            build_exit: None,
            test_exit: None,
            error: None,
            duration_ms: 0,
        };

        let mut state = RunState::NotStarted.start();
        while !state.is_terminal() {
            let spec = match state {
                RunState::Testing => &self.test,
                _ => &self.build,
            };
            outcome.phase = spec.phase;
            tracker.enter(spec.phase);

            if spec.phase == Phase::Test && cancel.is_cancelled() {
                outcome.status = JobStatus::Cancelled(Phase::Test);
                outcome.error = Some("pipeline cancelled".to_string());
                outcome.duration_ms = start.elapsed().as_millis() as u64;
                return outcome;
            }

            let exit_code = match self.executor.execute(spec, env, &self.work_dir).await {
                Ok(result) => {
                    obs::emit_command_exited(job, spec.phase, result.exit_code, result.duration_ms);
                    if !result.passed() {
                        outcome.error = Some(failure_message(spec, &result));
                    }
                    result.exit_code
                }
                Err(e) => {
                    obs::emit_command_exited(job, spec.phase, -1, start.elapsed().as_millis() as u64);
                    outcome.error = Some(e.to_string());
                    -1
                }
            };

            match spec.phase {
                Phase::Test => outcome.test_exit = Some(exit_code),
                _ => outcome.build_exit = Some(exit_code),
            }
            state = state.after_exit(exit_code);
        }

        outcome.status = match state {
            RunState::Failed(phase) => JobStatus::Failed(phase),
            _ => JobStatus::Succeeded,
        };
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome
    }
}

fn failure_message(spec: &CommandSpec, result: &CommandResult) -> String {
    let mut msg = format!(
        "{} command `{}` exited with code {}",
        spec.phase,
        spec.display(),
        result.exit_code
    );
    if !result.stderr_tail.is_empty() {
        msg.push('\n');
        msg.push_str(&result.stderr_tail);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct SpyExecutor {
        build_exit: i32,
        test_exit: i32,
        calls: Mutex<Vec<Phase>>,
    }

    impl SpyExecutor {
        fn new(build_exit: i32, test_exit: i32) -> Self {
            Self {
                build_exit,
                test_exit,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for SpyExecutor {
        async fn execute(
            &self,
            spec: &CommandSpec,
            _env: &StagedEnvironment,
            _work_dir: &Path,
        ) -> Result<CommandResult> {
            self.calls.lock().unwrap().push(spec.phase);
            let exit_code = match spec.phase {
                Phase::Build => self.build_exit,
                _ => self.test_exit,
            };
            Ok(CommandResult {
                phase: spec.phase,
                exit_code,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                duration_ms: 1,
            })
        }
    }

    fn env() -> StagedEnvironment {
        StagedEnvironment {
            install_dir: PathBuf::from("/tmp/toolchain"),
            path_prefix_additions: vec![PathBuf::from("/tmp/toolchain/bin")],
            extra_vars: BTreeMap::new(),
        }
    }

    fn runner(executor: Arc<dyn CommandExecutor>) -> BuildTestRunner {
        BuildTestRunner::new(
            executor,
            CommandSpec::new(Phase::Build, vec!["cargo".into(), "build".into()], 60),
            CommandSpec::new(Phase::Test, vec!["cargo".into(), "test".into()], 60),
            ".",
        )
    }

    fn job() -> JobDescriptor {
        JobDescriptor::new("x64", "t1", true)
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(RunState::Building.after_exit(0), RunState::Testing);
        assert_eq!(RunState::Building.after_exit(2), RunState::Failed(Phase::Build));
        assert_eq!(RunState::Testing.after_exit(0), RunState::Succeeded);
        assert_eq!(RunState::Testing.after_exit(101), RunState::Failed(Phase::Test));
        assert_eq!(RunState::Succeeded.after_exit(1), RunState::Succeeded);
        assert!(!RunState::NotStarted.is_terminal());
        assert!(RunState::Failed(Phase::Build).is_terminal());
    }

    #[test]
    fn test_start_leaves_not_started_only() {
        assert_eq!(RunState::NotStarted.start(), RunState::Building);
        assert_eq!(RunState::Testing.start(), RunState::Testing);
        assert_eq!(RunState::Succeeded.start(), RunState::Succeeded);
        // A runner that was never started cannot pass.
        assert_eq!(RunState::NotStarted.after_exit(0), RunState::NotStarted);
    }

    #[tokio::test]
    async fn test_tracker_follows_commands() {
        let tracker = PhaseTracker::new();
        let spy = Arc::new(SpyExecutor::new(0, 101));
        let outcome = runner(spy)
            .run_tracked(&job(), &env(), &CancellationToken::new(), &tracker)
            .await;
        assert_eq!(outcome.status, JobStatus::Failed(Phase::Test));
        assert_eq!(tracker.current(), Phase::Test);

        let tracker = PhaseTracker::new();
        runner(Arc::new(SpyExecutor::new(2, 0)))
            .run_tracked(&job(), &env(), &CancellationToken::new(), &tracker)
            .await;
        assert_eq!(tracker.current(), Phase::Build);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout_is_run_error() {
        let spec = CommandSpec::new(Phase::Test, vec!["sleep".into(), "5".into()], 1);
        let started = Instant::now();
        let err = ProcessExecutor
            .execute(&spec, &env(), Path::new("."))
            .await
            .unwrap_err();
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        match err {
            CiError::Run { phase, reason, .. } => {
                assert_eq!(phase, Phase::Test);
                assert!(reason.contains("timed out after 1 seconds"), "{}", reason);
            }
            other => panic!("expected run error, got {:?}", other),
        }

        let runner = BuildTestRunner::new(
            Arc::new(ProcessExecutor),
            CommandSpec::new(Phase::Build, vec!["true".into()], 5),
            spec,
            ".",
        );
        let outcome = runner.run(&job(), &env(), &CancellationToken::new()).await;
        assert_eq!(outcome.status, JobStatus::Failed(Phase::Test));
        assert_eq!(outcome.test_exit, Some(-1));
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_build_failure_never_runs_tests() {
        let spy = Arc::new(SpyExecutor::new(1, 0));
        let outcome = runner(spy.clone()).run(&job(), &env(), &CancellationToken::new()).await;

        assert_eq!(*spy.calls.lock().unwrap(), vec![Phase::Build]);
        assert_eq!(outcome.status, JobStatus::Failed(Phase::Build));
        assert_eq!(outcome.build_exit, Some(1));
        assert_eq!(outcome.test_exit, None);
        assert!(outcome.error.unwrap().contains("exited with code 1"));
    }

    #[tokio::test]
    async fn test_both_pass() {
        let spy = Arc::new(SpyExecutor::new(0, 0));
        let outcome = runner(spy.clone()).run(&job(), &env(), &CancellationToken::new()).await;

        assert_eq!(*spy.calls.lock().unwrap(), vec![Phase::Build, Phase::Test]);
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.build_exit, Some(0));
        assert_eq!(outcome.test_exit, Some(0));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_test_failure_reported_as_test_phase() {
        let spy = Arc::new(SpyExecutor::new(0, 101));
        let outcome = runner(spy).run(&job(), &env(), &CancellationToken::new()).await;

        assert_eq!(outcome.status, JobStatus::Failed(Phase::Test));
        assert_eq!(outcome.phase, Phase::Test);
        assert_eq!(outcome.test_exit, Some(101));
        assert_eq!(outcome.exit_code(), 101);
    }

    #[tokio::test]
    async fn test_cancel_before_test_phase() {
        let spy = Arc::new(SpyExecutor::new(0, 0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = runner(spy.clone()).run(&job(), &env(), &cancel).await;

        assert_eq!(*spy.calls.lock().unwrap(), vec![Phase::Build]);
        assert_eq!(outcome.status, JobStatus::Cancelled(Phase::Test));
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let spec = CommandSpec::new(Phase::Build, vec!["echo".into(), "hello".into()], 60);
        let result = ProcessExecutor
            .execute(&spec, &env(), Path::new("."))
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout_tail.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let spec = CommandSpec::new(Phase::Test, vec!["false".into()], 60);
        let result = ProcessExecutor
            .execute(&spec, &env(), Path::new("."))
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_child_sees_composed_environment() {
        let mut env = env();
        env.extra_vars.insert("TARGET".to_string(), "t1".to_string());
        let spec = CommandSpec::new(
            Phase::Build,
            vec!["sh".into(), "-c".into(), "echo $TARGET; echo $PATH".into()],
            60,
        );
        let result = ProcessExecutor
            .execute(&spec, &env, Path::new("."))
            .await
            .expect("execute failed");
        let mut lines = result.stdout_tail.lines();
        assert_eq!(lines.next(), Some("t1"));
        assert!(lines.next().unwrap().starts_with("/tmp/toolchain/bin"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_run_error() {
        let spec = CommandSpec::new(
            Phase::Build,
            vec!["/nonexistent-binary-that-does-not-exist".into()],
            5,
        );
        let err = ProcessExecutor
            .execute(&spec, &env(), Path::new("."))
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::Run { phase: Phase::Build, .. }));

        let runner = BuildTestRunner::new(
            Arc::new(ProcessExecutor),
            spec,
            CommandSpec::new(Phase::Test, vec!["true".into()], 5),
            ".",
        );
        let outcome = runner.run(&job(), &env(), &CancellationToken::new()).await;
        assert_eq!(outcome.status, JobStatus::Failed(Phase::Build));
        assert_eq!(outcome.build_exit, Some(-1));
        assert_eq!(outcome.test_exit, None);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let text: String = (0..100).map(|i| format!("line{}\n", i)).collect();
        let kept = tail(&text);
        assert_eq!(kept.lines().count(), OUTPUT_TAIL_LINES);
        assert!(kept.ends_with("line99"));
    }
}
