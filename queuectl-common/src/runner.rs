//! Execution of job payloads.
//!
//! The worker loop is generic over a `CommandRunner` so tests can script
//! outcomes instead of spawning processes. The real implementation hands the
//! command string to the host shell and captures both output streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Enumeration of errors raised by the runner itself. A nonzero exit code is
/// a job failure, not a runner error.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0}")]
    Host(String),
}

/// The observed result of one command invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability to execute a job's command string.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<RunOutput, RunnerError>;
}

/// Runs commands through `sh -c`, so the payload gets shell word-splitting
/// and expansion. Blocks (asynchronously) until the child exits.
#[derive(Debug, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<RunOutput, RunnerError> {
        let output = Command::new("sh").arg("-c").arg(command).output().await?;

        Ok(RunOutput {
            // A signal-terminated child reports no exit code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A runner for tests: replays queued outcomes per command string and counts
/// every invocation.
#[derive(Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<HashMap<String, VecDeque<Result<RunOutput, String>>>>,
    fallback: Option<RunOutput>,
    invocations: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands with no scripted outcome left resolve to `output` instead of
    /// a host error.
    pub fn with_fallback(output: RunOutput) -> Self {
        Self {
            fallback: Some(output),
            ..Self::default()
        }
    }

    pub fn script_success(&self, command: &str, stdout: &str) {
        self.script(
            command,
            Ok(RunOutput {
                exit_code: 0,
                stdout: stdout.to_owned(),
                stderr: String::new(),
            }),
        );
    }

    pub fn script_failure(&self, command: &str, exit_code: i32, stderr: &str) {
        self.script(
            command,
            Ok(RunOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_owned(),
            }),
        );
    }

    pub fn script_host_error(&self, command: &str, message: &str) {
        self.script(command, Err(message.to_owned()));
    }

    pub fn script(&self, command: &str, outcome: Result<RunOutput, String>) {
        self.outcomes
            .lock()
            .expect("scripted runner mutex poisoned")
            .entry(command.to_owned())
            .or_default()
            .push_back(outcome);
    }

    /// Total number of `run` calls observed.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> Result<RunOutput, RunnerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let next = self
            .outcomes
            .lock()
            .expect("scripted runner mutex poisoned")
            .get_mut(command)
            .and_then(VecDeque::pop_front);

        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(RunnerError::Host(message)),
            None => match &self.fallback {
                Some(output) => Ok(output.clone()),
                None => Err(RunnerError::Host(format!(
                    "no scripted outcome for command: {command}"
                ))),
            },
        }
    }
}
