//! Base command execution abstraction
//!
//! Provides the foundational trait for executing external commands, enabling
//! dependency injection for testing.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("Command execution failed: {message}")]
    ExecutionFailed { message: String },
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("IO error: {message}")]
    Io { message: String },
}

/// A single external program run
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `program arg1 arg2`, used for logs and mock lookups
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Trait for executing external commands
///
/// This abstraction allows the rest of the codebase to execute commands
/// without directly depending on tokio::process::Command, enabling testing
/// with mock implementations.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;
}

/// Real implementation using tokio::process::Command
pub struct ProcessCommandExecutor;

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        debug!(command = %invocation.command_line(), "Executing command");

        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| CommandError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => command.output().await,
        }
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::CommandNotFound {
                    command: invocation.program.clone(),
                }
            } else {
                CommandError::Io { message: e.to_string() }
            }
        })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
