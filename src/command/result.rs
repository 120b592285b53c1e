use serde::de::DeserializeOwned;
use std::fmt;
use std::string::FromUtf8Error;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::adapter::AdapterKind;

/// Errors that can occur when processing or parsing command output
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] FromUtf8Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Output exceeds maximum size: {size} bytes (limit {limit})")]
    OutputTooLarge { size: usize, limit: usize },
}

/// Where a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Host(String),
    Container(String),
    Pod { name: String, namespace: String },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "local"),
            Target::Host(host) => write!(f, "{host}"),
            Target::Container(name) => write!(f, "container {name}"),
            Target::Pod { name, namespace } => write!(f, "pod {namespace}/{name}"),
        }
    }
}

/// Contains the raw output (stdout/stderr), exit code, timing information, etc.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Name of the signal that terminated the process, when one did.
    pub signal: Option<String>,
    pub started_at: SystemTime,
    pub duration: Duration,
}

impl Default for CommandOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandOutput {
    pub fn new() -> Self {
        Self {
            stdout: vec![],
            stderr: vec![],
            exit_code: 0,
            signal: None,
            started_at: SystemTime::now(),
            duration: Duration::default(),
        }
    }

    /// Update `duration` based on time elapsed since `started_at`.
    pub fn stop_timing(&mut self) {
        if let Ok(elapsed) = self.started_at.elapsed() {
            self.duration = elapsed;
        }
    }

    /// Convert stdout bytes to UTF-8 string
    pub fn to_stdout_string(&self) -> Result<String, OutputError> {
        Ok(String::from_utf8(self.stdout.clone())?)
    }

    /// Convert stderr bytes to UTF-8 string
    pub fn to_stderr_string(&self) -> Result<String, OutputError> {
        Ok(String::from_utf8(self.stderr.clone())?)
    }

    /// Lossy stderr rendering for error messages.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Split stdout into lines (trim and filter out empty lines).
    pub fn stdout_lines(&self) -> Result<Vec<String>, OutputError> {
        Ok(self
            .to_stdout_string()?
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Check if stdout contains a given pattern (simple substring).
    pub fn contains(&self, pattern: &str) -> bool {
        self.to_stdout_string()
            .map(|s| s.contains(pattern))
            .unwrap_or(false)
    }
}

/// Typed outcome of one execution: the command that was run, the adapter and
/// target it ran on, and the collected output.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The command as dispatched, with any embedded password masked.
    pub command: String,
    pub adapter: AdapterKind,
    pub target: Target,
    pub output: CommandOutput,
}

impl ExecutionResult {
    pub fn new(command: &str, adapter: AdapterKind, target: Target) -> Self {
        Self {
            command: command.to_string(),
            adapter,
            target,
            output: CommandOutput::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.output.exit_code == 0
    }

    pub fn exit_code(&self) -> i32 {
        self.output.exit_code
    }

    /// Parse stdout as JSON into a custom type
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, OutputError> {
        serde_json::from_slice(&self.output.stdout).map_err(OutputError::JsonError)
    }

    /// Duration from command start to completion
    pub fn duration(&self) -> Duration {
        self.output.duration
    }
}
