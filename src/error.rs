use std::time::Duration;
use thiserror::Error;

use crate::adapter::AdapterKind;
use crate::command::result::{ExecutionResult, OutputError};

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Failure kinds surfaced by adapters and the dispatch pipeline.
///
/// `CommandFailed` carries the full execution result so callers can still
/// inspect output after a non-zero exit. Any text embedded in these errors
/// that might contain a sudo password has already been passed through
/// [`crate::secure::mask_password`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{adapter} adapter is unavailable: {reason}")]
    AdapterUnavailable {
        adapter: AdapterKind,
        reason: String,
    },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid image '{image}': {reason}")]
    InvalidImage { image: String, reason: String },

    #[error("command timed out after {limit:?} (elapsed {elapsed:?})")]
    Timeout { limit: Duration, elapsed: Duration },

    #[error(
        "command '{}' on {} exited with code {}",
        .result.command,
        .result.target,
        .result.output.exit_code
    )]
    CommandFailed { result: Box<ExecutionResult> },

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("health check for container '{container}' timed out after {timeout:?}")]
    HealthCheckTimeout {
        container: String,
        timeout: Duration,
    },

    #[error("output error: {0}")]
    Output(#[from] OutputError),
}

impl ExecError {
    /// Whether a retry policy may re-attempt after this error.
    ///
    /// Only command-level failures and broken transports are retried;
    /// timeouts need an explicit opt-in, and auth/validation errors are
    /// never retried.
    pub(crate) fn is_retryable(&self, retry_on_timeout: bool) -> bool {
        match self {
            ExecError::CommandFailed { .. } | ExecError::ConnectionFailed(_) => true,
            ExecError::Timeout { .. } => retry_on_timeout,
            _ => false,
        }
    }
}
