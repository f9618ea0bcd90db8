use std::{fmt, io, path::PathBuf, time::Duration};

/// Why a bounded wait ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    Deadline,
    Cancelled,
}

impl fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutCause::Deadline => write!(f, "deadline exceeded"),
            TimeoutCause::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{dependency} is not available: {reason}")]
    Unavailable { dependency: String, reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed to launch {program}: {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out waiting for {what} after {elapsed:?} ({cause})")]
    Timeout {
        what: String,
        elapsed: Duration,
        cause: TimeoutCause,
    },

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("updated {} but the resolver was not reloaded: {reason}", path.display())]
    ReloadUnavailable { path: PathBuf, reason: String },

    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl AppError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        AppError::InvalidArgument(message.into())
    }

    pub fn unavailable(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Unavailable {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        AppError::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn command_failed(command: impl Into<String>, output: impl Into<String>) -> Self {
        AppError::CommandFailed {
            command: command.into(),
            output: output.into(),
        }
    }

    /// Errors the orchestrator reports as a degraded success instead of a failure.
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, AppError::ReloadUnavailable { .. })
    }
}

#[macro_export]
macro_rules! invalid_arg {
    ($($arg:tt)*) => {
        Err($crate::error::AppError::InvalidArgument(format!($($arg)*)))
    };
}
