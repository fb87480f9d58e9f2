use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid input folder/file: {0}")]
    InvalidInput(PathBuf),

    #[error("Invalid json config file: {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("Early canceled")]
    Canceled,

    #[error("compiler timed out after {}s while processing {}", .after.as_secs(), .config.display())]
    Timeout { config: PathBuf, after: Duration },

    #[error("failed to launch compiler {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid compiler path '{path}': {reason}")]
    InvalidBinaryPath { path: String, reason: String },

    #[error("invalid service url '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Error occurred during generation, please check {}", .0.display())]
    GenerationFailed(PathBuf),

    #[error("compiler reported {0} error(s)")]
    CompilerErrors(usize),

    #[error("invalid shader name '{0}'")]
    InvalidName(String),
}

impl JobError {
    /// Cancellation ends a job quietly; callers must not treat it as a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub(crate) fn invalid_config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::InvalidConfig {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
