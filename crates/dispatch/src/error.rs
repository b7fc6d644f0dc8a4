//! Dispatch errors.

use artifact_core::ConfigError;

use crate::queue::JobError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
  #[error("invalid artifact write config: {0}")]
  Config(#[from] ConfigError),

  /// The first write that failed during a drain
  #[error("artifact write failed for {label}: {source}")]
  WriteJob {
    label: String,
    #[source]
    source: JobError,
  },

  #[error("artifact write task for {label} did not complete: {message}")]
  JobPanicked { label: String, message: String },
}

impl DispatchError {
  /// Label of the failing write, if the error came from one.
  pub fn label(&self) -> Option<&str> {
    match self {
      DispatchError::Config(_) => None,
      DispatchError::WriteJob { label, .. } | DispatchError::JobPanicked { label, .. } => Some(label),
    }
  }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
