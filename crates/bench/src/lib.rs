//! Synthetic drain harness for the artifact write-dispatch engine.
//!
//! Generates a reproducible workload of artifact writes, runs it through a
//! [`dispatch::WriteDispatcher`] backed by a semaphore token scheduler, and
//! summarizes the drain as a JSON report.
//!
//! ## Key Concepts
//!
//! - **Workload**: seeded labels and sizes spanning every lane
//! - **Scheduler**: IO/memory semaphores plus host memory signals from sysinfo
//! - **Reports**: JSON (machine-readable) with per-write metric rows

pub mod report;
pub mod scheduler;
pub mod workload;

pub use report::{BenchReport, EventLog};
pub use scheduler::{TokenScheduler, TokenSchedulerConfig};
pub use workload::{WorkloadSpec, WriteProfile};

use thiserror::Error;

/// Benchmark-specific errors
#[derive(Debug, Error)]
pub enum BenchmarkError {
  #[error("Configuration error: {0}")]
  Config(#[from] artifact_core::ConfigError),

  #[error("Dispatch error: {0}")]
  Dispatch(#[from] dispatch::DispatchError),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BenchmarkError>;
