//! External job scheduler interface.
//!
//! The engine never runs writes on its own threads. Every write job is handed
//! to a [`WriteScheduler`] together with its IO/memory token cost; the
//! scheduler decides when the job actually runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
  queue::{JobError, WriteJob, WriteResult},
  tokens::SchedulerTokens,
};

/// Queue name used for every artifact write submission.
pub const WRITE_QUEUE_NAME: &str = "stage2.write";

/// Memory signals published by the scheduler (each a 0..1 score).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySignals {
  pub pressure_score: Option<f64>,
  pub gc_pressure_score: Option<f64>,
  pub rss_utilization: Option<f64>,
}

/// Write-queue signals published by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteQueueSignals {
  pub pending: Option<u64>,
  pub oldest_wait_ms: Option<u64>,
  pub wait_p95_ms: Option<u64>,
}

/// Scheduler statistics snapshot consumed by the adaptive controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
  pub memory: Option<MemorySignals>,
  pub write_queue: Option<WriteQueueSignals>,
}

/// Token-budgeted job scheduler.
#[async_trait]
pub trait WriteScheduler: Send + Sync {
  /// Run `job` once `tokens` are available on `queue`, returning its result.
  async fn schedule(&self, queue: &str, tokens: SchedulerTokens, job: WriteJob) -> Result<WriteResult, JobError>;

  /// Current pressure signals. Schedulers without signals report none.
  fn stats(&self) -> SchedulerStats {
    SchedulerStats::default()
  }
}

/// Submit through the scheduler when one is configured, otherwise run inline.
pub(crate) async fn submit(
  scheduler: Option<&dyn WriteScheduler>,
  tokens: SchedulerTokens,
  job: WriteJob,
) -> Result<WriteResult, JobError> {
  match scheduler {
    Some(scheduler) => scheduler.schedule(WRITE_QUEUE_NAME, tokens, job).await,
    None => job().await,
  }
}
