//! Write requests, the pending write queue and eager prefetch.
//!
//! A [`WriteRequest`] is the caller-facing descriptor. Enqueueing it assigns a
//! process-wide sequence number and produces a [`QueuedWrite`]. Requests
//! marked `eager` start running immediately; the drain later awaits the
//! prefetch handle instead of submitting the job again, so every request runs
//! exactly once.

use std::{
  fmt,
  future::Future,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Instant,
};

use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{
  lane::Lane,
  scheduler::{WriteScheduler, submit},
  tokens::TokenPolicy,
};

/// Error returned by a write job.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

pub type WriteFuture = BoxFuture<'static, Result<WriteResult, JobError>>;

/// Deferred write operation. Called at most once.
pub type WriteJob = Box<dyn FnOnce() -> WriteFuture + Send>;

static ENQUEUE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Next process-wide enqueue sequence number.
pub fn next_seq() -> u64 {
  ENQUEUE_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Result reported by a completed write job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteResult {
  /// Bytes written; backfilled from the output file when absent
  pub bytes: Option<u64>,
  pub checksum: Option<String>,
  pub checksum_algo: Option<String>,
  /// Pre-formatted `algo:value` checksum
  pub checksum_hash: Option<String>,
  pub serialization_ms: Option<f64>,
  pub disk_ms: Option<f64>,
  pub direct_fd_streaming: bool,
}

// ============================================================================
// Requests
// ============================================================================

/// One pending artifact write as described by the caller.
pub struct WriteRequest {
  pub label: String,
  pub priority: i64,
  pub estimated_bytes: Option<u64>,
  pub lane_hint: Option<Lane>,
  pub eager_start: bool,
  job: WriteJob,
}

impl WriteRequest {
  pub fn new<F, Fut>(label: impl Into<String>, job: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<WriteResult, JobError>> + Send + 'static,
  {
    Self {
      label: label.into(),
      priority: 0,
      estimated_bytes: None,
      lane_hint: None,
      eager_start: false,
      job: Box::new(move || job().boxed()),
    }
  }

  pub fn with_priority(mut self, priority: i64) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_estimated_bytes(mut self, bytes: u64) -> Self {
    self.estimated_bytes = Some(bytes);
    self
  }

  pub fn with_lane_hint(mut self, lane: Lane) -> Self {
    self.lane_hint = Some(lane);
    self
  }

  /// Start the job at enqueue time instead of waiting for lane dispatch.
  pub fn eager(mut self) -> Self {
    self.eager_start = true;
    self
  }
}

impl fmt::Debug for WriteRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WriteRequest")
      .field("label", &self.label)
      .field("priority", &self.priority)
      .field("estimated_bytes", &self.estimated_bytes)
      .field("lane_hint", &self.lane_hint)
      .field("eager_start", &self.eager_start)
      .finish_non_exhaustive()
  }
}

// ============================================================================
// Queued writes
// ============================================================================

pub(crate) enum JobState {
  Pending(WriteJob),
  Prefetched {
    handle: JoinHandle<Result<WriteResult, JobError>>,
    started_at: Instant,
  },
}

/// A request that has been assigned its sequence number.
pub struct QueuedWrite {
  pub label: String,
  pub priority: i64,
  pub estimated_bytes: Option<u64>,
  pub lane_hint: Option<Lane>,
  pub eager_start: bool,
  /// Sole tie-break for deterministic ordering
  pub seq: u64,
  pub enqueued_at: Instant,
  pub(crate) state: JobState,
}

impl QueuedWrite {
  /// Assign a sequence number without starting the job.
  pub fn new(request: WriteRequest) -> Self {
    let WriteRequest {
      label,
      priority,
      estimated_bytes,
      lane_hint,
      eager_start,
      job,
    } = request;
    Self {
      label,
      priority,
      estimated_bytes,
      lane_hint,
      eager_start,
      seq: next_seq(),
      enqueued_at: Instant::now(),
      state: JobState::Pending(job),
    }
  }

  pub fn is_prefetched(&self) -> bool {
    matches!(self.state, JobState::Prefetched { .. })
  }

  pub fn prefetch_started_at(&self) -> Option<Instant> {
    match &self.state {
      JobState::Prefetched { started_at, .. } => Some(*started_at),
      JobState::Pending(_) => None,
    }
  }

  /// When the write counts as started: its prefetch start if it was
  /// prefetched, otherwise the dispatch time.
  pub fn start_time(&self, dispatched_at: Instant) -> Instant {
    self.prefetch_started_at().unwrap_or(dispatched_at)
  }

  /// Spawn the job now. Without a tokio runtime the write stays pending and
  /// runs at dispatch instead.
  fn start_prefetch(mut self, scheduler: Option<Arc<dyn WriteScheduler>>, tokens: &TokenPolicy) -> Self {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!(label = %self.label, "No runtime for eager write, deferring to dispatch");
      return self;
    };
    let job_tokens = tokens.eager_tokens(self.estimated_bytes, self.lane_hint);
    match self.state {
      JobState::Pending(job) => {
        let started_at = Instant::now();
        let handle = runtime.spawn(async move { submit(scheduler.as_deref(), job_tokens, job).await });
        self.state = JobState::Prefetched { handle, started_at };
        trace!(label = %self.label, io = job_tokens.io, mem = job_tokens.mem, "Eager write started");
      }
      prefetched => self.state = prefetched,
    }
    self
  }
}

impl fmt::Debug for QueuedWrite {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedWrite")
      .field("label", &self.label)
      .field("priority", &self.priority)
      .field("estimated_bytes", &self.estimated_bytes)
      .field("lane_hint", &self.lane_hint)
      .field("seq", &self.seq)
      .field("prefetched", &self.is_prefetched())
      .finish_non_exhaustive()
  }
}

/// Accumulates writes for one drain.
pub struct WriteQueue {
  writes: Vec<QueuedWrite>,
  scheduler: Option<Arc<dyn WriteScheduler>>,
  tokens: TokenPolicy,
}

impl WriteQueue {
  pub fn new(scheduler: Option<Arc<dyn WriteScheduler>>, tokens: TokenPolicy) -> Self {
    Self {
      writes: Vec::new(),
      scheduler,
      tokens,
    }
  }

  /// Queue a write and return its sequence number. Eager requests are
  /// submitted immediately.
  pub fn enqueue(&mut self, request: WriteRequest) -> u64 {
    let mut write = QueuedWrite::new(request);
    if write.eager_start {
      write = write.start_prefetch(self.scheduler.clone(), &self.tokens);
    }
    let seq = write.seq;
    self.writes.push(write);
    seq
  }

  pub fn len(&self) -> usize {
    self.writes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.writes.is_empty()
  }

  pub fn labels(&self) -> impl Iterator<Item = &str> {
    self.writes.iter().map(|write| write.label.as_str())
  }

  pub fn into_writes(self) -> Vec<QueuedWrite> {
    self.writes
  }
}
