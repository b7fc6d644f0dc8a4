//! Semaphore-backed token scheduler.
//!
//! Every submission acquires its IO and memory tokens before the job runs and
//! releases them when it finishes. Waits are tracked so the scheduler can
//! publish write-queue signals; memory signals come from sysinfo.

use std::{
  collections::{BTreeMap, VecDeque},
  sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use async_trait::async_trait;
use dispatch::{
  JobError, MemorySignals, SchedulerStats, SchedulerTokens, WriteQueueSignals, WriteResult, WriteScheduler,
  queue::WriteJob,
};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Semaphore;
use tracing::trace;

/// Recent waits kept for the p95 signal
const WAIT_WINDOW: usize = 64;

/// Minimum gap between sysinfo refreshes
const MEMORY_REFRESH: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSchedulerConfig {
  pub io_tokens: u32,
  pub mem_tokens: u32,
  /// Publish host memory signals
  pub memory_signals: bool,
}

impl Default for TokenSchedulerConfig {
  fn default() -> Self {
    Self {
      io_tokens: 8,
      mem_tokens: 8,
      memory_signals: true,
    }
  }
}

// ============================================================================
// Wait tracking
// ============================================================================

#[derive(Debug, Default)]
struct WaitTracker {
  waiting: BTreeMap<u64, Instant>,
  recent_ms: VecDeque<u64>,
}

impl WaitTracker {
  fn signals(&self, now: Instant) -> WriteQueueSignals {
    let oldest_wait_ms = self
      .waiting
      .values()
      .min()
      .map(|started| now.saturating_duration_since(*started).as_millis() as u64);
    let wait_p95_ms = if self.recent_ms.is_empty() {
      None
    } else {
      let mut sorted: Vec<u64> = self.recent_ms.iter().copied().collect();
      sorted.sort_unstable();
      let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
      sorted.get(rank.saturating_sub(1)).copied()
    };
    WriteQueueSignals {
      pending: Some(self.waiting.len() as u64),
      oldest_wait_ms,
      wait_p95_ms,
    }
  }

  fn finish(&mut self, id: u64, now: Instant) {
    if let Some(started) = self.waiting.remove(&id) {
      if self.recent_ms.len() == WAIT_WINDOW {
        self.recent_ms.pop_front();
      }
      self.recent_ms.push_back(now.saturating_duration_since(started).as_millis() as u64);
    }
  }
}

// ============================================================================
// Memory probe
// ============================================================================

struct MemoryProbe {
  system: System,
  pid: Pid,
  refreshed_at: Option<Instant>,
  last: MemorySignals,
}

impl MemoryProbe {
  fn new() -> Self {
    Self {
      system: System::new(),
      pid: Pid::from_u32(std::process::id()),
      refreshed_at: None,
      last: MemorySignals::default(),
    }
  }

  fn signals(&mut self, now: Instant) -> MemorySignals {
    if self
      .refreshed_at
      .is_some_and(|at| now.saturating_duration_since(at) < MEMORY_REFRESH)
    {
      return self.last;
    }
    self.system.refresh_memory();
    self.system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

    let total = self.system.total_memory();
    self.last = if total == 0 {
      MemorySignals::default()
    } else {
      let rss = self.system.process(self.pid).map(|process| process.memory());
      MemorySignals {
        pressure_score: Some(self.system.used_memory() as f64 / total as f64),
        gc_pressure_score: None,
        rss_utilization: rss.map(|rss| rss as f64 / total as f64),
      }
    };
    self.refreshed_at = Some(now);
    self.last
  }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Token-budgeted scheduler with one IO pool and one memory pool.
pub struct TokenScheduler {
  config: TokenSchedulerConfig,
  io: Arc<Semaphore>,
  mem: Arc<Semaphore>,
  next_id: AtomicU64,
  waits: Mutex<WaitTracker>,
  memory: Option<Mutex<MemoryProbe>>,
}

impl TokenScheduler {
  pub fn new(config: TokenSchedulerConfig) -> Self {
    let config = TokenSchedulerConfig {
      io_tokens: config.io_tokens.max(1),
      mem_tokens: config.mem_tokens.max(1),
      ..config
    };
    Self {
      io: Arc::new(Semaphore::new(config.io_tokens as usize)),
      mem: Arc::new(Semaphore::new(config.mem_tokens as usize)),
      next_id: AtomicU64::new(0),
      waits: Mutex::new(WaitTracker::default()),
      memory: config.memory_signals.then(|| Mutex::new(MemoryProbe::new())),
      config,
    }
  }

  pub fn config(&self) -> TokenSchedulerConfig {
    self.config
  }

  /// Token request capped to pool capacity so an oversized cost cannot wait forever.
  pub fn clamp_tokens(&self, tokens: SchedulerTokens) -> SchedulerTokens {
    SchedulerTokens {
      io: tokens.io.min(self.config.io_tokens),
      mem: tokens.mem.min(self.config.mem_tokens),
    }
  }

  pub fn available(&self) -> SchedulerTokens {
    SchedulerTokens {
      io: self.io.available_permits() as u32,
      mem: self.mem.available_permits() as u32,
    }
  }

  fn write_queue_signals(&self) -> Option<WriteQueueSignals> {
    let waits = self.waits.lock().ok()?;
    Some(waits.signals(Instant::now()))
  }

  fn memory_signals(&self) -> Option<MemorySignals> {
    let mut probe = self.memory.as_ref()?.lock().ok()?;
    Some(probe.signals(Instant::now()))
  }

  fn mark_waiting(&self, id: u64) {
    if let Ok(mut waits) = self.waits.lock() {
      waits.waiting.insert(id, Instant::now());
    }
  }

  fn mark_started(&self, id: u64) {
    if let Ok(mut waits) = self.waits.lock() {
      waits.finish(id, Instant::now());
    }
  }
}

#[async_trait]
impl WriteScheduler for TokenScheduler {
  async fn schedule(&self, queue: &str, tokens: SchedulerTokens, job: WriteJob) -> Result<WriteResult, JobError> {
    let tokens = self.clamp_tokens(tokens);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.mark_waiting(id);

    let permits = async {
      let io = self.io.acquire_many(tokens.io).await?;
      let mem = self.mem.acquire_many(tokens.mem).await?;
      Ok::<_, tokio::sync::AcquireError>((io, mem))
    }
    .await;
    self.mark_started(id);
    let _permits = permits?;

    trace!(queue, io = tokens.io, mem = tokens.mem, "Scheduler running write job");
    job().await
  }

  fn stats(&self) -> SchedulerStats {
    SchedulerStats {
      memory: self.memory_signals(),
      write_queue: self.write_queue_signals(),
    }
  }
}
