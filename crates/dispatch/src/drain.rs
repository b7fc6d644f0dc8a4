//! The drain loop.
//!
//! One [`Drain`] owns all mutable state for a single dispatch: the lane
//! queues, per-lane active counts, the tail-worker slot, the tail-rescue flag
//! and the adaptive controller. Nothing outside the drain touches them, so
//! separate drains never interfere.
//!
//! Each dispatch step observes the controller once, then keeps picking lanes
//! (strict priority, bounded by the per-lane budgets) until the ceiling is
//! reached or no lane is eligible. Near the end of a drain the tail worker
//! may take one extra slot for the costliest pending write.
//!
//! Write jobs are spawned as tokio tasks and are never aborted. When a write
//! fails, dispatch stops, the drain waits (bounded by the drain timeout) for
//! everything already running, then returns the first error.

use std::{
  collections::VecDeque,
  path::{Path, PathBuf},
  sync::Arc,
  time::{Duration, Instant},
};

use artifact_core::{TailRescueConfig, WorkClassOverrides};
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio::task::JoinError;
use tracing::{debug, error, info, trace, warn};

use crate::{
  budget::{pick_dispatch_lane, resolve_dispatch_lane_budgets, take_lane_dispatch_entries},
  controller::{AdaptiveController, ConcurrencyChange, ControllerSnapshot},
  error::DispatchError,
  events::{DrainEvent, DrainEventSender, emit},
  heartbeat::{InFlightWrites, StallMonitor, WriteHeartbeat},
  lane::{Lane, LaneMap},
  metadata::{PieceMetadataSink, PieceMetadataUpdate},
  progress::WriteProgress,
  queue::{JobState, QueuedWrite},
  scheduler::{WriteScheduler, submit},
  strategy::{FsStrategy, latency_class, select_tail_worker_entry},
  telemetry::{MetricRow, WriteTelemetry},
  tokens::TokenPolicy,
};

/// Fixed inputs for one drain.
#[derive(Debug, Clone)]
pub struct DrainSettings {
  /// Effective cap; the controller ceiling never exceeds it
  pub write_concurrency: usize,
  pub host_concurrency: usize,
  pub work_class_overrides: WorkClassOverrides,
  pub tail_rescue: TailRescueConfig,
  pub tail_worker_max_pending: usize,
  pub strategy: FsStrategy,
  pub ultra_light_threshold_bytes: u64,
  pub drain_timeout: Duration,
  pub heartbeat_interval: Duration,
}

/// Shared, read-mostly state used by running write tasks.
pub(crate) struct UnitContext {
  pub scheduler: Option<Arc<dyn WriteScheduler>>,
  pub out_dir: Option<PathBuf>,
  pub tokens: TokenPolicy,
  pub fs_mode: &'static str,
  pub in_flight: Arc<InFlightWrites>,
  pub telemetry: Arc<WriteTelemetry>,
  pub progress: Arc<WriteProgress>,
  pub monitor: Arc<StallMonitor>,
  pub metadata: Option<Arc<dyn PieceMetadataSink>>,
}

/// Log line and event for a controller transition.
pub(crate) fn report_concurrency_change(change: &ConcurrencyChange, events: Option<&DrainEventSender>) {
  let context = &change.context;
  let mut detail = format!("{}, pending={}", change.reason, context.pending_writes);
  if context.longest_stall_secs > 0 {
    detail.push_str(&format!(", stall={}s", context.longest_stall_secs));
  }
  let signals = [context.memory_pressure, context.gc_pressure, context.rss_utilization];
  if signals.iter().any(Option::is_some) {
    let score = |value: Option<f64>| value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"));
    detail.push_str(&format!(
      ", mem={}, gc={}, rss={}",
      score(signals[0]),
      score(signals[1]),
      score(signals[2])
    ));
  }
  info!(
    reason = %change.reason,
    from = change.from,
    to = change.to,
    "[perf] adaptive artifact write concurrency {} -> {} ({})",
    change.from,
    change.to,
    detail
  );
  emit(events, DrainEvent::AdaptiveChange(*change));
}

// ============================================================================
// Dispatch units
// ============================================================================

/// Bookkeeping key for one running unit.
#[derive(Debug, Clone)]
struct Slot {
  lane: Lane,
  tail_worker: bool,
  label: String,
}

/// One lane dispatch: a single write or an ultra-light micro-batch.
struct DispatchUnit {
  lane: Lane,
  tail_worker: bool,
  rescue_boost: bool,
  write_concurrency_at_start: usize,
  entries: Vec<QueuedWrite>,
}

type UnitOutcome = (Slot, Result<Result<(), DispatchError>, JoinError>);

/// Batch entries run one after another inside the unit.
async fn run_unit(ctx: Arc<UnitContext>, unit: DispatchUnit) -> Result<(), DispatchError> {
  let batch_size = unit.entries.len();
  for (index, entry) in unit.entries.into_iter().enumerate() {
    let position = (batch_size > 1).then_some((batch_size, index + 1));
    run_single_write(
      &ctx,
      entry,
      unit.lane,
      unit.tail_worker,
      unit.rescue_boost,
      unit.write_concurrency_at_start,
      position,
    )
    .await?;
  }
  Ok(())
}

fn millis_between(earlier: Instant, later: Instant) -> f64 {
  later.saturating_duration_since(earlier).as_secs_f64() * 1000.0
}

async fn stat_output_bytes(out_dir: Option<&Path>, label: &str) -> Option<u64> {
  let path = out_dir?.join(label);
  match tokio::fs::metadata(&path).await {
    Ok(metadata) if metadata.is_file() => Some(metadata.len()),
    Ok(_) => None,
    Err(e) => {
      trace!(label, error = %e, "No output file to backfill bytes from");
      None
    }
  }
}

async fn run_single_write(
  ctx: &UnitContext,
  entry: QueuedWrite,
  lane: Lane,
  tail_worker: bool,
  rescue_boost: bool,
  write_concurrency_at_start: usize,
  batch: Option<(usize, usize)>,
) -> Result<(), DispatchError> {
  let QueuedWrite {
    label,
    estimated_bytes,
    lane_hint,
    enqueued_at,
    state,
    ..
  } = entry;
  let dispatched_at = Instant::now();
  let started_at = match &state {
    JobState::Prefetched { started_at, .. } => *started_at,
    JobState::Pending(_) => dispatched_at,
  };
  let queue_delay_ms = millis_between(enqueued_at, started_at);
  ctx.in_flight.begin(&label, started_at, estimated_bytes);

  let (tokens, outcome) = match state {
    JobState::Prefetched { handle, .. } => {
      let tokens = ctx.tokens.eager_tokens(estimated_bytes, lane_hint);
      (tokens, handle.await)
    }
    JobState::Pending(job) => {
      let tokens = ctx.tokens.dispatch_tokens(estimated_bytes, lane, rescue_boost);
      (tokens, Ok(submit(ctx.scheduler.as_deref(), tokens, job).await))
    }
  };
  let finished_at = Instant::now();

  let result = match outcome {
    Ok(Ok(result)) => result,
    Ok(Err(source)) => {
      ctx.in_flight.finish(&label);
      ctx.monitor.clear_label_alerts(&label);
      return Err(DispatchError::WriteJob { label, source });
    }
    Err(join_error) => {
      ctx.in_flight.finish(&label);
      ctx.monitor.clear_label_alerts(&label);
      return Err(DispatchError::JobPanicked {
        label,
        message: join_error.to_string(),
      });
    }
  };

  let duration_ms = millis_between(started_at, finished_at);
  let serialization_ms = result.serialization_ms.filter(|ms| ms.is_finite());
  let disk_ms = result
    .disk_ms
    .filter(|ms| ms.is_finite())
    .or_else(|| serialization_ms.map(|ser| (duration_ms - ser).max(0.0)));
  let bytes = match result.bytes {
    Some(bytes) => Some(bytes),
    None => stat_output_bytes(ctx.out_dir.as_deref(), &label).await,
  };
  let throughput = bytes
    .filter(|_| duration_ms > 0.0)
    .map(|bytes| bytes as f64 / (duration_ms / 1000.0));
  let class = latency_class(queue_delay_ms, duration_ms, bytes, estimated_bytes);

  ctx.telemetry.record_metric_row(
    &label,
    MetricRow {
      queue_delay_ms: Some(queue_delay_ms),
      duration_ms: Some(duration_ms),
      bytes,
      estimated_bytes,
      throughput_bytes_per_sec: throughput,
      serialization_ms,
      disk_ms,
      direct_fd_streaming: Some(result.direct_fd_streaming),
      tail_rescue_boosted: Some(rescue_boost),
      tail_worker: Some(tail_worker),
      batch_size: batch.map(|(size, _)| size),
      batch_index: batch.map(|(_, index)| index),
      latency_class: Some(class),
      fs_strategy_mode: Some(ctx.fs_mode.to_string()),
      checksum: result.checksum.clone(),
      checksum_algo: result.checksum_algo.clone(),
      lane: Some(lane),
      scheduler_io_tokens: Some(tokens.io),
      scheduler_mem_tokens: Some(tokens.mem),
      write_concurrency_at_start: Some(write_concurrency_at_start),
      ..Default::default()
    },
  );

  if let Some(sink) = &ctx.metadata {
    let update = PieceMetadataUpdate::from_result(&result, bytes);
    if !update.is_empty() {
      sink.update_piece(&label, &update);
    }
  }

  ctx.in_flight.finish(&label);
  ctx.monitor.clear_label_alerts(&label);
  ctx.progress.advance(&label);
  Ok(())
}

// ============================================================================
// Drain
// ============================================================================

pub(crate) struct Drain {
  settings: DrainSettings,
  ctx: Arc<UnitContext>,
  queues: LaneMap<VecDeque<QueuedWrite>>,
  active: LaneMap<usize>,
  tail_worker_active: usize,
  rescue_active: bool,
  controller: Option<AdaptiveController>,
  events: Option<DrainEventSender>,
}

impl Drain {
  pub(crate) fn new(
    settings: DrainSettings,
    ctx: Arc<UnitContext>,
    queues: LaneMap<VecDeque<QueuedWrite>>,
    controller: Option<AdaptiveController>,
    events: Option<DrainEventSender>,
  ) -> Self {
    Self {
      settings,
      ctx,
      queues,
      active: LaneMap::default(),
      tail_worker_active: 0,
      rescue_active: false,
      controller,
      events,
    }
  }

  /// Run to completion. The heartbeat is stopped and in-flight bookkeeping
  /// cleared whatever the outcome.
  pub(crate) async fn run(mut self) -> Result<(), DispatchError> {
    let mut heartbeat = WriteHeartbeat::start(self.ctx.monitor.clone(), self.settings.heartbeat_interval);
    let outcome = self.drain_all().await;
    heartbeat.stop();
    self.ctx.in_flight.clear();
    self.ctx.monitor.clear();
    outcome
  }

  fn pending(&self) -> usize {
    self.queues.ultra_light.len() + self.queues.light.len() + self.queues.heavy.len() + self.queues.massive.len()
  }

  fn running(&self) -> usize {
    self.active.total() + self.tail_worker_active
  }

  async fn drain_all(&mut self) -> Result<(), DispatchError> {
    let mut running: FuturesUnordered<BoxFuture<'static, UnitOutcome>> = FuturesUnordered::new();
    self.dispatch(&mut running);

    while !running.is_empty() || self.pending() > 0 {
      if running.is_empty() {
        self.dispatch(&mut running);
        if running.is_empty() {
          break;
        }
      }
      let Some((slot, joined)) = running.next().await else {
        break;
      };
      self.release(&slot);
      if let Err(error) = unit_result(&slot, joined) {
        return Err(self.settle_after_failure(running, error).await);
      }
      self.dispatch(&mut running);
    }
    Ok(())
  }

  /// Stop dispatching and wait (bounded) for running units. Later failures
  /// are logged and dropped; the first error is returned.
  async fn settle_after_failure(
    &mut self,
    mut running: FuturesUnordered<BoxFuture<'static, UnitOutcome>>,
    error: DispatchError,
  ) -> DispatchError {
    error!(
      error = %error,
      in_flight = running.len(),
      pending = self.pending(),
      "Artifact write failed, waiting for in-flight writes"
    );
    let timeout = self.settings.drain_timeout;
    let settle = async {
      while let Some((slot, joined)) = running.next().await {
        self.release(&slot);
        if let Err(later) = unit_result(&slot, joined) {
          debug!(error = %later, "Additional artifact write failure while draining");
        }
      }
    };
    if tokio::time::timeout(timeout, settle).await.is_err() {
      warn!(
        timeout_ms = timeout.as_millis() as u64,
        still_running = running.len(),
        "Timed out waiting for in-flight artifact writes after failure"
      );
    }
    error
  }

  fn release(&mut self, slot: &Slot) {
    if slot.tail_worker {
      self.tail_worker_active = self.tail_worker_active.saturating_sub(1);
    } else {
      let active = self.active.get_mut(slot.lane);
      *active = active.saturating_sub(1);
    }
  }

  fn update_tail_rescue(&mut self, remaining: usize, stall_secs: u64) {
    let config = &self.settings.tail_rescue;
    let should_rescue =
      config.enabled && remaining > 0 && remaining <= config.max_pending() && stall_secs >= config.stall_secs();
    if should_rescue == self.rescue_active {
      return;
    }
    self.rescue_active = should_rescue;
    let (boost_io, boost_mem) = (config.boost_io_tokens, config.boost_mem_tokens);
    if should_rescue {
      warn!(
        remaining,
        stall_secs,
        "[perf] write tail rescue active: remaining={}, stall={}s, boost=+{}io/+{}mem",
        remaining,
        stall_secs,
        boost_io,
        boost_mem
      );
    } else {
      info!(remaining, "[perf] write tail rescue cleared");
    }
    emit(
      self.events.as_ref(),
      DrainEvent::TailRescue {
        active: should_rescue,
        remaining,
        stall_secs,
        boost_io,
        boost_mem,
      },
    );
  }

  fn observe_controller(&mut self, stall_secs: u64) -> usize {
    let pending = self.pending();
    let active = self.running();
    let Some(controller) = self.controller.as_mut() else {
      return self.settings.write_concurrency;
    };
    let stats = self
      .ctx
      .scheduler
      .as_ref()
      .map(|scheduler| scheduler.stats())
      .unwrap_or_default();
    let memory = stats.memory.unwrap_or_default();
    let write_queue = stats.write_queue.unwrap_or_default();
    controller.observe(ControllerSnapshot {
      pending_writes: pending,
      active_writes: active,
      longest_stall_secs: stall_secs,
      memory_pressure: memory.pressure_score,
      gc_pressure: memory.gc_pressure_score,
      rss_utilization: memory.rss_utilization,
      scheduler_write_pending: write_queue.pending,
      scheduler_write_oldest_wait_ms: write_queue.oldest_wait_ms,
      scheduler_write_wait_p95_ms: write_queue.wait_p95_ms,
    })
  }

  /// The extra slot only opens near drain end, counting running writes.
  fn tail_worker_eligible(&self, remaining: usize) -> bool {
    self.settings.strategy.tail_worker
      && self.tail_worker_active == 0
      && remaining > 0
      && remaining <= self.settings.tail_worker_max_pending
  }

  /// One dispatch step.
  fn dispatch(&mut self, running: &mut FuturesUnordered<BoxFuture<'static, UnitOutcome>>) {
    let stall_secs = self.ctx.in_flight.longest_stall_secs(Instant::now());
    let ceiling = self.observe_controller(stall_secs);

    loop {
      let pending = self.pending();
      if pending == 0 {
        break;
      }
      let remaining = pending + self.running();
      self.update_tail_rescue(remaining, stall_secs);
      let forced = if self.rescue_active { self.settings.write_concurrency } else { 0 };
      let active_concurrency = ceiling.max(forced).max(1);
      let tail_eligible = self.tail_worker_eligible(remaining);
      let limit = active_concurrency + usize::from(tail_eligible);
      if self.running() >= limit {
        break;
      }

      if self.running() < active_concurrency {
        let queued = self.queues.map(|_, queue| queue.len());
        let budgets = resolve_dispatch_lane_budgets(
          &queued,
          &self.active,
          active_concurrency,
          &self.settings.work_class_overrides,
          self.settings.host_concurrency,
        );
        if let Some(lane) = pick_dispatch_lane(&queued, &self.active, &budgets) {
          let entries = take_lane_dispatch_entries(
            &mut self.queues,
            lane,
            &self.settings.strategy,
            self.settings.ultra_light_threshold_bytes,
          );
          if !entries.is_empty() {
            *self.active.get_mut(lane) += 1;
            let rescue_boost = self.rescue_active && lane != Lane::UltraLight;
            self.launch(running, lane, false, rescue_boost, active_concurrency, entries);
            continue;
          }
        }
      }

      if tail_eligible
        && self.running() >= active_concurrency
        && let Some((lane, entry)) = select_tail_worker_entry(&mut self.queues)
      {
        debug!(label = %entry.label, lane = %lane, remaining, "Tail worker taking write");
        self.tail_worker_active += 1;
        let rescue_boost = self.rescue_active && lane != Lane::UltraLight;
        self.launch(running, lane, true, rescue_boost, active_concurrency, vec![entry]);
        continue;
      }

      // Budgets always leave a slot when nothing runs; this only guards
      // against a drain that could otherwise never finish.
      if running.is_empty()
        && let Some(lane) = Lane::DISPATCH_ORDER
          .into_iter()
          .find(|lane| !self.queues.get(*lane).is_empty())
      {
        let entries = take_lane_dispatch_entries(
          &mut self.queues,
          lane,
          &self.settings.strategy,
          self.settings.ultra_light_threshold_bytes,
        );
        *self.active.get_mut(lane) += 1;
        self.launch(running, lane, false, false, active_concurrency, entries);
        continue;
      }
      break;
    }
  }

  fn launch(
    &self,
    running: &mut FuturesUnordered<BoxFuture<'static, UnitOutcome>>,
    lane: Lane,
    tail_worker: bool,
    rescue_boost: bool,
    write_concurrency_at_start: usize,
    entries: Vec<QueuedWrite>,
  ) {
    let slot = Slot {
      lane,
      tail_worker,
      label: entries.first().map(|entry| entry.label.clone()).unwrap_or_default(),
    };
    trace!(
      label = %slot.label,
      lane = %lane,
      batch = entries.len(),
      tail_worker,
      rescue_boost,
      "Dispatching artifact write"
    );
    let unit = DispatchUnit {
      lane,
      tail_worker,
      rescue_boost,
      write_concurrency_at_start,
      entries,
    };
    let handle = tokio::spawn(run_unit(self.ctx.clone(), unit));
    running.push(async move { (slot, handle.await) }.boxed());
  }
}

fn unit_result(slot: &Slot, joined: Result<Result<(), DispatchError>, JoinError>) -> Result<(), DispatchError> {
  match joined {
    Ok(result) => result,
    Err(join_error) => Err(DispatchError::JobPanicked {
      label: slot.label.clone(),
      message: join_error.to_string(),
    }),
  }
}
