//! Entry point: plan, size and drain one batch of artifact writes.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use artifact_core::{AdaptiveConfig, ArtifactWriteConfig};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
  controller::{AdaptiveController, ControllerSettings},
  drain::{Drain, DrainSettings, UnitContext, report_concurrency_change},
  error::Result,
  events::DrainEventSender,
  heartbeat::{InFlightWrites, StallMonitor},
  lane::LaneMap,
  metadata::PieceMetadataSink,
  planner::LanePlanner,
  progress::WriteProgress,
  queue::{QueuedWrite, WriteQueue},
  scheduler::WriteScheduler,
  sizing::{effective_write_concurrency, host_parallelism, resolve_write_concurrency},
  strategy::FsStrategy,
  telemetry::WriteTelemetry,
  tokens::TokenPolicy,
};

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
  pub total_writes: usize,
  pub write_concurrency: usize,
  /// Labels per lane, in dispatch-queue order
  pub lane_writes: LaneMap<Vec<String>>,
}

/// Starting ceiling for the adaptive controller.
///
/// An explicit start wins. An explicit write-concurrency override starts at
/// the full cap. Otherwise 60% of the cap, never below the configured floor.
pub fn resolve_adaptive_initial_concurrency(config: &AdaptiveConfig, cap: usize, overridden: bool) -> usize {
  let cap = cap.max(1);
  let min = config.min_concurrency().min(cap);
  if !config.enabled || (overridden && config.start_concurrency().is_none()) {
    return cap;
  }
  if let Some(start) = config.start_concurrency() {
    return start.clamp(min, cap);
  }
  min.max((cap as f64 * 0.6).ceil() as usize).min(cap)
}

/// Dispatches artifact writes through lanes with adaptive concurrency.
pub struct WriteDispatcher {
  config: ArtifactWriteConfig,
  planner: LanePlanner,
  tokens: TokenPolicy,
  strategy: FsStrategy,
  host_concurrency: usize,
  scheduler: Option<Arc<dyn WriteScheduler>>,
  out_dir: Option<PathBuf>,
  metadata: Option<Arc<dyn PieceMetadataSink>>,
  events: Option<DrainEventSender>,
  telemetry: Arc<WriteTelemetry>,
}

impl WriteDispatcher {
  /// Validates `config` up front; nothing is dispatched with a bad config.
  pub fn new(config: ArtifactWriteConfig) -> Result<Self> {
    config.validate()?;
    let planner = LanePlanner::from_config(&config.lanes)?;
    Ok(Self {
      planner,
      tokens: TokenPolicy::from_config(&config),
      strategy: FsStrategy::for_host(&config),
      host_concurrency: host_parallelism(),
      scheduler: None,
      out_dir: None,
      metadata: None,
      events: None,
      telemetry: Arc::new(WriteTelemetry::new()),
      config,
    })
  }

  pub fn with_scheduler(mut self, scheduler: Arc<dyn WriteScheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  /// Directory that labels resolve against when backfilling written bytes.
  pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
    self.out_dir = Some(out_dir.into());
    self
  }

  pub fn with_metadata_sink(mut self, sink: Arc<dyn PieceMetadataSink>) -> Self {
    self.metadata = Some(sink);
    self
  }

  pub fn with_events(mut self, events: DrainEventSender) -> Self {
    self.events = Some(events);
    self
  }

  pub fn with_host_concurrency(mut self, host_concurrency: usize) -> Self {
    self.host_concurrency = host_concurrency.max(1);
    self
  }

  pub fn with_fs_strategy(mut self, strategy: FsStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn config(&self) -> &ArtifactWriteConfig {
    &self.config
  }

  pub fn strategy(&self) -> &FsStrategy {
    &self.strategy
  }

  pub fn out_dir(&self) -> Option<&Path> {
    self.out_dir.as_deref()
  }

  /// New queue that submits eager writes through this dispatcher's scheduler.
  pub fn queue(&self) -> WriteQueue {
    WriteQueue::new(self.scheduler.clone(), self.tokens)
  }

  /// Metric rows accumulated across every drain of this dispatcher.
  pub fn telemetry(&self) -> Arc<WriteTelemetry> {
    self.telemetry.clone()
  }

  pub async fn dispatch_queue(&self, queue: WriteQueue) -> Result<DispatchSummary> {
    self.dispatch(queue.into_writes()).await
  }

  /// Write everything in `writes`, returning once all of them settled. The
  /// first failing write is returned after in-flight writes finish.
  pub async fn dispatch(&self, writes: Vec<QueuedWrite>) -> Result<DispatchSummary> {
    let total_writes = writes.len();
    if total_writes == 0 {
      info!("Writing index files (0 artifacts)...");
      info!("");
      return Ok(DispatchSummary::default());
    }
    info!(
      total_writes,
      "Writing index files ({} artifact{})...",
      total_writes,
      if total_writes == 1 { "" } else { "s" }
    );

    let cap = resolve_write_concurrency(
      self.config.write_concurrency_override()?,
      total_writes,
      self.host_concurrency,
    );
    let write_concurrency = effective_write_concurrency(total_writes, cap.cap);
    let queues = self.planner.split_lanes(writes);
    let lane_writes = queues.map(|_, queue| queue.iter().map(|write| write.label.clone()).collect());

    let adaptive = &self.config.adaptive;
    let controller = adaptive.enabled.then(|| {
      let initial = resolve_adaptive_initial_concurrency(adaptive, write_concurrency, cap.overridden);
      let events = self.events.clone();
      AdaptiveController::new(ControllerSettings::from_config(adaptive, write_concurrency), Some(initial))
        .with_listener(move |change| report_concurrency_change(change, events.as_ref()))
    });
    debug!(
      cap = cap.cap,
      overridden = cap.overridden,
      write_concurrency,
      initial = controller.as_ref().map(AdaptiveController::current),
      fs_strategy = self.strategy.mode_name(),
      "Resolved artifact write concurrency"
    );

    let in_flight = Arc::new(InFlightWrites::new());
    let progress = Arc::new(WriteProgress::new(total_writes, self.events.clone()));
    let monitor = Arc::new(StallMonitor::new(
      in_flight.clone(),
      progress.clone(),
      self.config.heartbeat.stall_thresholds_secs(),
      self.events.clone(),
    ));
    let ctx = Arc::new(UnitContext {
      scheduler: self.scheduler.clone(),
      out_dir: self.out_dir.clone(),
      tokens: self.tokens,
      fs_mode: self.strategy.mode_name(),
      in_flight,
      telemetry: self.telemetry.clone(),
      progress,
      monitor,
      metadata: self.metadata.clone(),
    });
    let settings = DrainSettings {
      write_concurrency,
      host_concurrency: self.host_concurrency,
      work_class_overrides: self.config.work_class_overrides(),
      tail_rescue: self.config.tail_rescue.clone(),
      tail_worker_max_pending: self.config.tail_worker_max_pending(),
      strategy: self.strategy,
      ultra_light_threshold_bytes: self.planner.ultra_light_threshold_bytes(),
      drain_timeout: Duration::from_millis(self.config.drain_timeout_ms),
      heartbeat_interval: Duration::from_millis(self.config.heartbeat.interval_ms),
    };

    Drain::new(settings, ctx, queues, controller, self.events.clone()).run().await?;
    info!("");

    Ok(DispatchSummary {
      total_writes,
      write_concurrency,
      lane_writes,
    })
  }
}
