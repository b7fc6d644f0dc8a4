//! Adaptive write-concurrency controller.
//!
//! A feedback state machine that nudges the concurrency ceiling up or down
//! from backlog, stall and memory signals. Rules are evaluated in strict
//! priority on each [`AdaptiveController::observe`] call:
//!
//! 1. memory-pressure scale-down (overrides everything else)
//! 2. stall scale-down, when the stall is attributable to the write queue
//! 3. drain scale-down near the end of the queue
//! 4. backlog scale-up
//! 5. memory-headroom scale-up
//!
//! Scale-up and scale-down each have their own cooldown window. The ceiling
//! is always clamped to `[min, max]`.

use std::{
  fmt,
  time::{Duration, Instant},
};

use artifact_core::AdaptiveConfig;
use serde::Serialize;

use crate::sizing::clamp_write_concurrency;

/// Live signals for one observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSnapshot {
  pub pending_writes: usize,
  pub active_writes: usize,
  pub longest_stall_secs: u64,
  /// 0..1 scores; `None` when the scheduler does not report them
  pub memory_pressure: Option<f64>,
  pub gc_pressure: Option<f64>,
  pub rss_utilization: Option<f64>,
  pub scheduler_write_pending: Option<u64>,
  pub scheduler_write_oldest_wait_ms: Option<u64>,
  pub scheduler_write_wait_p95_ms: Option<u64>,
}

impl ControllerSnapshot {
  fn normalized(mut self) -> Self {
    let unit = |value: Option<f64>| value.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 1.0));
    self.memory_pressure = unit(self.memory_pressure);
    self.gc_pressure = unit(self.gc_pressure);
    self.rss_utilization = unit(self.rss_utilization);
    self
  }

  fn has_scheduler_write_signals(&self) -> bool {
    self.scheduler_write_pending.is_some()
      || self.scheduler_write_oldest_wait_ms.is_some()
      || self.scheduler_write_wait_p95_ms.is_some()
  }
}

/// Why the ceiling moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleReason {
  MemoryPressure,
  Stall,
  Drain,
  Backlog,
  MemoryHeadroom,
}

impl ScaleReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      ScaleReason::MemoryPressure => "memory-pressure",
      ScaleReason::Stall => "stall",
      ScaleReason::Drain => "drain",
      ScaleReason::Backlog => "backlog",
      ScaleReason::MemoryHeadroom => "memory-headroom",
    }
  }
}

impl fmt::Display for ScaleReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Where a stall is coming from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StallAttribution {
  None,
  WriteQueue,
  NonWrite,
  Unknown,
}

/// One ceiling transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyChange {
  pub reason: ScaleReason,
  pub from: usize,
  pub to: usize,
  pub stall_attribution: StallAttribution,
  pub context: ControllerSnapshot,
}

/// Thresholds after clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
  pub min: usize,
  pub max: usize,
  pub scale_up_backlog_per_slot: f64,
  pub scale_down_backlog_per_slot: f64,
  pub stall_scale_down_secs: u64,
  pub stall_scale_up_guard_secs: u64,
  pub scale_up_cooldown: Duration,
  pub scale_down_cooldown: Duration,
  pub memory_pressure_high: f64,
  pub memory_pressure_low: f64,
  pub gc_pressure_high: f64,
  pub gc_pressure_low: f64,
  pub write_queue_pending_threshold: u64,
  pub write_queue_oldest_wait_ms_threshold: u64,
  pub write_queue_wait_p95_ms_threshold: u64,
}

impl ControllerSettings {
  pub fn from_config(config: &AdaptiveConfig, max_concurrency: usize) -> Self {
    let max = clamp_write_concurrency(Some(max_concurrency), 1);
    let memory_pressure_high = config.memory_pressure_high.clamp(0.0, 1.0);
    let gc_pressure_high = config.gc_pressure_high.clamp(0.0, 1.0);
    Self {
      min: config.min_concurrency().min(max),
      max,
      scale_up_backlog_per_slot: config.scale_up_backlog_per_slot(),
      scale_down_backlog_per_slot: config.scale_down_backlog_per_slot(),
      stall_scale_down_secs: config.stall_scale_down_secs(),
      stall_scale_up_guard_secs: config.stall_scale_up_guard_secs(),
      scale_up_cooldown: Duration::from_millis(config.scale_up_cooldown_ms),
      scale_down_cooldown: Duration::from_millis(config.scale_down_cooldown_ms),
      memory_pressure_high,
      memory_pressure_low: config.memory_pressure_low.clamp(0.0, memory_pressure_high),
      gc_pressure_high,
      gc_pressure_low: config.gc_pressure_low.clamp(0.0, gc_pressure_high),
      write_queue_pending_threshold: config.write_queue_pending_threshold.max(1),
      write_queue_oldest_wait_ms_threshold: config.write_queue_oldest_wait_ms_threshold.max(1),
      write_queue_wait_p95_ms_threshold: config.write_queue_wait_p95_ms_threshold.max(1),
    }
  }
}

type ChangeListener = Box<dyn FnMut(&ConcurrencyChange) + Send>;

/// Concurrency ceiling controller. One instance per drain.
pub struct AdaptiveController {
  settings: ControllerSettings,
  current: usize,
  last_scale_up_at: Option<Instant>,
  last_scale_down_at: Option<Instant>,
  on_change: Option<ChangeListener>,
}

impl AdaptiveController {
  /// `initial` defaults to 60% of `max`, never below `min`.
  pub fn new(settings: ControllerSettings, initial: Option<usize>) -> Self {
    let fallback = settings
      .min
      .max(settings.max.min((settings.max as f64 * 0.6).ceil() as usize));
    let current = clamp_write_concurrency(initial, fallback).clamp(settings.min, settings.max);
    Self {
      settings,
      current,
      last_scale_up_at: None,
      last_scale_down_at: None,
      on_change: None,
    }
  }

  /// Called for every transition where the ceiling actually changed.
  pub fn with_listener(mut self, listener: impl FnMut(&ConcurrencyChange) + Send + 'static) -> Self {
    self.on_change = Some(Box::new(listener));
    self
  }

  pub fn current(&self) -> usize {
    self.current
  }

  pub fn limits(&self) -> (usize, usize) {
    (self.settings.min, self.settings.max)
  }

  pub fn observe(&mut self, snapshot: ControllerSnapshot) -> usize {
    self.observe_at(snapshot, Instant::now())
  }

  /// Observe with an explicit clock reading.
  pub fn observe_at(&mut self, snapshot: ControllerSnapshot, now: Instant) -> usize {
    let s = self.settings;
    let snapshot = snapshot.normalized();
    let pending = snapshot.pending_writes;
    let stall = snapshot.longest_stall_secs;

    let attributed_to_write_queue = if snapshot.has_scheduler_write_signals() {
      snapshot
        .scheduler_write_pending
        .is_some_and(|p| p >= s.write_queue_pending_threshold)
        && (snapshot
          .scheduler_write_oldest_wait_ms
          .is_some_and(|w| w >= s.write_queue_oldest_wait_ms_threshold)
          || snapshot
            .scheduler_write_wait_p95_ms
            .is_some_and(|w| w >= s.write_queue_wait_p95_ms_threshold))
    } else {
      pending > 0 && snapshot.active_writes >= self.current.saturating_sub(1).max(1)
    };
    let attribution = match (stall, attributed_to_write_queue, snapshot.has_scheduler_write_signals()) {
      (0, _, _) => StallAttribution::None,
      (_, true, _) => StallAttribution::WriteQueue,
      (_, false, true) => StallAttribution::NonWrite,
      (_, false, false) => StallAttribution::Unknown,
    };

    let backlog_per_slot = pending as f64 / self.current.max(1) as f64;
    let at_or_above = |value: Option<f64>, threshold: f64| value.is_some_and(|v| v >= threshold);
    let at_or_below = |value: Option<f64>, threshold: f64| value.is_none_or(|v| v <= threshold);
    let high_memory = at_or_above(snapshot.memory_pressure, s.memory_pressure_high)
      || at_or_above(snapshot.gc_pressure, s.gc_pressure_high)
      || at_or_above(snapshot.rss_utilization, s.memory_pressure_high);
    let low_memory = at_or_below(snapshot.memory_pressure, s.memory_pressure_low)
      && at_or_below(snapshot.gc_pressure, s.gc_pressure_low)
      && at_or_below(snapshot.rss_utilization, s.memory_pressure_low);

    let cooled = |last: Option<Instant>, cooldown: Duration| {
      last.is_none_or(|at| now.saturating_duration_since(at) >= cooldown)
    };
    let from = self.current;

    let can_scale_down = self.current > s.min && cooled(self.last_scale_down_at, s.scale_down_cooldown);
    if can_scale_down {
      let step = if high_memory {
        Some((ScaleReason::MemoryPressure, 1))
      } else if pending > 0 && stall >= s.stall_scale_down_secs && attributed_to_write_queue {
        // Deep queue plus a long oldest wait halves the recovery time
        let severe = match (snapshot.scheduler_write_pending, snapshot.scheduler_write_oldest_wait_ms) {
          (Some(queue_pending), Some(oldest_wait)) => {
            queue_pending >= (s.write_queue_pending_threshold + 1).max((self.current as f64 * 0.75).ceil() as u64)
              && oldest_wait >= (s.write_queue_oldest_wait_ms_threshold * 2).max(4000)
          }
          _ => false,
        };
        Some((ScaleReason::Stall, if severe { 2 } else { 1 }))
      } else if pending <= 1
        && snapshot.active_writes < self.current
        && backlog_per_slot <= s.scale_down_backlog_per_slot
      {
        Some((ScaleReason::Drain, 1))
      } else {
        None
      };
      if let Some((reason, step)) = step {
        self.current = self.current.saturating_sub(step).max(s.min);
        self.last_scale_down_at = Some(now);
        self.emit(reason, from, attribution, snapshot);
        return self.current;
      }
    }

    let can_scale_up = self.current < s.max && cooled(self.last_scale_up_at, s.scale_up_cooldown);
    if can_scale_up && pending > 0 {
      let reason = if backlog_per_slot >= s.scale_up_backlog_per_slot && stall <= s.stall_scale_up_guard_secs {
        Some(ScaleReason::Backlog)
      } else if low_memory
        && backlog_per_slot >= (s.scale_up_backlog_per_slot * 0.6).max(0.75)
        && stall as f64 <= (s.stall_scale_up_guard_secs as f64 * 0.75).max(1.0)
      {
        Some(ScaleReason::MemoryHeadroom)
      } else {
        None
      };
      if let Some(reason) = reason {
        self.current += 1;
        self.last_scale_up_at = Some(now);
        self.emit(reason, from, attribution, snapshot);
      }
    }
    self.current
  }

  fn emit(&mut self, reason: ScaleReason, from: usize, attribution: StallAttribution, context: ControllerSnapshot) {
    if from == self.current {
      return;
    }
    let change = ConcurrencyChange {
      reason,
      from,
      to: self.current,
      stall_attribution: attribution,
      context,
    };
    if let Some(listener) = self.on_change.as_mut() {
      listener(&change);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};

  use super::*;

  fn settings(max: usize) -> ControllerSettings {
    ControllerSettings::from_config(&AdaptiveConfig::default(), max)
  }

  fn recording(max: usize, initial: usize) -> (AdaptiveController, Arc<Mutex<Vec<ConcurrencyChange>>>) {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    let controller =
      AdaptiveController::new(settings(max), Some(initial)).with_listener(move |change| sink.lock().unwrap().push(*change));
    (controller, changes)
  }

  #[test]
  fn test_initial_defaults_to_sixty_percent() {
    assert_eq!(AdaptiveController::new(settings(10), None).current(), 6);
    assert_eq!(AdaptiveController::new(settings(1), None).current(), 1);
    assert_eq!(AdaptiveController::new(settings(8), Some(50)).current(), 8);
    assert_eq!(AdaptiveController::new(settings(8), Some(0)).current(), 5);
  }

  #[test]
  fn test_empty_queue_with_saturated_slots_holds_ceiling() {
    let mut controller = AdaptiveController::new(settings(8), Some(4));
    let start = Instant::now();
    for step in 0..20 {
      let now = start + Duration::from_secs(step * 5);
      let snapshot = ControllerSnapshot {
        active_writes: 4,
        ..Default::default()
      };
      assert_eq!(controller.observe_at(snapshot, now), 4);
    }
  }

  #[test]
  fn test_empty_idle_queue_drains_to_min_and_stays() {
    let (mut controller, changes) = recording(8, 4);
    let start = Instant::now();
    let ceilings: Vec<usize> = (0..6)
      .map(|step| controller.observe_at(ControllerSnapshot::default(), start + Duration::from_secs(step * 5)))
      .collect();
    assert_eq!(ceilings, vec![3, 2, 1, 1, 1, 1]);
    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 3);
    assert!(changes.iter().all(|change| change.reason == ScaleReason::Drain));
  }

  #[test]
  fn test_memory_pressure_overrides_backlog() {
    let (mut controller, changes) = recording(8, 4);
    let snapshot = ControllerSnapshot {
      pending_writes: 100,
      active_writes: 4,
      memory_pressure: Some(0.95),
      ..Default::default()
    };
    assert_eq!(controller.observe_at(snapshot, Instant::now()), 3);
    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].reason, ScaleReason::MemoryPressure);
    assert_eq!((changes[0].from, changes[0].to), (4, 3));
  }

  #[test]
  fn test_gc_and_rss_pressure_scale_down() {
    let mut controller = AdaptiveController::new(settings(8), Some(4));
    let now = Instant::now();
    let gc = ControllerSnapshot {
      gc_pressure: Some(0.5),
      ..Default::default()
    };
    assert_eq!(controller.observe_at(gc, now), 3);
    let rss = ControllerSnapshot {
      rss_utilization: Some(1.5),
      ..Default::default()
    };
    // Inside the scale-down cooldown
    assert_eq!(controller.observe_at(rss, now + Duration::from_millis(100)), 3);
    assert_eq!(controller.observe_at(rss, now + Duration::from_millis(1300)), 2);
  }

  #[test]
  fn test_stall_scale_down_heuristic_attribution() {
    let (mut controller, changes) = recording(8, 6);
    let snapshot = ControllerSnapshot {
      pending_writes: 4,
      active_writes: 5,
      longest_stall_secs: 25,
      ..Default::default()
    };
    assert_eq!(controller.observe_at(snapshot, Instant::now()), 5);
    let change = changes.lock().unwrap()[0];
    assert_eq!(change.reason, ScaleReason::Stall);
    assert_eq!(change.stall_attribution, StallAttribution::WriteQueue);
  }

  #[test]
  fn test_severe_queue_stall_steps_by_two() {
    let mut controller = AdaptiveController::new(settings(8), Some(8));
    let snapshot = ControllerSnapshot {
      pending_writes: 10,
      active_writes: 2,
      longest_stall_secs: 30,
      scheduler_write_pending: Some(6),
      scheduler_write_oldest_wait_ms: Some(5000),
      ..Default::default()
    };
    assert_eq!(controller.observe_at(snapshot, Instant::now()), 6);
  }

  #[test]
  fn test_stall_not_attributed_to_write_queue_does_not_scale_down() {
    let (mut controller, changes) = recording(8, 4);
    let snapshot = ControllerSnapshot {
      pending_writes: 2,
      active_writes: 1,
      longest_stall_secs: 30,
      scheduler_write_pending: Some(0),
      scheduler_write_oldest_wait_ms: Some(0),
      ..Default::default()
    };
    // Not attributable, backlog too small to scale up
    assert_eq!(controller.observe_at(snapshot, Instant::now()), 4);
    assert!(changes.lock().unwrap().is_empty());
  }

  #[test]
  fn test_drain_scale_down() {
    let (mut controller, changes) = recording(8, 4);
    let snapshot = ControllerSnapshot {
      pending_writes: 1,
      active_writes: 2,
      ..Default::default()
    };
    assert_eq!(controller.observe_at(snapshot, Instant::now()), 3);
    assert_eq!(changes.lock().unwrap()[0].reason, ScaleReason::Drain);
  }

  #[test]
  fn test_backlog_scale_up_with_cooldown() {
    let (mut controller, changes) = recording(8, 2);
    let start = Instant::now();
    let snapshot = ControllerSnapshot {
      pending_writes: 20,
      active_writes: 2,
      longest_stall_secs: 1,
      ..Default::default()
    };
    assert_eq!(controller.observe_at(snapshot, start), 3);
    assert_eq!(controller.observe_at(snapshot, start + Duration::from_millis(100)), 3);
    assert_eq!(controller.observe_at(snapshot, start + Duration::from_millis(500)), 4);
    assert!(changes.lock().unwrap().iter().all(|c| c.reason == ScaleReason::Backlog));
  }

  #[test]
  fn test_memory_headroom_scale_up() {
    let (mut controller, changes) = recording(8, 4);
    // backlog/slot = 1.25: below 1.75 but above max(0.75, 1.05)
    let snapshot = ControllerSnapshot {
      pending_writes: 5,
      active_writes: 2,
      memory_pressure: Some(0.3),
      ..Default::default()
    };
    assert_eq!(controller.observe_at(snapshot, Instant::now()), 5);
    assert_eq!(changes.lock().unwrap()[0].reason, ScaleReason::MemoryHeadroom);
  }

  #[test]
  fn test_stall_guard_blocks_scale_up() {
    let mut controller = AdaptiveController::new(settings(8), Some(2));
    let snapshot = ControllerSnapshot {
      pending_writes: 20,
      active_writes: 0,
      longest_stall_secs: 12,
      ..Default::default()
    };
    assert_eq!(controller.observe_at(snapshot, Instant::now()), 2);
  }

  #[test]
  fn test_ceiling_stays_within_limits() {
    let mut controller = AdaptiveController::new(settings(3), Some(3));
    let start = Instant::now();
    let busy = ControllerSnapshot {
      pending_writes: 50,
      active_writes: 3,
      ..Default::default()
    };
    for step in 0..10 {
      let value = controller.observe_at(busy, start + Duration::from_secs(step));
      assert!((1..=3).contains(&value));
    }
    let pressured = ControllerSnapshot {
      memory_pressure: Some(1.0),
      ..Default::default()
    };
    for step in 10..20 {
      controller.observe_at(pressured, start + Duration::from_secs(step * 2));
    }
    assert_eq!(controller.current(), 1);
    assert_eq!(controller.limits(), (1, 3));
  }
}
