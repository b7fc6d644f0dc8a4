//! In-flight write tracking and the stall heartbeat.
//!
//! [`InFlightWrites`] is the shared record of which labels are running and
//! since when. [`StallMonitor`] turns it into stall alerts and a status line;
//! [`WriteHeartbeat`] runs the monitor on a timer until stopped or dropped.

use std::{
  collections::HashSet,
  sync::Arc,
  time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  events::{DrainEvent, DrainEventSender, emit},
  progress::WriteProgress,
};

const STATUS_PREVIEW: usize = 3;

// ============================================================================
// In-flight bookkeeping
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct InFlightEntry {
  started_at: Instant,
  estimated_bytes: Option<u64>,
}

/// One running write as seen at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightWrite {
  pub label: String,
  pub elapsed_secs: u64,
  pub estimated_bytes: Option<u64>,
}

#[derive(Debug, Default)]
pub struct InFlightWrites {
  entries: DashMap<String, InFlightEntry>,
}

impl InFlightWrites {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn begin(&self, label: &str, started_at: Instant, estimated_bytes: Option<u64>) {
    self.entries.insert(
      label.to_string(),
      InFlightEntry {
        started_at,
        estimated_bytes,
      },
    );
  }

  pub fn finish(&self, label: &str) {
    self.entries.remove(label);
  }

  pub fn count(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Estimated bytes across writes that reported a size.
  pub fn bytes_in_flight(&self) -> u64 {
    self.entries.iter().filter_map(|entry| entry.estimated_bytes).sum()
  }

  /// Seconds the oldest in-flight write has been running, 0 when idle.
  pub fn longest_stall_secs(&self, now: Instant) -> u64 {
    self
      .entries
      .iter()
      .map(|entry| now.saturating_duration_since(entry.started_at).as_secs())
      .max()
      .unwrap_or(0)
  }

  /// Running writes, longest first. Elapsed time is rounded and at least 1s.
  pub fn snapshot(&self, now: Instant) -> Vec<InFlightWrite> {
    let mut writes: Vec<InFlightWrite> = self
      .entries
      .iter()
      .map(|entry| InFlightWrite {
        label: entry.key().clone(),
        elapsed_secs: (now.saturating_duration_since(entry.started_at).as_secs_f64().round() as u64).max(1),
        estimated_bytes: entry.estimated_bytes,
      })
      .collect();
    writes.sort_by(|a, b| b.elapsed_secs.cmp(&a.elapsed_secs).then_with(|| a.label.cmp(&b.label)));
    writes
  }

  pub fn clear(&self) {
    self.entries.clear();
  }
}

// ============================================================================
// Stall alerts
// ============================================================================

/// Severity for the threshold at `index` in the ascending threshold list.
pub fn stall_level_name(threshold_secs: u64, index: usize) -> String {
  match threshold_secs {
    60.. => "severe".to_string(),
    30.. => "critical".to_string(),
    10.. => "warning".to_string(),
    _ => format!("level-{}", index + 1),
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StallAlert {
  pub label: String,
  pub level: String,
  pub elapsed_secs: u64,
  pub threshold_secs: u64,
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
  if bytes < 1024 {
    return format!("{bytes}B");
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  format!("{value:.1}{}", UNITS[unit])
}

/// Status line for the longest running writes.
pub fn format_in_flight_status(completed: usize, total: usize, writes: &[InFlightWrite]) -> String {
  let preview: Vec<String> = writes
    .iter()
    .take(STATUS_PREVIEW)
    .map(|write| match write.estimated_bytes {
      Some(bytes) => format!("{} ({}s, ~{})", write.label, write.elapsed_secs, format_bytes(bytes)),
      None => format!("{} ({}s)", write.label, write.elapsed_secs),
    })
    .collect();
  let mut line = format!("Writing index files {completed}/{total} | in-flight: {}", preview.join(", "));
  if writes.len() > STATUS_PREVIEW {
    line.push_str(&format!(" (+{} more)", writes.len() - STATUS_PREVIEW));
  }
  line
}

/// Evaluates stall thresholds against the in-flight set. Each threshold fires
/// at most once per label until the label's alerts are cleared.
#[derive(Debug)]
pub struct StallMonitor {
  in_flight: Arc<InFlightWrites>,
  progress: Arc<WriteProgress>,
  thresholds_secs: Vec<u64>,
  fired: DashMap<String, HashSet<u64>>,
  events: Option<DrainEventSender>,
}

impl StallMonitor {
  /// `thresholds_secs` must be ascending and deduplicated.
  pub fn new(
    in_flight: Arc<InFlightWrites>,
    progress: Arc<WriteProgress>,
    thresholds_secs: Vec<u64>,
    events: Option<DrainEventSender>,
  ) -> Self {
    Self {
      in_flight,
      progress,
      thresholds_secs,
      fired: DashMap::new(),
      events,
    }
  }

  pub fn clear_label_alerts(&self, label: &str) {
    self.fired.remove(label);
  }

  pub fn clear(&self) {
    self.fired.clear();
  }

  /// One heartbeat: fire any newly crossed thresholds and log the status
  /// line. Returns the alerts fired by this tick.
  pub fn tick(&self, now: Instant) -> Vec<StallAlert> {
    if self.in_flight.is_empty() || self.progress.is_done() {
      return Vec::new();
    }
    let writes = self.in_flight.snapshot(now);
    let mut alerts = Vec::new();

    for write in &writes {
      for (index, threshold) in self.thresholds_secs.iter().copied().enumerate() {
        if write.elapsed_secs < threshold {
          break;
        }
        let newly_fired = self.fired.entry(write.label.clone()).or_default().insert(threshold);
        if !newly_fired {
          continue;
        }
        let alert = StallAlert {
          label: write.label.clone(),
          level: stall_level_name(threshold, index),
          elapsed_secs: write.elapsed_secs,
          threshold_secs: threshold,
        };
        if threshold >= 30 {
          error!(
            label = %alert.label,
            elapsed_secs = alert.elapsed_secs,
            threshold_secs = threshold,
            "[perf] artifact write stall {}: {} in-flight for {}s (threshold={}s)",
            alert.level,
            alert.label,
            alert.elapsed_secs,
            threshold
          );
        } else {
          warn!(
            label = %alert.label,
            elapsed_secs = alert.elapsed_secs,
            threshold_secs = threshold,
            "[perf] artifact write stall {}: {} in-flight for {}s (threshold={}s)",
            alert.level,
            alert.label,
            alert.elapsed_secs,
            threshold
          );
        }
        emit(self.events.as_ref(), DrainEvent::StallAlert(alert.clone()));
        alerts.push(alert);
      }
    }

    info!(
      in_flight = writes.len(),
      bytes_in_flight = self.in_flight.bytes_in_flight(),
      "{}",
      format_in_flight_status(self.progress.completed(), self.progress.total(), &writes)
    );
    alerts
  }
}

// ============================================================================
// Timer task
// ============================================================================

/// Background heartbeat. Stops on [`WriteHeartbeat::stop`] or drop.
#[derive(Debug)]
pub struct WriteHeartbeat {
  cancel: CancellationToken,
  handle: Option<JoinHandle<()>>,
}

impl WriteHeartbeat {
  /// Start ticking every `interval`. A zero interval yields a heartbeat that
  /// never ticks.
  pub fn start(monitor: Arc<StallMonitor>, interval: Duration) -> Self {
    let cancel = CancellationToken::new();
    if interval.is_zero() {
      return Self { cancel, handle: None };
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!("No runtime for write heartbeat");
      return Self { cancel, handle: None };
    };

    let token = cancel.clone();
    let handle = runtime.spawn(async move {
      let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
      timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          biased;

          _ = token.cancelled() => break,

          _ = timer.tick() => {
            monitor.tick(Instant::now());
          }
        }
      }
      debug!("Write heartbeat stopped");
    });
    Self {
      cancel,
      handle: Some(handle),
    }
  }

  pub fn is_running(&self) -> bool {
    self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
  }

  pub fn stop(&mut self) {
    self.cancel.cancel();
    self.handle.take();
  }
}

impl Drop for WriteHeartbeat {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
