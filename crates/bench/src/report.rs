//! JSON report for one harness run.

use std::{collections::BTreeMap, path::Path};

use chrono::{DateTime, Utc};
use dispatch::{
  ConcurrencyChange, DispatchSummary, DrainEvent, MetricRow, WriteTelemetry, heartbeat::StallAlert,
  metadata::PieceEntry, telemetry::LatencyClassSummary,
};
use serde::Serialize;

use crate::{Result, workload::WorkloadSpec};

/// Structured drain events collected during a run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
  pub adaptive_changes: Vec<ConcurrencyChange>,
  pub stall_alerts: Vec<StallAlert>,
  pub tail_rescue_activations: usize,
  pub progress_events: usize,
}

impl EventLog {
  pub fn record(&mut self, event: &DrainEvent) {
    match event {
      DrainEvent::AdaptiveChange(change) => self.adaptive_changes.push(*change),
      DrainEvent::StallAlert(alert) => self.stall_alerts.push(alert.clone()),
      DrainEvent::TailRescue { active: true, .. } => self.tail_rescue_activations += 1,
      DrainEvent::TailRescue { .. } => {}
      DrainEvent::Progress { .. } => self.progress_events += 1,
    }
  }

  /// Lowest ceiling the controller moved to, if it moved at all.
  pub fn min_concurrency(&self) -> Option<usize> {
    self.adaptive_changes.iter().map(|change| change.to).min()
  }
}

/// Report metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
  pub timestamp: DateTime<Utc>,
  pub version: String,
  pub fs_strategy: String,
  pub host_concurrency: usize,
}

/// Whole-run numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
  pub elapsed_ms: u64,
  pub bytes_written: u64,
  pub writes_per_sec: f64,
  pub bytes_per_sec: f64,
  /// Pieces whose registry entry received a checksum
  pub checksummed_pieces: usize,
}

/// Complete harness report in JSON format.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchReport {
  pub metadata: ReportMetadata,
  pub workload: WorkloadSpec,
  pub dispatch: DispatchSummary,
  pub totals: RunTotals,
  pub latency_classes: LatencyClassSummary,
  pub events: EventLog,
  pub metrics: BTreeMap<String, MetricRow>,
}

impl BenchReport {
  #[allow(clippy::too_many_arguments)]
  pub fn build(
    workload: WorkloadSpec,
    dispatch: DispatchSummary,
    telemetry: &WriteTelemetry,
    pieces: &BTreeMap<String, PieceEntry>,
    events: EventLog,
    elapsed_ms: u64,
    fs_strategy: &str,
    host_concurrency: usize,
  ) -> Self {
    let metrics = telemetry.metrics();
    let bytes_written: u64 = metrics.values().filter_map(|row| row.bytes).sum();
    let secs = elapsed_ms as f64 / 1000.0;
    let rate = |value: f64| if secs > 0.0 { value / secs } else { 0.0 };

    Self {
      metadata: ReportMetadata {
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        fs_strategy: fs_strategy.to_string(),
        host_concurrency,
      },
      totals: RunTotals {
        elapsed_ms,
        bytes_written,
        writes_per_sec: rate(dispatch.total_writes as f64),
        bytes_per_sec: rate(bytes_written as f64),
        checksummed_pieces: pieces.values().filter(|piece| piece.checksum.is_some()).count(),
      },
      latency_classes: telemetry.latency_summary(),
      workload,
      dispatch,
      events,
      metrics,
    }
  }

  /// Save report to a JSON file.
  pub async fn save(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
      tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(self)?;
    tokio::fs::write(path, json).await?;
    Ok(())
  }
}
