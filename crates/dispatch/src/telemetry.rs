//! Per-label write metrics and queue-delay histograms.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::lane::Lane;

/// Upper bounds (inclusive, milliseconds) of the queue-delay buckets.
pub const QUEUE_DELAY_BUCKETS_MS: [u64; 17] = [
  0, 1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1000, 2000, 5000, 10000, 30000, 60000,
];

// ============================================================================
// Histogram
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBucket {
  pub le_ms: u64,
  pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDelayHistogram {
  pub sample_count: usize,
  pub min_ms: Option<u64>,
  pub max_ms: Option<u64>,
  pub p50_ms: Option<u64>,
  pub p95_ms: Option<u64>,
  /// Non-empty buckets only
  pub buckets: Vec<HistogramBucket>,
  /// Samples above the last bucket bound
  pub overflow_count: u64,
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], rank: f64) -> Option<u64> {
  if sorted.is_empty() {
    return None;
  }
  let n = sorted.len();
  let index = ((rank * n as f64).ceil() as usize).saturating_sub(1).min(n - 1);
  Some(sorted[index])
}

pub fn summarize_queue_delay_histogram(samples: &[u64]) -> QueueDelayHistogram {
  let mut counts = [0u64; QUEUE_DELAY_BUCKETS_MS.len()];
  let mut overflow_count = 0;
  for sample in samples {
    match QUEUE_DELAY_BUCKETS_MS.iter().position(|bound| sample <= bound) {
      Some(index) => counts[index] += 1,
      None => overflow_count += 1,
    }
  }
  let mut sorted = samples.to_vec();
  sorted.sort_unstable();

  QueueDelayHistogram {
    sample_count: samples.len(),
    min_ms: sorted.first().copied(),
    max_ms: sorted.last().copied(),
    p50_ms: percentile(&sorted, 0.5),
    p95_ms: percentile(&sorted, 0.95),
    buckets: QUEUE_DELAY_BUCKETS_MS
      .iter()
      .zip(counts)
      .filter(|(_, count)| *count > 0)
      .map(|(le_ms, count)| HistogramBucket { le_ms: *le_ms, count })
      .collect(),
    overflow_count,
  }
}

// ============================================================================
// Metric rows
// ============================================================================

/// Accumulated metrics for one label. Fields are merged, never replaced
/// wholesale; `None` in an update leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricRow {
  pub queue_delay_ms: Option<f64>,
  pub duration_ms: Option<f64>,
  pub bytes: Option<u64>,
  pub estimated_bytes: Option<u64>,
  pub throughput_bytes_per_sec: Option<f64>,
  pub serialization_ms: Option<f64>,
  pub disk_ms: Option<f64>,
  pub direct_fd_streaming: Option<bool>,
  pub tail_rescue_boosted: Option<bool>,
  pub tail_worker: Option<bool>,
  pub batch_size: Option<usize>,
  pub batch_index: Option<usize>,
  pub latency_class: Option<String>,
  pub fs_strategy_mode: Option<String>,
  pub checksum: Option<String>,
  pub checksum_algo: Option<String>,
  pub lane: Option<Lane>,
  pub scheduler_io_tokens: Option<u32>,
  pub scheduler_mem_tokens: Option<u32>,
  pub write_concurrency_at_start: Option<usize>,
  pub queue_delay_histogram: Option<QueueDelayHistogram>,
  pub queue_delay_p50_ms: Option<u64>,
  pub queue_delay_p95_ms: Option<u64>,
}

impl MetricRow {
  pub fn merge(&mut self, update: MetricRow) {
    macro_rules! merge_fields {
      ($($field:ident),* $(,)?) => {
        $(if update.$field.is_some() { self.$field = update.$field; })*
      };
    }
    merge_fields!(
      queue_delay_ms,
      duration_ms,
      bytes,
      estimated_bytes,
      throughput_bytes_per_sec,
      serialization_ms,
      disk_ms,
      direct_fd_streaming,
      tail_rescue_boosted,
      tail_worker,
      batch_size,
      batch_index,
      latency_class,
      fs_strategy_mode,
      checksum,
      checksum_algo,
      lane,
      scheduler_io_tokens,
      scheduler_mem_tokens,
      write_concurrency_at_start,
      queue_delay_histogram,
      queue_delay_p50_ms,
      queue_delay_p95_ms,
    );
  }
}

/// `{class -> count}` plus a total, for one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyClassSummary {
  pub total: usize,
  pub classes: BTreeMap<String, usize>,
}

pub fn summarize_latency_classes<'a>(classes: impl IntoIterator<Item = &'a str>) -> LatencyClassSummary {
  let mut summary = LatencyClassSummary::default();
  for class in classes {
    *summary.classes.entry(class.to_string()).or_default() += 1;
    summary.total += 1;
  }
  summary
}

/// Metric rows and queue-delay samples keyed by label.
#[derive(Debug, Default)]
pub struct WriteTelemetry {
  rows: DashMap<String, MetricRow>,
  queue_delays: DashMap<String, Vec<u64>>,
}

impl WriteTelemetry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Merge `update` into the label's row. A queue delay in the update is
  /// also added to the label's samples and the histogram recomputed.
  pub fn record_metric_row(&self, label: &str, mut update: MetricRow) {
    if let Some(delay) = update.queue_delay_ms.filter(|delay| delay.is_finite()) {
      let mut samples = self.queue_delays.entry(label.to_string()).or_default();
      samples.push(delay.max(0.0).round() as u64);
      let histogram = summarize_queue_delay_histogram(&samples);
      update.queue_delay_p50_ms = histogram.p50_ms;
      update.queue_delay_p95_ms = histogram.p95_ms;
      update.queue_delay_histogram = Some(histogram);
    }
    self.rows.entry(label.to_string()).or_default().merge(update);
  }

  pub fn metric(&self, label: &str) -> Option<MetricRow> {
    self.rows.get(label).map(|row| row.clone())
  }

  /// All rows, sorted by label.
  pub fn metrics(&self) -> BTreeMap<String, MetricRow> {
    self
      .rows
      .iter()
      .map(|entry| (entry.key().clone(), entry.value().clone()))
      .collect()
  }

  pub fn latency_summary(&self) -> LatencyClassSummary {
    let classes: Vec<String> = self
      .rows
      .iter()
      .filter_map(|entry| entry.value().latency_class.clone())
      .collect();
    summarize_latency_classes(classes.iter().map(String::as_str))
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }
}
