//! Filesystem write strategy, latency classes, micro-batching and tail-worker
//! selection.

use std::{cmp::Ordering, collections::VecDeque};

use artifact_core::{ArtifactWriteConfig, FsStrategyMode};
use serde::Serialize;

use crate::{
  lane::{Lane, LaneMap},
  queue::QueuedWrite,
};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Resolved filesystem strategy for one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsStrategy {
  /// Always `Ntfs` or `Generic` once resolved
  pub mode: FsStrategyMode,
  pub detected_ntfs: bool,
  pub micro_coalescing: bool,
  pub tail_worker: bool,
  pub micro_batch_max_count: usize,
  pub micro_batch_max_bytes: u64,
}

impl FsStrategy {
  /// Resolve for the current host platform.
  pub fn for_host(config: &ArtifactWriteConfig) -> Self {
    Self::resolve(config, cfg!(windows))
  }

  /// `auto` picks `ntfs` on Windows hosts and `generic` elsewhere; batch
  /// limits default per mode.
  pub fn resolve(config: &ArtifactWriteConfig, windows_host: bool) -> Self {
    let fs = &config.fs_strategy;
    let mode = match fs.mode {
      FsStrategyMode::Auto if windows_host => FsStrategyMode::Ntfs,
      FsStrategyMode::Auto => FsStrategyMode::Generic,
      explicit => explicit,
    };
    let ntfs = mode == FsStrategyMode::Ntfs;
    Self {
      mode,
      detected_ntfs: windows_host,
      micro_coalescing: fs.micro_coalesce,
      tail_worker: config.tail_worker.enabled,
      micro_batch_max_count: fs
        .micro_batch_max_count
        .map(|count| count.max(2))
        .unwrap_or(if ntfs { 12 } else { 8 }),
      micro_batch_max_bytes: fs
        .micro_batch_max_bytes
        .map(|bytes| bytes.max(16 * KIB))
        .unwrap_or(if ntfs { 512 * KIB } else { 256 * KIB }),
    }
  }

  pub fn mode_name(&self) -> &'static str {
    match self.mode {
      FsStrategyMode::Ntfs => "ntfs",
      FsStrategyMode::Generic => "generic",
      FsStrategyMode::Auto => "auto",
    }
  }
}

// ============================================================================
// Latency classes
// ============================================================================

const SIZE_CLASSES: [(u64, &str); 4] = [(64 * KIB, "micro"), (MIB, "small"), (16 * MIB, "medium"), (128 * MIB, "large")];
const SPEED_CLASSES: [(f64, &str); 4] = [(64.0, "instant"), (256.0, "fast"), (1000.0, "steady"), (4000.0, "slow")];

fn size_class(bytes: Option<u64>) -> &'static str {
  let Some(bytes) = bytes else {
    return "unknown";
  };
  SIZE_CLASSES
    .iter()
    .find(|(max, _)| bytes <= *max)
    .map(|(_, name)| *name)
    .unwrap_or("huge")
}

/// `{size}:{speed}` label for telemetry aggregation, e.g. `small:fast`.
///
/// Size uses the written bytes, falling back to the estimate. Speed uses queue
/// delay plus duration; a queue delay of 2s or more is always `tail`.
pub fn latency_class(queue_delay_ms: f64, duration_ms: f64, bytes: Option<u64>, estimated_bytes: Option<u64>) -> String {
  let queue_delay_ms = queue_delay_ms.max(0.0);
  let total_ms = queue_delay_ms + duration_ms.max(0.0);
  let size = size_class(bytes.or(estimated_bytes));
  if queue_delay_ms >= 2000.0 || total_ms > 4000.0 {
    return format!("{size}:tail");
  }
  let speed = SPEED_CLASSES
    .iter()
    .find(|(max, _)| total_ms <= *max)
    .map(|(_, name)| *name)
    .unwrap_or("tail");
  format!("{size}:{speed}")
}

// ============================================================================
// Micro-batching
// ============================================================================

/// Limits for one ultra-light micro-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroBatchLimits {
  pub max_entries: usize,
  pub max_bytes: u64,
  /// Entries above this size are never coalesced (floor 1KiB)
  pub max_entry_bytes: u64,
}

impl Default for MicroBatchLimits {
  fn default() -> Self {
    Self {
      max_entries: 8,
      max_bytes: 256 * KIB,
      max_entry_bytes: 64 * KIB,
    }
  }
}

/// Dequeued micro-batch.
#[derive(Debug, Default)]
pub struct MicroBatch {
  pub entries: Vec<QueuedWrite>,
  pub estimated_bytes: u64,
}

fn is_micro_coalescible(write: &QueuedWrite, max_entry_bytes: u64) -> bool {
  if write.is_prefetched() {
    return false;
  }
  write
    .estimated_bytes
    .is_some_and(|bytes| bytes > 0 && bytes <= max_entry_bytes.max(KIB))
}

/// Dequeue the head entry, then keep appending head entries while they are
/// coalescible and the count/byte budget allows. FIFO order is preserved.
pub fn select_micro_write_batch(queue: &mut VecDeque<QueuedWrite>, limits: MicroBatchLimits) -> MicroBatch {
  let Some(first) = queue.pop_front() else {
    return MicroBatch::default();
  };
  let max_entries = limits.max_entries.max(1);
  let max_entry_bytes = limits.max_entry_bytes.max(KIB);
  let first_bytes = first.estimated_bytes.unwrap_or(0);
  let single = max_entries <= 1
    || limits.max_bytes == 0
    || !is_micro_coalescible(&first, max_entry_bytes)
    || first_bytes > limits.max_bytes;

  let mut batch = MicroBatch {
    entries: vec![first],
    estimated_bytes: first_bytes,
  };
  if single {
    return batch;
  }

  while batch.entries.len() < max_entries {
    let Some(candidate) = queue.front() else {
      break;
    };
    if !is_micro_coalescible(candidate, max_entry_bytes) {
      break;
    }
    let estimated = candidate.estimated_bytes.unwrap_or(0);
    if estimated == 0 || batch.estimated_bytes + estimated > limits.max_bytes {
      break;
    }
    if let Some(next) = queue.pop_front() {
      batch.estimated_bytes += estimated;
      batch.entries.push(next);
    }
  }
  batch
}

// ============================================================================
// Tail worker
// ============================================================================

/// Ordering for tail-worker candidates: larger estimate first (known sizes
/// before unknown), then higher priority, lane rank, `seq` and label.
fn compare_tail_candidates(left: (Lane, &QueuedWrite), right: (Lane, &QueuedWrite)) -> Ordering {
  let (left_lane, left) = left;
  let (right_lane, right) = right;
  let by_size = match (left.estimated_bytes, right.estimated_bytes) {
    (Some(l), Some(r)) => r.cmp(&l),
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (None, None) => Ordering::Equal,
  };
  by_size
    .then(right.priority.cmp(&left.priority))
    .then(left_lane.tail_worker_rank().cmp(&right_lane.tail_worker_rank()))
    .then(left.seq.cmp(&right.seq))
    .then_with(|| left.label.cmp(&right.label))
}

/// Remove and return the single costliest pending write across all lanes.
pub fn select_tail_worker_entry(queues: &mut LaneMap<VecDeque<QueuedWrite>>) -> Option<(Lane, QueuedWrite)> {
  let mut best: Option<(Lane, usize)> = None;
  for lane in Lane::TAIL_WORKER_ORDER {
    for (index, candidate) in queues.get(lane).iter().enumerate() {
      let better = match best {
        None => true,
        Some((best_lane, best_index)) => {
          let current = &queues.get(best_lane)[best_index];
          compare_tail_candidates((lane, candidate), (best_lane, current)) == Ordering::Less
        }
      };
      if better {
        best = Some((lane, index));
      }
    }
  }
  let (lane, index) = best?;
  queues.get_mut(lane).remove(index).map(|write| (lane, write))
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::queue::{WriteRequest, WriteResult};

  fn write(label: &str, bytes: Option<u64>, priority: i64) -> QueuedWrite {
    let mut request = WriteRequest::new(label, || async { Ok(WriteResult::default()) }).with_priority(priority);
    if let Some(bytes) = bytes {
      request = request.with_estimated_bytes(bytes);
    }
    QueuedWrite::new(request)
  }

  fn labels(writes: &[QueuedWrite]) -> Vec<&str> {
    writes.iter().map(|w| w.label.as_str()).collect()
  }

  #[test]
  fn test_fs_strategy_auto_resolution() {
    let config = ArtifactWriteConfig::default();
    let windows = FsStrategy::resolve(&config, true);
    assert_eq!(windows.mode, FsStrategyMode::Ntfs);
    assert_eq!(windows.micro_batch_max_count, 12);
    assert_eq!(windows.micro_batch_max_bytes, 512 * KIB);

    let linux = FsStrategy::resolve(&config, false);
    assert_eq!(linux.mode, FsStrategyMode::Generic);
    assert_eq!(linux.micro_batch_max_count, 8);
    assert_eq!(linux.micro_batch_max_bytes, 256 * KIB);
    assert_eq!(linux.mode_name(), "generic");
  }

  #[test]
  fn test_fs_strategy_explicit_limits_floored() {
    let mut config = ArtifactWriteConfig::default();
    config.fs_strategy.mode = FsStrategyMode::Ntfs;
    config.fs_strategy.micro_batch_max_count = Some(1);
    config.fs_strategy.micro_batch_max_bytes = Some(10);
    config.tail_worker.enabled = false;
    let strategy = FsStrategy::resolve(&config, false);
    assert_eq!(strategy.mode, FsStrategyMode::Ntfs);
    assert!(!strategy.detected_ntfs);
    assert_eq!(strategy.micro_batch_max_count, 2);
    assert_eq!(strategy.micro_batch_max_bytes, 16 * KIB);
    assert!(!strategy.tail_worker);
  }

  #[test]
  fn test_latency_classes() {
    assert_eq!(latency_class(10.0, 20.0, Some(100), None), "micro:instant");
    assert_eq!(latency_class(0.0, 200.0, None, Some(2 * MIB)), "medium:fast");
    assert_eq!(latency_class(0.0, 900.0, Some(MIB), None), "small:steady");
    assert_eq!(latency_class(0.0, 3000.0, Some(200 * MIB), None), "huge:slow");
    assert_eq!(latency_class(2000.0, 0.0, None, None), "unknown:tail");
    assert_eq!(latency_class(100.0, 4000.0, Some(20 * MIB), None), "large:tail");
  }

  #[test]
  fn test_micro_batch_respects_byte_budget() {
    let mut queue: VecDeque<QueuedWrite> = [
      write("a.json", Some(8 * KIB), 0),
      write("b.json", Some(10 * KIB), 0),
      write("c.json", Some(96 * KIB), 0),
    ]
    .into_iter()
    .collect();
    let batch = select_micro_write_batch(
      &mut queue,
      MicroBatchLimits {
        max_entries: 8,
        max_bytes: 40 * KIB,
        max_entry_bytes: 32 * KIB,
      },
    );
    assert_eq!(labels(&batch.entries), vec!["a.json", "b.json"]);
    assert_eq!(batch.estimated_bytes, 18 * KIB);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].label, "c.json");
  }

  #[test]
  fn test_micro_batch_respects_count_and_stops_at_gap() {
    let mut queue: VecDeque<QueuedWrite> = [
      write("a", Some(100), 0),
      write("b", Some(100), 0),
      write("c", None, 0),
      write("d", Some(100), 0),
    ]
    .into_iter()
    .collect();
    let limits = MicroBatchLimits {
      max_entries: 2,
      ..Default::default()
    };
    assert_eq!(labels(&select_micro_write_batch(&mut queue, limits).entries), vec!["a", "b"]);
    // Unknown size is never coalesced, and a non-coalescible head runs alone
    assert_eq!(labels(&select_micro_write_batch(&mut queue, limits).entries), vec!["c"]);
    assert_eq!(labels(&select_micro_write_batch(&mut queue, limits).entries), vec!["d"]);
    assert!(select_micro_write_batch(&mut queue, limits).entries.is_empty());
  }

  #[test]
  fn test_tail_worker_prefers_largest_known_size() {
    let mut queues: LaneMap<VecDeque<QueuedWrite>> = LaneMap::default();
    queues.light.push_back(write("unknown", None, 100));
    queues.heavy.push_back(write("mid", Some(20 * MIB), 0));
    queues.ultra_light.push_back(write("tiny", Some(10), 50));
    queues.heavy.push_back(write("big", Some(40 * MIB), 0));

    let (lane, picked) = select_tail_worker_entry(&mut queues).unwrap();
    assert_eq!((lane, picked.label.as_str()), (Lane::Heavy, "big"));
    let (_, picked) = select_tail_worker_entry(&mut queues).unwrap();
    assert_eq!(picked.label, "mid");
    let (_, picked) = select_tail_worker_entry(&mut queues).unwrap();
    assert_eq!(picked.label, "tiny");
    let (lane, picked) = select_tail_worker_entry(&mut queues).unwrap();
    assert_eq!((lane, picked.label.as_str()), (Lane::Light, "unknown"));
    assert!(select_tail_worker_entry(&mut queues).is_none());
  }

  #[test]
  fn test_tail_worker_ties_break_on_priority_then_lane() {
    let mut queues: LaneMap<VecDeque<QueuedWrite>> = LaneMap::default();
    queues.light.push_back(write("light", Some(MIB), 0));
    queues.massive.push_back(write("massive", Some(MIB), 0));
    queues.ultra_light.push_back(write("urgent", Some(MIB), 5));

    let (_, picked) = select_tail_worker_entry(&mut queues).unwrap();
    assert_eq!(picked.label, "urgent");
    let (lane, _) = select_tail_worker_entry(&mut queues).unwrap();
    assert_eq!(lane, Lane::Massive);
  }
}
