//! Per-lane dispatch budgets, lane selection and dequeue.

use std::collections::VecDeque;

use artifact_core::WorkClassOverrides;
use serde::Serialize;

use crate::{
  lane::{Lane, LaneMap},
  queue::QueuedWrite,
  sizing::{WorkClassBudget, resolve_work_class_concurrency},
  strategy::{FsStrategy, MicroBatchLimits, select_micro_write_batch},
};

/// Budgets for one dispatch step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneBudgets {
  pub lanes: LaneMap<usize>,
  pub work_class: WorkClassBudget,
}

/// Turn the current ceiling into per-lane budgets.
///
/// Demand per lane is `queued + active`. The `small` class budget goes to
/// ultra-light first (up to 2 reserved slots), then light; leftover slots are
/// borrowed by light first, then ultra-light.
pub fn resolve_dispatch_lane_budgets(
  queued: &LaneMap<usize>,
  active: &LaneMap<usize>,
  write_concurrency: usize,
  overrides: &WorkClassOverrides,
  host_concurrency: usize,
) -> LaneBudgets {
  let demand = queued.map(|lane, count| count + active.get(lane));
  let work_class = resolve_work_class_concurrency(
    write_concurrency,
    demand.ultra_light + demand.light,
    demand.heavy,
    demand.massive,
    overrides,
    host_concurrency,
  );

  let small = work_class.small;
  let mut ultra_light = 0;
  let mut light = 0;
  if small > 0 {
    if demand.ultra_light > 0 {
      ultra_light = demand.ultra_light.min(small.clamp(1, 2));
    }
    light = demand.light.min(small.saturating_sub(ultra_light));
    let mut spare = small.saturating_sub(ultra_light + light);
    if spare > 0 && demand.light > light {
      let grow = spare.min(demand.light - light);
      light += grow;
      spare -= grow;
    }
    if spare > 0 && demand.ultra_light > ultra_light {
      ultra_light += spare.min(demand.ultra_light - ultra_light);
    }
  }

  LaneBudgets {
    lanes: LaneMap {
      ultra_light,
      light,
      heavy: work_class.medium,
      massive: work_class.large,
    },
    work_class,
  }
}

/// First lane in strict priority order (`ultraLight > massive > heavy >
/// light`) that has queued work and a free budget slot.
pub fn pick_dispatch_lane(queued: &LaneMap<usize>, active: &LaneMap<usize>, budgets: &LaneBudgets) -> Option<Lane> {
  Lane::DISPATCH_ORDER
    .into_iter()
    .find(|lane| *queued.get(*lane) > 0 && *active.get(*lane) < *budgets.lanes.get(*lane))
}

/// Dequeue one dispatch unit: a single entry, or a micro-batch for the
/// ultra-light lane when coalescing is enabled.
pub fn take_lane_dispatch_entries(
  queues: &mut LaneMap<VecDeque<QueuedWrite>>,
  lane: Lane,
  strategy: &FsStrategy,
  ultra_light_threshold_bytes: u64,
) -> Vec<QueuedWrite> {
  let queue = queues.get_mut(lane);
  if lane == Lane::UltraLight && strategy.micro_coalescing {
    let limits = MicroBatchLimits {
      max_entries: strategy.micro_batch_max_count,
      max_bytes: strategy.micro_batch_max_bytes,
      max_entry_bytes: ultra_light_threshold_bytes,
    };
    return select_micro_write_batch(queue, limits).entries;
  }
  queue.pop_front().into_iter().collect()
}

#[cfg(test)]
mod tests {
  use artifact_core::ArtifactWriteConfig;
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::queue::{WriteRequest, WriteResult};

  fn lanes(ultra_light: usize, light: usize, heavy: usize, massive: usize) -> LaneMap<usize> {
    LaneMap {
      ultra_light,
      light,
      heavy,
      massive,
    }
  }

  #[test]
  fn test_small_budget_reserves_ultra_light_first() {
    let budgets = resolve_dispatch_lane_budgets(&lanes(5, 5, 0, 0), &LaneMap::default(), 4, &Default::default(), 8);
    assert_eq!(budgets.work_class.small, 4);
    assert_eq!(budgets.lanes.ultra_light, 2);
    assert_eq!(budgets.lanes.light, 2);
  }

  #[test]
  fn test_light_borrows_before_ultra_light() {
    // One ultra-light write; light absorbs the rest of the small budget
    let budgets = resolve_dispatch_lane_budgets(&lanes(1, 10, 0, 0), &LaneMap::default(), 6, &Default::default(), 8);
    assert_eq!(budgets.lanes, lanes(1, 5, 0, 0));

    // Light exhausted; ultra-light borrows the spare slots
    let budgets = resolve_dispatch_lane_budgets(&lanes(10, 1, 0, 0), &LaneMap::default(), 6, &Default::default(), 8);
    assert_eq!(budgets.lanes, lanes(5, 1, 0, 0));
  }

  #[test]
  fn test_active_counts_contribute_to_demand() {
    let budgets = resolve_dispatch_lane_budgets(&lanes(0, 0, 1, 0), &lanes(0, 0, 3, 0), 8, &Default::default(), 8);
    assert_eq!(budgets.lanes.heavy, 4);
  }

  #[test]
  fn test_budgets_never_exceed_ceiling() {
    let overrides = ArtifactWriteConfig {
      small_concurrency: Some(3),
      large_concurrency: Some(5),
      ..Default::default()
    }
    .work_class_overrides();
    for ceiling in 1..=16 {
      for queued in [lanes(0, 0, 0, 1), lanes(3, 3, 3, 3), lanes(20, 0, 9, 2), lanes(1, 40, 0, 0), lanes(0, 7, 7, 7)] {
        for active in [LaneMap::default(), lanes(1, 0, 1, 0)] {
          for with_overrides in [false, true] {
            let overrides = if with_overrides { overrides } else { Default::default() };
            let budgets = resolve_dispatch_lane_budgets(&queued, &active, ceiling, &overrides, 8);
            assert!(
              budgets.lanes.total() <= ceiling,
              "ceiling={ceiling} queued={queued:?} budgets={budgets:?}"
            );
          }
        }
      }
    }
  }

  #[test]
  fn test_pick_lane_strict_priority() {
    let queued = lanes(1, 1, 1, 1);
    let budgets = LaneBudgets {
      lanes: lanes(1, 1, 1, 1),
      work_class: WorkClassBudget::default(),
    };
    assert_eq!(pick_dispatch_lane(&queued, &LaneMap::default(), &budgets), Some(Lane::UltraLight));
    assert_eq!(pick_dispatch_lane(&queued, &lanes(1, 0, 0, 0), &budgets), Some(Lane::Massive));
    assert_eq!(pick_dispatch_lane(&queued, &lanes(1, 0, 0, 1), &budgets), Some(Lane::Heavy));
    assert_eq!(pick_dispatch_lane(&queued, &lanes(1, 0, 1, 1), &budgets), Some(Lane::Light));
    assert_eq!(pick_dispatch_lane(&queued, &lanes(1, 1, 1, 1), &budgets), None);
    assert_eq!(pick_dispatch_lane(&LaneMap::default(), &LaneMap::default(), &budgets), None);
  }

  #[test]
  fn test_take_entries_micro_batches_ultra_light_only() {
    let strategy = FsStrategy::resolve(&ArtifactWriteConfig::default(), false);
    let mut queues: LaneMap<VecDeque<QueuedWrite>> = LaneMap::default();
    for i in 0..3 {
      let request = WriteRequest::new(format!("u{i}"), || async { Ok(WriteResult::default()) }).with_estimated_bytes(1024);
      queues.ultra_light.push_back(QueuedWrite::new(request));
      let request = WriteRequest::new(format!("l{i}"), || async { Ok(WriteResult::default()) }).with_estimated_bytes(1024);
      queues.light.push_back(QueuedWrite::new(request));
    }

    let batch = take_lane_dispatch_entries(&mut queues, Lane::UltraLight, &strategy, 64 * 1024);
    assert_eq!(batch.len(), 3);
    let single = take_lane_dispatch_entries(&mut queues, Lane::Light, &strategy, 64 * 1024);
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].label, "l0");

    let no_coalesce = FsStrategy {
      micro_coalescing: false,
      ..strategy
    };
    assert_eq!(take_lane_dispatch_entries(&mut queues, Lane::Light, &no_coalesce, 64 * 1024).len(), 1);
    assert!(take_lane_dispatch_entries(&mut queues, Lane::Heavy, &no_coalesce, 64 * 1024).is_empty());
  }
}
