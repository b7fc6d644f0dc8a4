//! Write-concurrency sizing.
//!
//! Derives the total write-concurrency cap for a drain and splits it into
//! per-lane and per-work-class budgets from the current backlog.
//!
//! All resolvers are pure: the same counts always produce the same budgets, so
//! the drain loop can call them on every dispatch step.

use artifact_core::WorkClassOverrides;
use serde::Serialize;

use crate::lane::LaneMap;

/// Default cap for normal write volumes.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 16;
/// Default cap once a drain has at least [`LARGE_DRAIN_WRITES`] writes.
pub const LARGE_DRAIN_WRITE_CONCURRENCY: usize = 48;
pub const LARGE_DRAIN_WRITES: usize = 64;

/// Host parallelism, never below 1.
pub fn host_parallelism() -> usize {
  num_cpus::get().max(1)
}

// ============================================================================
// Total cap
// ============================================================================

/// Resolved total write-concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteConcurrencyCap {
  pub cap: usize,
  /// True when the cap came from an explicit config override
  pub overridden: bool,
}

/// Resolve the total cap. An explicit (already validated) override always
/// wins; otherwise a tiered default is clamped to host parallelism.
pub fn resolve_write_concurrency(
  override_value: Option<usize>,
  total_writes: usize,
  host_concurrency: usize,
) -> WriteConcurrencyCap {
  if let Some(value) = override_value {
    return WriteConcurrencyCap {
      cap: value.max(1),
      overridden: true,
    };
  }
  let tier = if total_writes >= LARGE_DRAIN_WRITES {
    LARGE_DRAIN_WRITE_CONCURRENCY
  } else {
    DEFAULT_WRITE_CONCURRENCY
  };
  WriteConcurrencyCap {
    cap: tier.min(host_concurrency.max(1)),
    overridden: false,
  }
}

/// Concurrency for a drain: never more than the number of writes, never zero.
pub fn effective_write_concurrency(total_writes: usize, cap: usize) -> usize {
  total_writes.min(cap).max(1)
}

/// Positive value, or `fallback` (at least 1) when missing or zero.
pub fn clamp_write_concurrency(value: Option<usize>, fallback: usize) -> usize {
  match value {
    Some(value) if value > 0 => value,
    _ => fallback.max(1),
  }
}

fn ceil_ratio(total: usize, ratio: f64) -> usize {
  (total as f64 * ratio).ceil() as usize
}

// ============================================================================
// Lane splits
// ============================================================================

/// Heavy/light split of a concurrency budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneSplit {
  pub heavy: usize,
  pub light: usize,
}

/// Split `write_concurrency` between the heavy and light lanes.
///
/// Heavy targets an explicit override, else 66% of the total when the heavy
/// backlog and the host are both large, else half. Light keeps a reserve
/// (20% with a floor of 2 when the backlog is heavy-skewed, 33% with a floor
/// of 1 otherwise) capped at `total - 1`.
pub fn resolve_lane_concurrency(
  write_concurrency: usize,
  light_writes: usize,
  heavy_writes: usize,
  heavy_override: Option<usize>,
  host_concurrency: usize,
) -> LaneSplit {
  let total = write_concurrency.max(1);
  let host = host_concurrency.max(1);
  let dynamic_heavy_target = match heavy_override.filter(|value| *value > 0) {
    Some(value) => value,
    None if heavy_writes >= 8 && host >= 8 => ceil_ratio(total, 0.66).max(1),
    None => total.div_ceil(2).max(1),
  };

  match (heavy_writes > 0, light_writes > 0) {
    (false, false) => return LaneSplit::default(),
    (false, true) => {
      return LaneSplit {
        heavy: 0,
        light: total.min(light_writes),
      };
    }
    // Heavy-only queues take the whole budget; memory is bounded by scheduler tokens
    (true, false) => {
      return LaneSplit {
        heavy: total.min(heavy_writes),
        light: 0,
      };
    }
    (true, true) => {}
  }

  let heavy_skewed = heavy_writes >= (light_writes * 2).max(4);
  let (reserve_ratio, reserve_floor) = if heavy_skewed { (0.2, 2) } else { (0.33, 1) };
  let reserve_cap = total.saturating_sub(1);
  let light_reserve = if reserve_cap > 0 {
    reserve_floor
      .min(reserve_cap)
      .max(light_writes.min(reserve_cap).min(ceil_ratio(total, reserve_ratio)))
  } else {
    0
  };

  let max_heavy_budget = total.saturating_sub(light_reserve).max(1);
  let mut heavy = heavy_writes.min(dynamic_heavy_target).min(max_heavy_budget).max(1);
  let mut light_budget = total.saturating_sub(heavy);
  let minimum_light = light_writes.min(light_reserve);
  if light_budget < minimum_light && heavy > 1 {
    let shift = (minimum_light - light_budget).min(heavy - 1);
    heavy -= shift;
    light_budget += shift;
  }

  LaneSplit {
    heavy,
    light: light_writes.min(light_budget),
  }
}

/// Reserve 1-2 slots for ultra-light writes, then split the rest heavy/light.
pub fn resolve_lane_concurrency_with_ultra_light(
  write_concurrency: usize,
  counts: &LaneMap<usize>,
  heavy_override: Option<usize>,
  host_concurrency: usize,
) -> LaneMap<usize> {
  let total = write_concurrency.max(1);
  let (ultra, light, heavy) = (counts.ultra_light, counts.light, counts.heavy);
  if ultra == 0 && light == 0 && heavy == 0 {
    return LaneMap::default();
  }
  if light == 0 && heavy == 0 {
    return LaneMap {
      ultra_light: total.min(ultra),
      ..Default::default()
    };
  }

  let mut ultra_budget = if ultra > 0 {
    let target = ceil_ratio(total, 0.25).clamp(1, 2);
    ultra.min(target).min(total.saturating_sub(1)).max(1)
  } else {
    0
  };
  let remaining = total.saturating_sub(ultra_budget);
  if remaining == 0 {
    return LaneMap {
      ultra_light: ultra_budget,
      ..Default::default()
    };
  }

  let base = resolve_lane_concurrency(remaining, light, heavy, heavy_override, host_concurrency);
  if base.light == 0 && base.heavy == 0 && ultra > 0 {
    ultra_budget = total.min(ultra);
  }
  LaneMap {
    ultra_light: ultra_budget,
    light: base.light,
    heavy: base.heavy,
    massive: 0,
  }
}

/// Reserve slots for ultra-light (~25%, 1-2 slots) and massive (~33%, 1-2
/// slots) writes before the heavy/light split runs on the remainder.
///
/// Each reservation is forced to at least one slot while competing regular
/// work exists, but never takes the last slot from that work.
pub fn resolve_lane_concurrency_with_massive(
  write_concurrency: usize,
  counts: &LaneMap<usize>,
  heavy_override: Option<usize>,
  host_concurrency: usize,
) -> LaneMap<usize> {
  let total = write_concurrency.max(1);
  let LaneMap {
    ultra_light: ultra,
    light,
    heavy,
    massive,
  } = *counts;
  if ultra == 0 && massive == 0 && light == 0 && heavy == 0 {
    return LaneMap::default();
  }
  if massive == 0 && light == 0 && heavy == 0 {
    return LaneMap {
      ultra_light: total.min(ultra),
      ..Default::default()
    };
  }
  if ultra == 0 && light == 0 && heavy == 0 {
    return LaneMap {
      massive: total.min(massive),
      ..Default::default()
    };
  }

  let non_ultra = massive + light + heavy;
  let ultra_budget = if ultra > 0 {
    let target = ceil_ratio(total, 0.25).clamp(1, 2);
    let max_reserve = total.saturating_sub(usize::from(non_ultra > 0));
    ultra.min(target).min(max_reserve).max(1)
  } else {
    0
  };

  let regular = light + heavy;
  let remaining_after_ultra = total.saturating_sub(ultra_budget);
  if regular == 0 {
    return LaneMap {
      ultra_light: ultra_budget,
      massive: massive.min(remaining_after_ultra),
      ..Default::default()
    };
  }

  let mut massive_budget = if massive > 0 {
    let target = ceil_ratio(total, 0.33).clamp(1, 2);
    massive.min(target).min(remaining_after_ultra.saturating_sub(1))
  } else {
    0
  };
  if massive > 0 && massive_budget < 1 && remaining_after_ultra > 0 {
    massive_budget = 1;
  }

  let remaining = total.saturating_sub(ultra_budget + massive_budget);
  if remaining == 0 {
    return LaneMap {
      ultra_light: ultra_budget,
      massive: massive_budget,
      ..Default::default()
    };
  }

  let base = resolve_lane_concurrency(remaining, light, heavy, heavy_override, host_concurrency);
  LaneMap {
    ultra_light: ultra_budget,
    light: base.light,
    heavy: base.heavy,
    massive: massive_budget,
  }
}

// ============================================================================
// Work classes
// ============================================================================

/// Budget per work class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkClassBudget {
  pub small: usize,
  pub medium: usize,
  pub large: usize,
}

impl WorkClassBudget {
  pub fn total(&self) -> usize {
    self.small + self.medium + self.large
  }
}

/// Resolve independent `small` / `medium` / `large` budgets.
///
/// Seeds from the massive-aware lane resolver, applies explicit overrides,
/// then rebalances: overflow is shed small -> medium -> large and spare
/// capacity is granted large -> medium -> small, each class bounded by its own
/// pending count. The result sums to `write_concurrency` whenever the pending
/// counts can absorb it.
pub fn resolve_work_class_concurrency(
  write_concurrency: usize,
  small_writes: usize,
  medium_writes: usize,
  large_writes: usize,
  overrides: &WorkClassOverrides,
  host_concurrency: usize,
) -> WorkClassBudget {
  let total = write_concurrency.max(1);
  if small_writes == 0 && medium_writes == 0 && large_writes == 0 {
    return WorkClassBudget::default();
  }

  let seeded = resolve_lane_concurrency_with_massive(
    total,
    &LaneMap {
      ultra_light: 0,
      light: small_writes,
      heavy: medium_writes,
      massive: large_writes,
    },
    None,
    host_concurrency,
  );
  let positive = |value: Option<usize>| value.filter(|v| *v > 0);

  let mut budget = WorkClassBudget {
    small: positive(overrides.small).unwrap_or(seeded.light).min(small_writes),
    medium: positive(overrides.medium).unwrap_or(seeded.heavy).min(medium_writes),
    large: positive(overrides.large).unwrap_or(seeded.massive).min(large_writes),
  };

  let assigned = budget.total();
  if assigned > total {
    let mut overflow = assigned - total;
    for slot in [&mut budget.small, &mut budget.medium, &mut budget.large] {
      if overflow == 0 {
        break;
      }
      let shift = overflow.min(*slot);
      *slot -= shift;
      overflow -= shift;
    }
  }

  let assigned = budget.total();
  if assigned < total {
    let mut spare = total - assigned;
    let classes = [
      (&mut budget.large, large_writes),
      (&mut budget.medium, medium_writes),
      (&mut budget.small, small_writes),
    ];
    for (slot, pending) in classes {
      if spare == 0 {
        break;
      }
      let grow = spare.min(pending.saturating_sub(*slot));
      *slot += grow;
      spare -= grow;
    }
  }

  budget
}
