//! Lane planner: scheduling weight, ordering and lane classification.

use std::{collections::VecDeque, sync::LazyLock};

use artifact_core::{ConfigError, LanePatterns, LanesConfig};
use regex::RegexSet;

use crate::{
  lane::{Lane, LaneMap},
  queue::QueuedWrite,
};

/// Weight boost for outputs that index validation depends on.
pub const VALIDATION_CRITICAL_BOOST: f64 = 500.0;

static VALIDATION_CRITICAL_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
  RegexSet::new([
    r"(^|/)index_state\.json$",
    r"(^|/)metrics\.json$",
    r"(^|/)chunk_meta(?:\.|$)",
    r"(^|/)file_meta(?:\.|$)",
    r"(^|/)token_postings(?:\.|$)",
    r"(^|/)field_postings(?:\.|$)",
    r"(^|/)pieces/manifest\.json$",
  ])
  .unwrap_or_else(|_| RegexSet::empty())
});

/// True for state, metrics, manifest and postings outputs.
pub fn is_validation_critical(label: &str) -> bool {
  VALIDATION_CRITICAL_PATTERNS.is_match(label)
}

/// Scheduling weight: `priority`, plus the validation-critical boost, plus
/// `log2(bytes + 1)` once the weight is already positive. Writes without an
/// explicit priority keep FIFO order.
pub fn write_weight(priority: i64, label: &str, estimated_bytes: Option<u64>) -> f64 {
  let mut weight = priority as f64;
  if is_validation_critical(label) {
    weight += VALIDATION_CRITICAL_BOOST;
  }
  if weight > 0.0
    && let Some(bytes) = estimated_bytes.filter(|bytes| *bytes > 0)
  {
    weight += (bytes as f64 + 1.0).log2();
  }
  weight
}

/// Sort writes by descending weight, ties broken by ascending `seq`.
pub fn schedule_writes(mut writes: Vec<QueuedWrite>) -> Vec<QueuedWrite> {
  writes.sort_by(|a, b| {
    let a_weight = write_weight(a.priority, &a.label, a.estimated_bytes);
    let b_weight = write_weight(b.priority, &b.label, b.estimated_bytes);
    b_weight.total_cmp(&a_weight).then(a.seq.cmp(&b.seq))
  });
  writes
}

/// Classifies writes into lanes by size thresholds and forced label patterns.
#[derive(Debug, Clone)]
pub struct LanePlanner {
  heavy_threshold_bytes: u64,
  ultra_light_threshold_bytes: u64,
  massive_threshold_bytes: u64,
  heavy: RegexSet,
  ultra_light: RegexSet,
  massive: RegexSet,
}

impl LanePlanner {
  pub fn from_config(config: &LanesConfig) -> Result<Self, ConfigError> {
    let LanePatterns {
      heavy,
      ultra_light,
      massive,
    } = config.compile_patterns()?;
    let to_set = |patterns: Vec<regex::Regex>| RegexSet::new(patterns.iter().map(|re| re.as_str()));
    Ok(Self {
      heavy_threshold_bytes: config.heavy_threshold_bytes(),
      ultra_light_threshold_bytes: config.ultra_light_threshold_bytes(),
      massive_threshold_bytes: config.massive_threshold_bytes(),
      heavy: to_set(heavy).map_err(|source| pattern_error("heavy", source))?,
      ultra_light: to_set(ultra_light).map_err(|source| pattern_error("ultra-light", source))?,
      massive: to_set(massive).map_err(|source| pattern_error("massive", source))?,
    })
  }

  pub fn ultra_light_threshold_bytes(&self) -> u64 {
    self.ultra_light_threshold_bytes
  }

  /// Lane for one write. Most specific wins: massive > heavy > ultraLight >
  /// light. A lane hint acts as a forced match for its lane, so it can never
  /// pull a size-forced heavy or massive write into a lighter lane.
  pub fn classify(&self, label: &str, estimated_bytes: Option<u64>, lane_hint: Option<Lane>) -> Lane {
    let forced = |lane: Lane, patterns: &RegexSet| lane_hint == Some(lane) || patterns.is_match(label);
    let at_least = |threshold: u64| estimated_bytes.is_some_and(|bytes| bytes >= threshold);

    if forced(Lane::Massive, &self.massive) || at_least(self.massive_threshold_bytes) {
      return Lane::Massive;
    }
    if forced(Lane::Heavy, &self.heavy) || at_least(self.heavy_threshold_bytes) {
      return Lane::Heavy;
    }
    if lane_hint == Some(Lane::Light) {
      return Lane::Light;
    }
    let ultra_light_by_size = estimated_bytes.is_some_and(|bytes| bytes > 0 && bytes <= self.ultra_light_threshold_bytes);
    if forced(Lane::UltraLight, &self.ultra_light) || ultra_light_by_size {
      return Lane::UltraLight;
    }
    Lane::Light
  }

  /// Order writes by weight then `seq`, and partition them into lane queues.
  pub fn split_lanes(&self, writes: Vec<QueuedWrite>) -> LaneMap<VecDeque<QueuedWrite>> {
    let mut lanes: LaneMap<VecDeque<QueuedWrite>> = LaneMap::default();
    for write in schedule_writes(writes) {
      let lane = self.classify(&write.label, write.estimated_bytes, write.lane_hint);
      lanes.get_mut(lane).push_back(write);
    }
    lanes
  }
}

fn pattern_error(lane: &'static str, source: regex::Error) -> ConfigError {
  ConfigError::InvalidPattern {
    lane,
    pattern: String::from("<pattern set>"),
    source,
  }
}
