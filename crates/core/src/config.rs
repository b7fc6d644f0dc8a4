//! Configuration for the artifact write-dispatch engine.
//!
//! Every section is `#[serde(default)]`, so a TOML file only needs to name the
//! knobs it wants to change. Raw values are kept as written; the accessor
//! methods apply the documented floors so callers never see a degenerate
//! threshold. `validate()` rejects values that cannot be repaired by clamping
//! (an out-of-range concurrency override, a pattern that does not compile).

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Upper bound for an explicit `write_concurrency` override.
pub const MAX_WRITE_CONCURRENCY: i64 = 64;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("write_concurrency must be an integer in [1, {max}], got {value}")]
  WriteConcurrencyOutOfRange { value: i64, max: i64 },
  #[error("invalid {lane} lane pattern `{pattern}`: {source}")]
  InvalidPattern {
    lane: &'static str,
    pattern: String,
    #[source]
    source: regex::Error,
  },
  #[error("invalid value for {field}: {reason}")]
  InvalidValue { field: &'static str, reason: String },
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("TOML parse error: {0}")]
  Toml(#[from] toml::de::Error),
}

// ============================================================================
// Adaptive Concurrency
// ============================================================================

/// Feedback controller knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
  /// Let the controller move concurrency at runtime (default: true)
  pub enabled: bool,

  /// Floor the controller never scales below (default: 1)
  pub min_concurrency: usize,

  /// Starting concurrency; derived from the cap when unset
  #[serde(skip_serializing_if = "Option::is_none")]
  pub start_concurrency: Option<usize>,

  /// Pending writes per slot that trigger a scale-up (default: 1.75, min 1)
  pub scale_up_backlog_per_slot: f64,

  /// Pending writes per slot at or below which the drain scales down (default: 0.5)
  pub scale_down_backlog_per_slot: f64,

  /// Longest in-flight write (seconds) that counts as a stall (default: 20)
  pub stall_scale_down_secs: u64,

  /// Scale-up is suppressed above this stall (seconds) (default: 8)
  pub stall_scale_up_guard_secs: u64,

  pub scale_up_cooldown_ms: u64,
  pub scale_down_cooldown_ms: u64,

  /// Memory pressure score (0..1) that forces a scale-down (default: 0.9)
  pub memory_pressure_high: f64,
  /// Memory pressure considered headroom for scale-up (default: 0.62)
  pub memory_pressure_low: f64,
  pub gc_pressure_high: f64,
  pub gc_pressure_low: f64,

  /// Scheduler write-queue signals used to attribute stalls to the write queue
  pub write_queue_pending_threshold: u64,
  pub write_queue_oldest_wait_ms_threshold: u64,
  pub write_queue_wait_p95_ms_threshold: u64,
}

impl Default for AdaptiveConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      min_concurrency: 1,
      start_concurrency: None,
      scale_up_backlog_per_slot: 1.75,
      scale_down_backlog_per_slot: 0.5,
      stall_scale_down_secs: 20,
      stall_scale_up_guard_secs: 8,
      scale_up_cooldown_ms: 400,
      scale_down_cooldown_ms: 1200,
      memory_pressure_high: 0.9,
      memory_pressure_low: 0.62,
      gc_pressure_high: 0.4,
      gc_pressure_low: 0.2,
      write_queue_pending_threshold: 1,
      write_queue_oldest_wait_ms_threshold: 1200,
      write_queue_wait_p95_ms_threshold: 750,
    }
  }
}

impl AdaptiveConfig {
  pub fn min_concurrency(&self) -> usize {
    self.min_concurrency.max(1)
  }

  pub fn start_concurrency(&self) -> Option<usize> {
    self.start_concurrency.filter(|value| *value > 0)
  }

  pub fn scale_up_backlog_per_slot(&self) -> f64 {
    self.scale_up_backlog_per_slot.max(1.0)
  }

  pub fn scale_down_backlog_per_slot(&self) -> f64 {
    self.scale_down_backlog_per_slot.max(0.0)
  }

  pub fn stall_scale_down_secs(&self) -> u64 {
    self.stall_scale_down_secs.max(1)
  }

  pub fn stall_scale_up_guard_secs(&self) -> u64 {
    self.stall_scale_up_guard_secs.max(1)
  }
}

// ============================================================================
// Tail Rescue / Tail Worker
// ============================================================================

/// Temporary full-concurrency boost for a short, stalled tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailRescueConfig {
  pub enabled: bool,
  /// Remaining writes (queued + in flight) at or below which rescue may engage
  pub max_pending: usize,
  /// Longest in-flight write (seconds) required before rescue engages
  pub stall_secs: u64,
  pub boost_io_tokens: u32,
  pub boost_mem_tokens: u32,
}

impl Default for TailRescueConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_pending: 3,
      stall_secs: 15,
      boost_io_tokens: 1,
      boost_mem_tokens: 1,
    }
  }
}

impl TailRescueConfig {
  pub fn max_pending(&self) -> usize {
    self.max_pending.max(1)
  }

  pub fn stall_secs(&self) -> u64 {
    self.stall_secs.max(1)
  }
}

/// One extra slot that pulls the costliest pending write near drain end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailWorkerConfig {
  pub enabled: bool,
  /// Defaults to `max(2, tail_rescue.max_pending + 1)`
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_pending: Option<usize>,
}

impl Default for TailWorkerConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_pending: None,
    }
  }
}

// ============================================================================
// Lanes
// ============================================================================

/// Size thresholds and forced-label patterns used by the lane planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
  /// Writes at or above this size go to the heavy lane (default: 16MiB, min 1MiB)
  pub heavy_threshold_bytes: u64,
  /// Writes of at most this size go to the ultra-light lane (default: 64KiB, min 1KiB)
  pub ultra_light_threshold_bytes: u64,
  /// Writes at or above this size go to the massive lane (default: 128MiB, min 8MiB)
  pub massive_threshold_bytes: u64,

  pub heavy_patterns: Vec<String>,
  pub ultra_light_patterns: Vec<String>,
  pub massive_patterns: Vec<String>,

  /// Scheduler IO tokens charged per massive write (default: 2, min 1)
  pub massive_io_tokens: u32,
  /// Scheduler memory tokens reserved per massive write (default: 2)
  pub massive_mem_tokens: u32,
}

impl Default for LanesConfig {
  fn default() -> Self {
    Self {
      heavy_threshold_bytes: 16 * MIB,
      ultra_light_threshold_bytes: 64 * KIB,
      massive_threshold_bytes: 128 * MIB,
      heavy_patterns: vec![
        r"(^|/)field_postings(?:\.|$)".to_string(),
        r"(^|/)token_postings(?:\.|$)".to_string(),
        r"(^|/)chunk_meta(?:\.|$)".to_string(),
      ],
      ultra_light_patterns: vec![
        r"(^|/)\.filelists\.json$".to_string(),
        r"(^|/).*\.meta\.json$".to_string(),
        r"(^|/)determinism_report\.json$".to_string(),
        r"(^|/)vocab_order\.json$".to_string(),
        r"(^|/)pieces/manifest\.json$".to_string(),
      ],
      massive_patterns: vec![
        r"(^|/)field_postings(?:\.|$)".to_string(),
        r"(^|/)field_postings\.binary-columnar(?:\.|$)".to_string(),
        r"(^|/)token_postings\.packed(?:\.|$)".to_string(),
        r"(^|/)token_postings\.binary-columnar(?:\.|$)".to_string(),
        r"(^|/)chunk_meta\.binary-columnar(?:\.|$)".to_string(),
      ],
      massive_io_tokens: 2,
      massive_mem_tokens: 2,
    }
  }
}

/// Compiled forced-lane patterns.
#[derive(Debug, Clone, Default)]
pub struct LanePatterns {
  pub heavy: Vec<Regex>,
  pub ultra_light: Vec<Regex>,
  pub massive: Vec<Regex>,
}

impl LanesConfig {
  pub fn heavy_threshold_bytes(&self) -> u64 {
    self.heavy_threshold_bytes.max(MIB)
  }

  pub fn ultra_light_threshold_bytes(&self) -> u64 {
    self.ultra_light_threshold_bytes.max(KIB)
  }

  pub fn massive_threshold_bytes(&self) -> u64 {
    self.massive_threshold_bytes.max(8 * MIB)
  }

  pub fn massive_io_tokens(&self) -> u32 {
    self.massive_io_tokens.max(1)
  }

  /// Compile the pattern lists. Blank entries are skipped.
  pub fn compile_patterns(&self) -> Result<LanePatterns, ConfigError> {
    Ok(LanePatterns {
      heavy: compile_pattern_list("heavy", &self.heavy_patterns)?,
      ultra_light: compile_pattern_list("ultra-light", &self.ultra_light_patterns)?,
      massive: compile_pattern_list("massive", &self.massive_patterns)?,
    })
  }
}

fn compile_pattern_list(lane: &'static str, patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
  patterns
    .iter()
    .map(|pattern| pattern.trim())
    .filter(|pattern| !pattern.is_empty())
    .map(|pattern| {
      Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        lane,
        pattern: pattern.to_string(),
        source,
      })
    })
    .collect()
}

// ============================================================================
// Filesystem Strategy
// ============================================================================

/// Filesystem write strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FsStrategyMode {
  /// Pick `ntfs` on Windows hosts, `generic` elsewhere
  #[default]
  Auto,
  Ntfs,
  Generic,
}

impl std::str::FromStr for FsStrategyMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "auto" => Ok(FsStrategyMode::Auto),
      "ntfs" => Ok(FsStrategyMode::Ntfs),
      "generic" => Ok(FsStrategyMode::Generic),
      _ => Err(format!("Invalid fs strategy mode: {}", s)),
    }
  }
}

/// Micro-write coalescing and platform strategy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsStrategyConfig {
  pub mode: FsStrategyMode,
  /// Coalesce tiny ultra-light writes into micro-batches (default: true)
  pub micro_coalesce: bool,
  /// Max entries per micro-batch (default: 12 on ntfs, 8 otherwise, min 2)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub micro_batch_max_count: Option<usize>,
  /// Max estimated bytes per micro-batch (default: 512KiB on ntfs, 256KiB otherwise, min 16KiB)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub micro_batch_max_bytes: Option<u64>,
}

impl Default for FsStrategyConfig {
  fn default() -> Self {
    Self {
      mode: FsStrategyMode::Auto,
      micro_coalesce: true,
      micro_batch_max_count: None,
      micro_batch_max_bytes: None,
    }
  }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Stall heartbeat configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
  /// Tick interval in milliseconds (0 disables the heartbeat)
  pub interval_ms: u64,
  /// Elapsed seconds at which a single in-flight write raises a stall alert
  pub stall_thresholds_secs: Vec<u64>,
}

impl Default for HeartbeatConfig {
  fn default() -> Self {
    Self {
      interval_ms: 15_000,
      stall_thresholds_secs: vec![10, 30, 60],
    }
  }
}

impl HeartbeatConfig {
  /// Thresholds sorted ascending, deduplicated, zero entries dropped.
  /// Falls back to the defaults when nothing usable remains.
  pub fn stall_thresholds_secs(&self) -> Vec<u64> {
    let mut thresholds: Vec<u64> = self
      .stall_thresholds_secs
      .iter()
      .copied()
      .filter(|secs| *secs > 0)
      .collect();
    if thresholds.is_empty() {
      thresholds = HeartbeatConfig::default().stall_thresholds_secs;
    }
    thresholds.sort_unstable();
    thresholds.dedup();
    thresholds
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Overrides for the `small` / `medium` / `large` work classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkClassOverrides {
  pub small: Option<usize>,
  pub medium: Option<usize>,
  pub large: Option<usize>,
}

/// Artifact write-dispatch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactWriteConfig {
  /// Explicit total write concurrency; must be within [1, 64]
  #[serde(skip_serializing_if = "Option::is_none")]
  pub write_concurrency: Option<i64>,

  /// Heavy-lane target for the two-lane split (also the medium class fallback)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub heavy_concurrency: Option<usize>,
  /// Large class fallback when `large_concurrency` is unset
  #[serde(skip_serializing_if = "Option::is_none")]
  pub massive_concurrency: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub small_concurrency: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub medium_concurrency: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub large_concurrency: Option<usize>,

  /// Upper bound on waiting for in-flight writes after a failure (default: 120000)
  pub drain_timeout_ms: u64,

  #[serde(default)]
  pub adaptive: AdaptiveConfig,

  #[serde(default)]
  pub tail_rescue: TailRescueConfig,

  #[serde(default)]
  pub tail_worker: TailWorkerConfig,

  #[serde(default)]
  pub lanes: LanesConfig,

  #[serde(default)]
  pub fs_strategy: FsStrategyConfig,

  #[serde(default)]
  pub heartbeat: HeartbeatConfig,
}

impl Default for ArtifactWriteConfig {
  fn default() -> Self {
    Self {
      write_concurrency: None,
      heavy_concurrency: None,
      massive_concurrency: None,
      small_concurrency: None,
      medium_concurrency: None,
      large_concurrency: None,
      drain_timeout_ms: 120_000,
      adaptive: AdaptiveConfig::default(),
      tail_rescue: TailRescueConfig::default(),
      tail_worker: TailWorkerConfig::default(),
      lanes: LanesConfig::default(),
      fs_strategy: FsStrategyConfig::default(),
      heartbeat: HeartbeatConfig::default(),
    }
  }
}

impl ArtifactWriteConfig {
  /// Parse and validate a TOML document.
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    let config: Self = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  /// Load and validate a TOML config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_toml_str(&content)
  }

  /// Validated explicit write-concurrency override, if any.
  pub fn write_concurrency_override(&self) -> Result<Option<usize>, ConfigError> {
    match self.write_concurrency {
      None => Ok(None),
      Some(value) if (1..=MAX_WRITE_CONCURRENCY).contains(&value) => Ok(Some(value as usize)),
      Some(value) => Err(ConfigError::WriteConcurrencyOutOfRange {
        value,
        max: MAX_WRITE_CONCURRENCY,
      }),
    }
  }

  /// Heavy-lane override for the two-lane split.
  pub fn heavy_concurrency_override(&self) -> Option<usize> {
    self.heavy_concurrency.filter(|value| *value > 0)
  }

  /// Per-class overrides; medium falls back to `heavy_concurrency`, large to `massive_concurrency`.
  pub fn work_class_overrides(&self) -> WorkClassOverrides {
    let positive = |value: Option<usize>| value.filter(|v| *v > 0);
    WorkClassOverrides {
      small: positive(self.small_concurrency),
      medium: positive(self.medium_concurrency).or(positive(self.heavy_concurrency)),
      large: positive(self.large_concurrency).or(positive(self.massive_concurrency)),
    }
  }

  pub fn tail_worker_max_pending(&self) -> usize {
    match self.tail_worker.max_pending {
      Some(value) => value.max(1),
      None => (self.tail_rescue.max_pending() + 1).max(2),
    }
  }

  /// Reject values that cannot be repaired by clamping.
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.write_concurrency_override()?;
    self.lanes.compile_patterns()?;

    let ratios = [
      ("adaptive.scale_up_backlog_per_slot", self.adaptive.scale_up_backlog_per_slot),
      ("adaptive.scale_down_backlog_per_slot", self.adaptive.scale_down_backlog_per_slot),
      ("adaptive.memory_pressure_high", self.adaptive.memory_pressure_high),
      ("adaptive.memory_pressure_low", self.adaptive.memory_pressure_low),
      ("adaptive.gc_pressure_high", self.adaptive.gc_pressure_high),
      ("adaptive.gc_pressure_low", self.adaptive.gc_pressure_low),
    ];
    for (field, value) in ratios {
      if !value.is_finite() {
        return Err(ConfigError::InvalidValue {
          field,
          reason: format!("expected a finite number, got {}", value),
        });
      }
    }

    if self.adaptive.memory_pressure_low > self.adaptive.memory_pressure_high {
      return Err(ConfigError::InvalidValue {
        field: "adaptive.memory_pressure_low",
        reason: "must not exceed adaptive.memory_pressure_high".to_string(),
      });
    }
    if self.adaptive.gc_pressure_low > self.adaptive.gc_pressure_high {
      return Err(ConfigError::InvalidValue {
        field: "adaptive.gc_pressure_low",
        reason: "must not exceed adaptive.gc_pressure_high".to_string(),
      });
    }

    Ok(())
  }
}
