//! Write lanes and work classes.
//!
//! Every queued write lives in exactly one [`Lane`]. Lanes group into coarser
//! [`WorkClass`]es for concurrency overrides:
//!
//! ```text
//! small  = ultraLight + light
//! medium = heavy
//! large  = massive
//! ```

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Dispatch lane for a single artifact write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lane {
  UltraLight,
  Light,
  Heavy,
  Massive,
}

impl Lane {
  /// Strict selection order used at each dispatch step.
  pub const DISPATCH_ORDER: [Lane; 4] = [Lane::UltraLight, Lane::Massive, Lane::Heavy, Lane::Light];

  /// Preference order when the tail worker breaks ties between lanes.
  pub const TAIL_WORKER_ORDER: [Lane; 4] = [Lane::Massive, Lane::Heavy, Lane::Light, Lane::UltraLight];

  pub fn as_str(&self) -> &'static str {
    match self {
      Lane::UltraLight => "ultraLight",
      Lane::Light => "light",
      Lane::Heavy => "heavy",
      Lane::Massive => "massive",
    }
  }

  pub fn work_class(&self) -> WorkClass {
    match self {
      Lane::UltraLight | Lane::Light => WorkClass::Small,
      Lane::Heavy => WorkClass::Medium,
      Lane::Massive => WorkClass::Large,
    }
  }

  /// Rank within [`Lane::TAIL_WORKER_ORDER`].
  pub fn tail_worker_rank(&self) -> usize {
    match self {
      Lane::Massive => 0,
      Lane::Heavy => 1,
      Lane::Light => 2,
      Lane::UltraLight => 3,
    }
  }
}

impl fmt::Display for Lane {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Lane {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "ultraLight" | "ultra-light" | "ultra_light" => Ok(Lane::UltraLight),
      "light" => Ok(Lane::Light),
      "heavy" => Ok(Lane::Heavy),
      "massive" => Ok(Lane::Massive),
      other => Err(format!("Invalid write lane: {}", other)),
    }
  }
}

/// Coarse size class used for independent concurrency overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkClass {
  Small,
  Medium,
  Large,
}

/// One value per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneMap<T> {
  pub ultra_light: T,
  pub light: T,
  pub heavy: T,
  pub massive: T,
}

impl<T> LaneMap<T> {
  pub fn get(&self, lane: Lane) -> &T {
    match lane {
      Lane::UltraLight => &self.ultra_light,
      Lane::Light => &self.light,
      Lane::Heavy => &self.heavy,
      Lane::Massive => &self.massive,
    }
  }

  pub fn get_mut(&mut self, lane: Lane) -> &mut T {
    match lane {
      Lane::UltraLight => &mut self.ultra_light,
      Lane::Light => &mut self.light,
      Lane::Heavy => &mut self.heavy,
      Lane::Massive => &mut self.massive,
    }
  }

  /// Iterate in dispatch order.
  pub fn iter(&self) -> impl Iterator<Item = (Lane, &T)> {
    Lane::DISPATCH_ORDER.into_iter().map(move |lane| (lane, self.get(lane)))
  }

  pub fn map<U>(&self, mut f: impl FnMut(Lane, &T) -> U) -> LaneMap<U> {
    LaneMap {
      ultra_light: f(Lane::UltraLight, &self.ultra_light),
      light: f(Lane::Light, &self.light),
      heavy: f(Lane::Heavy, &self.heavy),
      massive: f(Lane::Massive, &self.massive),
    }
  }
}

impl LaneMap<usize> {
  pub fn total(&self) -> usize {
    self.ultra_light + self.light + self.heavy + self.massive
  }
}
