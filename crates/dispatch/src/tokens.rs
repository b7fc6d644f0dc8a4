//! Scheduler token costs per write.

use artifact_core::ArtifactWriteConfig;
use serde::{Deserialize, Serialize};

use crate::lane::Lane;

const LARGE_WRITE_BYTES: u64 = 256 * 1024 * 1024;
const HUGE_WRITE_BYTES: u64 = 768 * 1024 * 1024;

/// IO and memory tokens charged to the external scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerTokens {
  pub io: u32,
  pub mem: u32,
}

/// Memory tokens from the byte ladder: 0 below 256MiB, 1 below 768MiB, else 2.
pub fn write_mem_tokens(estimated_bytes: Option<u64>) -> u32 {
  match estimated_bytes {
    Some(bytes) if bytes >= HUGE_WRITE_BYTES => 2,
    Some(bytes) if bytes >= LARGE_WRITE_BYTES => 1,
    _ => 0,
  }
}

/// Token costs for the massive lane and the tail-rescue boost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
  pub massive_io: u32,
  pub massive_mem: u32,
  pub boost_io: u32,
  pub boost_mem: u32,
}

impl Default for TokenPolicy {
  fn default() -> Self {
    Self::from_config(&ArtifactWriteConfig::default())
  }
}

impl TokenPolicy {
  pub fn from_config(config: &ArtifactWriteConfig) -> Self {
    Self {
      massive_io: config.lanes.massive_io_tokens(),
      massive_mem: config.lanes.massive_mem_tokens,
      boost_io: config.tail_rescue.boost_io_tokens,
      boost_mem: config.tail_rescue.boost_mem_tokens,
    }
  }

  /// Tokens for a lane dispatch. `rescue_boost` adds the tail-rescue boost.
  pub fn dispatch_tokens(&self, estimated_bytes: Option<u64>, lane: Lane, rescue_boost: bool) -> SchedulerTokens {
    let ladder = write_mem_tokens(estimated_bytes);
    let (boost_io, boost_mem) = if rescue_boost {
      (self.boost_io, self.boost_mem)
    } else {
      (0, 0)
    };
    match lane {
      Lane::Massive => SchedulerTokens {
        io: self.massive_io + boost_io,
        mem: ladder.max(self.massive_mem) + boost_mem,
      },
      _ => SchedulerTokens {
        io: 1 + boost_io,
        mem: ladder + boost_mem,
      },
    }
  }

  /// Tokens for an eager prefetch submitted before lane classification.
  pub fn eager_tokens(&self, estimated_bytes: Option<u64>, lane_hint: Option<Lane>) -> SchedulerTokens {
    let ladder = write_mem_tokens(estimated_bytes);
    match lane_hint {
      Some(Lane::Massive) => SchedulerTokens {
        io: self.massive_io,
        mem: ladder.max(self.massive_mem),
      },
      _ => SchedulerTokens { io: 1, mem: ladder },
    }
  }
}
