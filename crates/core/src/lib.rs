pub mod config;

pub use config::{
  AdaptiveConfig, ArtifactWriteConfig, ConfigError, FsStrategyConfig, FsStrategyMode, HeartbeatConfig, LanePatterns,
  LanesConfig, MAX_WRITE_CONCURRENCY, TailRescueConfig, TailWorkerConfig, WorkClassOverrides,
};
