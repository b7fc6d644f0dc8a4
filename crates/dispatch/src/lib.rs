//! Write-dispatch engine for index artifacts.
//!
//! Decides when, in what order and with how much concurrency each artifact
//! write runs. Writes are classified into four lanes by size and label,
//! dispatched in strict lane priority under per-lane budgets, and throttled by
//! an adaptive controller fed from backlog, stall and memory signals.
//!
//! ```text
//! WriteQueue ─► LanePlanner ─► Drain ─┬─► WriteScheduler (token-costed jobs)
//!                                     ├─► AdaptiveController
//!                                     └─► WriteTelemetry / heartbeat
//! ```

pub mod budget;
pub mod controller;
pub mod drain;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod lane;
pub mod metadata;
pub mod planner;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod sizing;
pub mod strategy;
pub mod telemetry;
pub mod tokens;

mod dispatch;

#[cfg(test)]
mod __tests__;

pub use controller::{AdaptiveController, ConcurrencyChange, ControllerSettings, ControllerSnapshot, ScaleReason};
pub use dispatch::{DispatchSummary, WriteDispatcher, resolve_adaptive_initial_concurrency};
pub use error::DispatchError;
pub use events::{DrainEvent, DrainEventSender};
pub use lane::{Lane, LaneMap, WorkClass};
pub use metadata::{PieceMetadataSink, PieceMetadataUpdate, PieceRegistry};
pub use queue::{JobError, QueuedWrite, WriteQueue, WriteRequest, WriteResult};
pub use scheduler::{MemorySignals, SchedulerStats, WRITE_QUEUE_NAME, WriteQueueSignals, WriteScheduler};
pub use telemetry::{MetricRow, QueueDelayHistogram, WriteTelemetry};
pub use tokens::SchedulerTokens;
