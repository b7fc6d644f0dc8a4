//! Structured drain events for callers that want more than log lines.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{controller::ConcurrencyChange, heartbeat::StallAlert};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DrainEvent {
  AdaptiveChange(ConcurrencyChange),
  TailRescue {
    active: bool,
    remaining: usize,
    stall_secs: u64,
    boost_io: u32,
    boost_mem: u32,
  },
  StallAlert(StallAlert),
  Progress {
    completed: usize,
    total: usize,
    label: String,
  },
}

pub type DrainEventSender = mpsc::UnboundedSender<DrainEvent>;

/// Best-effort send; a dropped receiver is not an error.
pub(crate) fn emit(events: Option<&DrainEventSender>, event: DrainEvent) {
  if let Some(tx) = events {
    let _ = tx.send(event);
  }
}
