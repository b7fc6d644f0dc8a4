//! Drain progress counter with rate-limited status lines.

use std::{
  sync::{
    Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use tracing::info;

use crate::events::{DrainEvent, DrainEventSender, emit};

const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Percentage with one decimal; an empty drain counts as done.
pub fn progress_percent(completed: usize, total: usize) -> f64 {
  if total == 0 {
    return 100.0;
  }
  (completed as f64 / total as f64 * 1000.0).round() / 10.0
}

#[derive(Debug)]
pub struct WriteProgress {
  total: usize,
  completed: AtomicUsize,
  last_logged: Mutex<Option<Instant>>,
  events: Option<DrainEventSender>,
}

impl WriteProgress {
  pub fn new(total: usize, events: Option<DrainEventSender>) -> Self {
    Self {
      total,
      completed: AtomicUsize::new(0),
      last_logged: Mutex::new(None),
      events,
    }
  }

  pub fn total(&self) -> usize {
    self.total
  }

  pub fn completed(&self) -> usize {
    self.completed.load(Ordering::Acquire)
  }

  pub fn is_done(&self) -> bool {
    self.completed() >= self.total
  }

  /// Count one finished write and return the new completed count. The status
  /// line is logged for the first and last write and at most once a second
  /// in between.
  pub fn advance(&self, label: &str) -> usize {
    self.advance_at(label, Instant::now())
  }

  pub(crate) fn advance_at(&self, label: &str, now: Instant) -> usize {
    let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
    let should_log = {
      let mut last = self.last_logged.lock().unwrap_or_else(PoisonError::into_inner);
      let due = completed == 1
        || completed >= self.total
        || last.is_none_or(|at| now.saturating_duration_since(at) >= LOG_INTERVAL);
      if due {
        *last = Some(now);
      }
      due
    };
    if should_log {
      info!(
        completed,
        total = self.total,
        label,
        "Writing index files {}/{} ({:.1}%) | {}",
        completed,
        self.total,
        progress_percent(completed, self.total),
        label
      );
    }
    emit(
      self.events.as_ref(),
      DrainEvent::Progress {
        completed,
        total: self.total,
        label: label.to_string(),
      },
    );
    completed
  }
}
