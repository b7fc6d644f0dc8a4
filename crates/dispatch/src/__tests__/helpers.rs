//! Test helpers for drain integration tests.
//!
//! Provides a recording scheduler, job builders that log their execution
//! order, and a dispatcher preset with the heartbeat disabled.

use std::{
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use artifact_core::ArtifactWriteConfig;
use async_trait::async_trait;

use crate::{
  SchedulerStats, WriteDispatcher, WriteRequest, WriteResult, WriteScheduler,
  queue::{JobError, WriteJob},
  tokens::SchedulerTokens,
};

/// Ordered log of job events shared between jobs and assertions.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
  pub fn push(&self, entry: impl Into<String>) {
    self.0.lock().unwrap().push(entry.into());
  }

  pub fn entries(&self) -> Vec<String> {
    self.0.lock().unwrap().clone()
  }

  pub fn count(&self, entry: &str) -> usize {
    self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
  }
}

/// Tracks how many jobs run at the same time.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
  current: AtomicUsize,
  peak: AtomicUsize,
}

impl ConcurrencyProbe {
  pub fn enter(&self) {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
  }

  pub fn exit(&self) {
    self.current.fetch_sub(1, Ordering::SeqCst);
  }

  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

/// Scheduler that records every submission and runs the job inline.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
  submissions: Mutex<Vec<(String, SchedulerTokens)>>,
  stats: SchedulerStats,
}

impl RecordingScheduler {
  pub fn with_stats(stats: SchedulerStats) -> Self {
    Self {
      stats,
      ..Default::default()
    }
  }

  pub fn submissions(&self) -> Vec<(String, SchedulerTokens)> {
    self.submissions.lock().unwrap().clone()
  }
}

#[async_trait]
impl WriteScheduler for RecordingScheduler {
  async fn schedule(&self, queue: &str, tokens: SchedulerTokens, job: WriteJob) -> Result<WriteResult, JobError> {
    self.submissions.lock().unwrap().push((queue.to_string(), tokens));
    job().await
  }

  fn stats(&self) -> SchedulerStats {
    self.stats
  }
}

/// Config with the heartbeat off so tests never log stall lines.
pub fn test_config() -> ArtifactWriteConfig {
  let mut config = ArtifactWriteConfig::default();
  config.heartbeat.interval_ms = 0;
  config
}

pub fn dispatcher(config: ArtifactWriteConfig) -> WriteDispatcher {
  WriteDispatcher::new(config)
    .expect("valid test config")
    .with_host_concurrency(8)
}

/// Job that logs `label`, sleeps, logs `{label}-done` and reports `bytes`.
pub fn logged_write(log: &CallLog, label: &str, delay_ms: u64, bytes: Option<u64>) -> WriteRequest {
  let log = log.clone();
  let name = label.to_string();
  WriteRequest::new(label, move || async move {
    log.push(name.clone());
    if delay_ms > 0 {
      tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    log.push(format!("{name}-done"));
    Ok(WriteResult {
      bytes,
      ..Default::default()
    })
  })
}

pub fn failing_write(log: &CallLog, label: &str) -> WriteRequest {
  let log = log.clone();
  let name = label.to_string();
  WriteRequest::new(label, move || async move {
    log.push(format!("{name}-failed"));
    Err::<WriteResult, JobError>(format!("{name} exploded").into())
  })
}

pub fn probed_write(probe: &Arc<ConcurrencyProbe>, label: &str, delay_ms: u64) -> WriteRequest {
  let probe = probe.clone();
  WriteRequest::new(label, move || async move {
    probe.enter();
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    probe.exit();
    Ok(WriteResult::default())
  })
}
