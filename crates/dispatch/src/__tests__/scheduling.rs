//! Drain scheduling tests: ordering, concurrency bounds, micro-batching, the
//! tail worker, tail rescue and scheduler token costs.

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;
  use tokio::sync::mpsc;

  use crate::{
    DrainEvent, Lane, MemorySignals, SchedulerStats, SchedulerTokens, WRITE_QUEUE_NAME, WriteRequest, WriteResult,
    __tests__::helpers::{
      CallLog, ConcurrencyProbe, RecordingScheduler, dispatcher, logged_write, probed_write, test_config,
    },
    queue::QueuedWrite,
  };

  const MIB: u64 = 1024 * 1024;

  fn queued(requests: Vec<WriteRequest>) -> Vec<QueuedWrite> {
    requests.into_iter().map(QueuedWrite::new).collect()
  }

  async fn sequential_call_order() -> Vec<String> {
    let log = CallLog::default();
    let mut config = test_config();
    config.write_concurrency = Some(1);
    config.tail_worker.enabled = false;
    let writes = queued(vec![
      logged_write(&log, "a.json", 0, None),
      logged_write(&log, "b.json", 0, None).with_priority(5),
      logged_write(&log, "index_state.json", 0, None),
      logged_write(&log, "c.json", 0, None).with_priority(-1),
      logged_write(&log, "d.json", 0, None),
    ]);
    dispatcher(config).dispatch(writes).await.unwrap();
    log.entries().into_iter().filter(|entry| !entry.ends_with("-done")).collect()
  }

  #[tokio::test]
  async fn test_dispatch_order_is_deterministic() {
    let first = sequential_call_order().await;
    let second = sequential_call_order().await;
    assert_eq!(first, vec!["index_state.json", "b.json", "a.json", "d.json", "c.json"]);
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn test_concurrency_never_exceeds_ceiling() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let mut config = test_config();
    config.write_concurrency = Some(3);
    config.tail_worker.enabled = false;
    let writes = (0..12)
      .map(|i| probed_write(&probe, &format!("w{i}.json"), 20))
      .collect();

    let summary = dispatcher(config).dispatch(queued(writes)).await.unwrap();
    assert_eq!(summary.write_concurrency, 3);
    assert!(probe.peak() <= 3, "peak={}", probe.peak());
    assert!(probe.peak() >= 2);
  }

  #[tokio::test]
  async fn test_tail_worker_stays_closed_mid_drain() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let mut config = test_config();
    config.write_concurrency = Some(8);
    let dispatcher = dispatcher(config);
    let labels: Vec<String> = (0..10).map(|i| format!("w{i}.json")).collect();
    let writes = labels.iter().map(|label| probed_write(&probe, label, 50)).collect();

    let summary = dispatcher.dispatch(queued(writes)).await.unwrap();
    assert_eq!(summary.write_concurrency, 8);
    assert!(probe.peak() <= 8, "peak={}", probe.peak());
    let telemetry = dispatcher.telemetry();
    for label in &labels {
      assert_eq!(telemetry.metric(label).unwrap().tail_worker, Some(false), "{label}");
    }
  }

  #[tokio::test]
  async fn test_ultra_light_writes_are_micro_batched() {
    let log = CallLog::default();
    let mut config = test_config();
    config.write_concurrency = Some(1);
    config.tail_worker.enabled = false;
    let dispatcher = dispatcher(config);
    let writes = ["u1.json", "u2.json", "u3.json"]
      .into_iter()
      .map(|label| logged_write(&log, label, 0, None).with_estimated_bytes(1024))
      .collect();

    let summary = dispatcher.dispatch(queued(writes)).await.unwrap();
    assert_eq!(summary.lane_writes.ultra_light, vec!["u1.json", "u2.json", "u3.json"]);
    let telemetry = dispatcher.telemetry();
    for (index, label) in ["u1.json", "u2.json", "u3.json"].into_iter().enumerate() {
      let row = telemetry.metric(label).unwrap();
      assert_eq!(row.batch_size, Some(3), "{label}");
      assert_eq!(row.batch_index, Some(index + 1), "{label}");
      assert_eq!(row.lane, Some(Lane::UltraLight));
    }
  }

  #[tokio::test]
  async fn test_tail_worker_takes_costliest_pending_write() {
    let log = CallLog::default();
    let mut config = test_config();
    config.write_concurrency = Some(1);
    let dispatcher = dispatcher(config);
    let writes = queued(vec![
      logged_write(&log, "first.bin", 50, None).with_estimated_bytes(2 * MIB),
      logged_write(&log, "small.bin", 0, None).with_estimated_bytes(MIB + 1),
      logged_write(&log, "big.bin", 0, None).with_estimated_bytes(4 * MIB),
    ]);

    dispatcher.dispatch(writes).await.unwrap();
    let telemetry = dispatcher.telemetry();
    assert_eq!(telemetry.metric("first.bin").unwrap().tail_worker, Some(false));
    assert_eq!(telemetry.metric("big.bin").unwrap().tail_worker, Some(true));
    assert_eq!(telemetry.metric("small.bin").unwrap().tail_worker, Some(true));
    let starts: Vec<String> = log
      .entries()
      .into_iter()
      .filter(|entry| !entry.ends_with("-done"))
      .collect();
    assert_eq!(starts, vec!["first.bin", "big.bin", "small.bin"]);
  }

  #[tokio::test]
  async fn test_tail_rescue_boosts_remaining_writes() {
    let log = CallLog::default();
    let scheduler = Arc::new(RecordingScheduler::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut config = test_config();
    config.write_concurrency = Some(2);
    config.tail_worker.enabled = false;
    config.tail_rescue.stall_secs = 1;
    config.tail_rescue.max_pending = 3;
    let dispatcher = dispatcher(config).with_scheduler(scheduler.clone()).with_events(tx);

    let writes = queued(vec![
      logged_write(&log, "stuck.json", 1600, None),
      logged_write(&log, "warmup.json", 1100, None),
      logged_write(&log, "c.json", 0, None),
      logged_write(&log, "d.json", 0, None),
    ]);
    dispatcher.dispatch(writes).await.unwrap();

    let telemetry = dispatcher.telemetry();
    assert_eq!(telemetry.metric("warmup.json").unwrap().tail_rescue_boosted, Some(false));
    let boosted = telemetry.metric("c.json").unwrap();
    assert_eq!(boosted.tail_rescue_boosted, Some(true));
    assert_eq!(boosted.scheduler_io_tokens, Some(2));
    assert_eq!(boosted.scheduler_mem_tokens, Some(1));

    let mut rescue_events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      if let DrainEvent::TailRescue { active, .. } = event {
        rescue_events.push(active);
      }
    }
    assert_eq!(rescue_events.first(), Some(&true));
  }

  #[tokio::test]
  async fn test_scheduler_receives_token_costs() {
    let log = CallLog::default();
    let scheduler = Arc::new(RecordingScheduler::default());
    let mut config = test_config();
    config.write_concurrency = Some(1);
    config.tail_worker.enabled = false;
    let dispatcher = dispatcher(config).with_scheduler(scheduler.clone());
    let writes = queued(vec![
      logged_write(&log, "blob.bin", 0, None).with_estimated_bytes(900 * MIB),
      logged_write(&log, "tiny.json", 0, None).with_estimated_bytes(10),
    ]);

    dispatcher.dispatch(writes).await.unwrap();
    let submissions = scheduler.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions.iter().all(|(queue, _)| queue == WRITE_QUEUE_NAME));
    // a single slot is reserved for massive work, so the ultra-light write waits
    assert_eq!(submissions[0].1, SchedulerTokens { io: 2, mem: 2 });
    assert_eq!(submissions[1].1, SchedulerTokens { io: 1, mem: 0 });
    assert_eq!(dispatcher.telemetry().metric("blob.bin").unwrap().lane, Some(Lane::Massive));
  }

  #[tokio::test]
  async fn test_memory_pressure_scales_concurrency_down() {
    let probe = Arc::new(ConcurrencyProbe::default());
    let scheduler = Arc::new(RecordingScheduler::with_stats(SchedulerStats {
      memory: Some(MemorySignals {
        pressure_score: Some(0.99),
        ..Default::default()
      }),
      write_queue: None,
    }));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut config = test_config();
    config.write_concurrency = Some(4);
    config.tail_worker.enabled = false;
    let dispatcher = dispatcher(config).with_scheduler(scheduler).with_events(tx);
    let writes = (0..8)
      .map(|i| probed_write(&probe, &format!("w{i}.json"), 10))
      .collect();

    dispatcher.dispatch(queued(writes)).await.unwrap();
    let mut changes = Vec::new();
    while let Ok(event) = rx.try_recv() {
      if let DrainEvent::AdaptiveChange(change) = event {
        changes.push(change);
      }
    }
    let first = changes.first().expect("memory pressure should scale down");
    assert_eq!((first.from, first.to), (4, 3));
    assert_eq!(first.reason, crate::ScaleReason::MemoryPressure);
    assert!(probe.peak() <= 3, "peak={}", probe.peak());
  }

  #[tokio::test]
  async fn test_summary_lists_lane_writes() {
    let writes = queued(vec![
      WriteRequest::new("field_postings.bin", || async { Ok(WriteResult::default()) }),
      WriteRequest::new("pieces/manifest.json", || async { Ok(WriteResult::default()) }),
      WriteRequest::new("dense.bin", || async { Ok(WriteResult::default()) }).with_estimated_bytes(32 * MIB),
      WriteRequest::new("misc.bin", || async { Ok(WriteResult::default()) }),
    ]);
    let summary = dispatcher(test_config()).dispatch(writes).await.unwrap();
    assert_eq!(summary.total_writes, 4);
    assert_eq!(summary.lane_writes.massive, vec!["field_postings.bin"]);
    assert_eq!(summary.lane_writes.ultra_light, vec!["pieces/manifest.json"]);
    assert_eq!(summary.lane_writes.heavy, vec!["dense.bin"]);
    assert_eq!(summary.lane_writes.light, vec!["misc.bin"]);
  }
}
