//! Drain lifecycle tests: completion, failure ordering, eager prefetch and
//! telemetry side effects.

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use pretty_assertions::assert_eq;

  use crate::{
    DispatchError, DispatchSummary, JobError, Lane, PieceMetadataSink, PieceRegistry, WriteRequest, WriteResult,
    __tests__::helpers::{CallLog, dispatcher, failing_write, logged_write, test_config},
    queue::QueuedWrite,
  };

  fn explode() -> Result<WriteResult, JobError> {
    panic!("writer crashed")
  }

  fn queued(requests: Vec<WriteRequest>) -> Vec<QueuedWrite> {
    requests.into_iter().map(QueuedWrite::new).collect()
  }

  #[tokio::test]
  async fn test_empty_drain() {
    let summary = dispatcher(test_config()).dispatch(Vec::new()).await.unwrap();
    assert_eq!(summary, DispatchSummary::default());
  }

  #[tokio::test]
  async fn test_every_write_runs_exactly_once() {
    let log = CallLog::default();
    let dispatcher = dispatcher(test_config());
    let labels: Vec<String> = (0..20).map(|i| format!("part-{i:02}.json")).collect();
    let writes = labels
      .iter()
      .enumerate()
      .map(|(i, label)| logged_write(&log, label, (i % 3) as u64 * 5, Some(100)))
      .collect();

    let summary = dispatcher.dispatch(queued(writes)).await.unwrap();
    assert_eq!(summary.total_writes, 20);
    assert_eq!(summary.write_concurrency, 8);
    for label in &labels {
      assert_eq!(log.count(label), 1, "{label}");
      assert_eq!(log.count(&format!("{label}-done")), 1, "{label}");
    }
    assert_eq!(dispatcher.telemetry().len(), 20);
  }

  #[tokio::test]
  async fn test_failure_surfaces_after_in_flight_writes_settle() {
    let log = CallLog::default();
    let dispatcher = dispatcher(test_config());
    let writes = queued(vec![logged_write(&log, "slow.json", 200, None), failing_write(&log, "fail.json")]);

    let error = dispatcher.dispatch(writes).await.unwrap_err();
    match &error {
      DispatchError::WriteJob { label, source } => {
        assert_eq!(label, "fail.json");
        assert_eq!(source.to_string(), "fail.json exploded");
      }
      other => panic!("unexpected error: {other:?}"),
    }
    let entries = log.entries();
    assert!(entries.contains(&"fail.json-failed".to_string()));
    assert!(
      entries.contains(&"slow.json-done".to_string()),
      "slow write must finish before the error is returned: {entries:?}"
    );
    assert!(dispatcher.telemetry().metric("slow.json").is_some());
  }

  #[tokio::test]
  async fn test_failure_stops_new_dispatch() {
    let log = CallLog::default();
    let mut config = test_config();
    config.write_concurrency = Some(1);
    config.tail_worker.enabled = false;
    let writes = queued(vec![
      failing_write(&log, "a.json").with_priority(10),
      logged_write(&log, "b.json", 0, None),
      logged_write(&log, "c.json", 0, None),
    ]);

    let error = dispatcher(config).dispatch(writes).await.unwrap_err();
    assert_eq!(error.label(), Some("a.json"));
    assert_eq!(log.entries(), vec!["a.json-failed"]);
  }

  #[tokio::test]
  async fn test_first_error_wins() {
    let log = CallLog::default();
    let writes = queued(vec![
      failing_write(&log, "first.json").with_priority(2),
      WriteRequest::new("second.json", || async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Err::<WriteResult, JobError>("second failure".into())
      }),
    ]);
    let error = dispatcher(test_config()).dispatch(writes).await.unwrap_err();
    assert_eq!(error.label(), Some("first.json"));
  }

  #[tokio::test]
  async fn test_panicking_job_reports_label() {
    let writes = queued(vec![WriteRequest::new("boom.json", || async { explode() })]);
    let error = dispatcher(test_config()).dispatch(writes).await.unwrap_err();
    assert!(matches!(&error, DispatchError::JobPanicked { label, .. } if label == "boom.json"));
  }

  #[tokio::test]
  async fn test_eager_write_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = dispatcher(test_config());
    let mut queue = dispatcher.queue();
    let counter = calls.clone();
    queue.enqueue(
      WriteRequest::new("index_state.json", move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(WriteResult {
          bytes: Some(64),
          ..Default::default()
        })
      })
      .eager(),
    );
    queue.enqueue(WriteRequest::new("other.json", || async { Ok(WriteResult::default()) }));

    let summary = dispatcher.dispatch_queue(queue).await.unwrap();
    assert_eq!(summary.total_writes, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let row = dispatcher.telemetry().metric("index_state.json").unwrap();
    assert_eq!(row.bytes, Some(64));
    assert_eq!(row.scheduler_io_tokens, Some(1));
  }

  #[tokio::test]
  async fn test_bytes_backfilled_from_output_file() {
    let out_dir = tempfile::tempdir().unwrap();
    let path = out_dir.path().join("chunk_meta.json");
    let registry = Arc::new(PieceRegistry::new());
    registry.register("chunk_meta.json");
    let dispatcher = dispatcher(test_config())
      .with_out_dir(out_dir.path())
      .with_metadata_sink(registry.clone() as Arc<dyn PieceMetadataSink>);

    let writes = queued(vec![WriteRequest::new("chunk_meta.json", move || async move {
      tokio::fs::write(&path, b"[1,2,3]").await?;
      Ok::<WriteResult, JobError>(WriteResult {
        checksum: Some("ABC123".to_string()),
        checksum_algo: Some("sha1".to_string()),
        serialization_ms: Some(0.0),
        ..Default::default()
      })
    })]);
    dispatcher.dispatch(writes).await.unwrap();

    let row = dispatcher.telemetry().metric("chunk_meta.json").unwrap();
    assert_eq!(row.bytes, Some(7));
    assert!(row.disk_ms.is_some());
    assert_eq!(row.checksum_algo.as_deref(), Some("sha1"));
    let piece = registry.get("chunk_meta.json").unwrap();
    assert_eq!(piece.bytes, Some(7));
    assert_eq!(piece.checksum.as_deref(), Some("sha1:abc123"));
  }

  #[tokio::test]
  async fn test_metric_row_fields() {
    let log = CallLog::default();
    let dispatcher = dispatcher(test_config());
    dispatcher
      .dispatch(queued(vec![logged_write(&log, "x.json", 0, Some(2048))]))
      .await
      .unwrap();

    let row = dispatcher.telemetry().metric("x.json").unwrap();
    assert_eq!(row.lane, Some(Lane::Light));
    assert_eq!(row.bytes, Some(2048));
    assert_eq!(row.estimated_bytes, None);
    assert_eq!(row.tail_worker, Some(false));
    assert_eq!(row.tail_rescue_boosted, Some(false));
    assert_eq!(row.batch_size, None);
    assert_eq!(row.write_concurrency_at_start, Some(1));
    assert!(row.latency_class.as_deref().is_some_and(|class| class.starts_with("micro:")));
    assert_eq!(row.queue_delay_histogram.map(|h| h.sample_count), Some(1));
    assert_eq!(dispatcher.telemetry().latency_summary().total, 1);
  }
}
