use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use throttled_pipeline::{
    PipelineBuilder, ProcessingError, Processor, RateLimiter, SlidingWindowLimiter, Submission,
};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_twenty_items_three_consumers() {
    let pipeline = PipelineBuilder::new()
        .max_queue_size(10)
        .num_consumers(3)
        .build::<u64>()
        .expect("Pipeline build failed");

    let doubler = Processor::from_async(|x: u64| async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok::<_, String>(x * 2)
    });
    let mut report = pipeline.run(0..20u64, doubler).await.expect("Run failed");

    assert_eq!(report.records.len(), 20);
    assert!(!report.cancelled);
    assert_eq!(report.succeeded(), 20);

    report.sort_by_id();
    for (i, record) in report.records.iter().enumerate() {
        assert_eq!(record.work_item_id, i as u64);
        assert_eq!(record.result, Ok(i as u64 * 2));
        assert!(record.consumer_id.is_some_and(|c| c < 3));
    }
    assert_eq!(report.metrics.total_processed, 20);
}

#[tokio::test]
async fn test_no_item_loss_with_failures() {
    let pipeline = PipelineBuilder::new()
        .max_queue_size(4)
        .num_consumers(4)
        .build::<u32>()
        .expect("Pipeline build failed");

    let picky = Processor::from_fn(|x: u32| {
        if x % 3 == 0 {
            Err(format!("rejecting {x}"))
        } else {
            Ok(x)
        }
    });
    let report = pipeline.run(0..30u32, picky).await.expect("Run failed");

    assert_eq!(report.records.len(), 30);
    assert_eq!(report.failed(), 10);
    assert_eq!(report.succeeded(), 20);

    let ids: HashSet<u64> = report.records.iter().map(|r| r.work_item_id).collect();
    assert_eq!(ids, (0..30).collect());

    let failure = report
        .records
        .iter()
        .find(|r| r.work_item_id == 9)
        .expect("item 9 missing");
    assert_eq!(
        failure.result,
        Err(ProcessingError::Failed("rejecting 9".to_string()))
    );
    assert_eq!(report.metrics.total_failed, 10);
}

#[tokio::test]
async fn test_single_consumer_preserves_fifo_order() {
    let pipeline = PipelineBuilder::new()
        .max_queue_size(3)
        .num_consumers(1)
        .build::<u32>()
        .expect("Pipeline build failed");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        Processor::infallible(move |x: u32| {
            seen.lock().push(x);
            x
        })
    };
    pipeline.run(0..50u32, recorder).await.expect("Run failed");

    assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_priority_queue_serves_highest_first() {
    let pipeline = PipelineBuilder::new()
        .max_queue_size(32)
        .num_consumers(1)
        .priority_queue(true)
        .with_backpressure(false)
        .build::<u32>()
        .expect("Pipeline build failed");

    let gate = Arc::new(Semaphore::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = {
        let gate = Arc::clone(&gate);
        let seen = Arc::clone(&seen);
        Processor::from_async(move |x: u32| {
            let gate = Arc::clone(&gate);
            let seen = Arc::clone(&seen);
            async move {
                let _permit = gate.acquire().await.map_err(|e| e.to_string())?;
                seen.lock().push(x);
                Ok::<_, String>(x)
            }
        })
    };

    let priority = |x: u32| (x % 3) as i32;
    let source: Vec<_> = (0..10u32)
        .map(|x| Submission::with_priority(x, priority(x)))
        .collect();

    let (report, _) = tokio::join!(pipeline.run(source, processor), async {
        // nine items plus the sentinel means the producer is done
        while pipeline.queue_len() < 10 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);
    });
    assert_eq!(report.expect("Run failed").records.len(), 10);

    let seen = seen.lock().clone();
    let mut expected = seen[1..].to_vec();
    expected.sort_by_key(|&x| (std::cmp::Reverse(priority(x)), x));
    assert_eq!(seen[1..], expected[..]);
    assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), (0..10).collect());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_records_unprocessed_items() {
    let token = CancellationToken::new();
    let pipeline = PipelineBuilder::new()
        .max_queue_size(4)
        .num_consumers(1)
        .with_backpressure(false)
        .cancellation(token.clone())
        .build::<u64>()
        .expect("Pipeline build failed");

    let slow = Processor::from_async(|x: u64| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, String>(x)
    });

    let (report, _) = tokio::join!(pipeline.run(0..20u64, slow), async {
        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
    });
    let mut report = report.expect("Run failed");

    assert!(report.cancelled);
    assert!(report.records.len() < 20);
    assert!(report.succeeded() >= 2);
    assert!(report.cancelled_items() >= 1);
    assert_eq!(report.failed(), 0);

    report.sort_by_id();
    for (i, record) in report.records.iter().enumerate() {
        // every item pulled from the source has exactly one record
        assert_eq!(record.work_item_id, i as u64);
        if record.result == Err(ProcessingError::Cancelled) {
            assert_eq!(record.consumer_id, None);
        }
    }
    assert_eq!(
        report.metrics.total_cancelled,
        report.cancelled_items() as u64
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_pipeline() {
    let limiter = Arc::new(
        SlidingWindowLimiter::new(5, Duration::from_secs(1)).expect("Limiter build failed"),
    );
    let pipeline = PipelineBuilder::new()
        .max_queue_size(10)
        .num_consumers(3)
        .rate_limiter(limiter.clone())
        .build::<u32>()
        .expect("Pipeline build failed");

    let started = Instant::now();
    let report = pipeline
        .run(0..12u32, Processor::infallible(|x: u32| x + 1))
        .await
        .expect("Run failed");
    let elapsed = started.elapsed();

    assert_eq!(report.succeeded(), 12);
    // 5 at t=0, 5 at t=1s, 2 at t=2s
    assert!(elapsed >= Duration::from_secs(2), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "finished after {elapsed:?}");
    assert_eq!(limiter.statistics().allowed, 12);
    assert_eq!(limiter.statistics().rejected, 0);
}

#[tokio::test]
async fn test_stream_source() {
    let pipeline = PipelineBuilder::new()
        .num_consumers(2)
        .build::<String>()
        .expect("Pipeline build failed");

    let words = futures::stream::iter(["alpha", "beta", "gamma"].map(String::from));
    let report = pipeline
        .run_stream(words, Processor::infallible(|s: String| s.len()))
        .await
        .expect("Run failed");

    let mut lengths: Vec<_> = report
        .records
        .into_iter()
        .map(|r| r.result.expect("item failed"))
        .collect();
    lengths.sort_unstable();
    assert_eq!(lengths, vec![4, 5, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_soft_backpressure_throttles_producer() {
    let pipeline = PipelineBuilder::new()
        .max_queue_size(5)
        .num_consumers(1)
        .throttle_delay(Duration::from_millis(2))
        .build::<u32>()
        .expect("Pipeline build failed");

    let slow = Processor::from_async(|x: u32| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, String>(x)
    });
    let report = pipeline.run(0..30u32, slow).await.expect("Run failed");

    assert_eq!(report.succeeded(), 30);
    assert!(report.metrics.total_throttles > 0);
    assert!(pipeline.metrics().format().contains("Processed: 30"));
}

#[tokio::test]
async fn test_pipeline_can_run_again() {
    let pipeline = PipelineBuilder::new()
        .num_consumers(2)
        .build::<u8>()
        .expect("Pipeline build failed");
    let identity = Processor::infallible(|x: u8| x);

    let first = pipeline.run(0..5u8, identity.clone()).await.expect("Run failed");
    let second = pipeline.run(5..8u8, identity).await.expect("Run failed");

    assert_eq!(first.records.len(), 5);
    assert_eq!(second.records.len(), 3);
    // ids keep increasing across runs
    assert!(second.records.iter().all(|r| r.work_item_id >= 5));
}

#[tokio::test]
async fn test_each_report_covers_only_its_run() {
    let pipeline = PipelineBuilder::new()
        .num_consumers(2)
        .build::<u32>()
        .expect("Pipeline build failed");
    let reject_odd = Processor::from_fn(|x: u32| if x % 2 == 1 { Err("odd") } else { Ok(x) });

    let first = pipeline.run([1u32, 2, 4, 6], reject_odd.clone()).await.expect("Run failed");
    assert_eq!(first.failed(), 1);
    assert_eq!(first.metrics.total_failed, 1);

    let second = pipeline.run([8u32, 10, 12], reject_odd).await.expect("Run failed");
    assert_eq!(second.failed(), 0);
    assert_eq!(second.metrics.total_processed, 3);
    assert_eq!(second.metrics.total_failed, 0);
    assert_eq!(pipeline.metrics().total_processed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_wait_excludes_time_blocked_before_queue() {
    let pipeline = PipelineBuilder::new()
        .max_queue_size(1)
        .num_consumers(1)
        .with_backpressure(false)
        .build::<u32>()
        .expect("Pipeline build failed");
    let slow = Processor::from_async(|x: u32| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, String>(x)
    });

    let mut report = pipeline.run(0..3u32, slow).await.expect("Run failed");
    report.sort_by_id();

    assert_eq!(report.succeeded(), 3);
    // a single slot ahead of one busy consumer: nothing waits past one item
    for record in &report.records {
        assert!(
            record.wait_duration <= Duration::from_millis(101),
            "item {} waited {:?}",
            record.work_item_id,
            record.wait_duration
        );
    }
    assert!(report.metrics.total_blocks > 0);
}
