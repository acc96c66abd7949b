//! Adaptive batch sizing against a simulated bulk insert
//!
//! Each insert pays a fixed 20ms round trip plus 2ms per row. The adaptive
//! processor starts with tiny batches and settles near the size that keeps
//! each insert around the 150ms target. A slow trickle at the end shows the
//! auto-flush timer dispatching partial batches.
//!
//! Usage: cargo run --example adaptive_batching

use std::time::Duration;
use throttled_pipeline::{
    init_logging, AdaptiveBatchProcessor, AdaptiveConfig, BatchConfig, BatchFn, LogConfig,
    Processor, Result,
};

fn bulk_insert() -> BatchFn<u32, u64> {
    Processor::from_async(|rows: Vec<u32>| async move {
        let cost = 20 + 2 * rows.len() as u64;
        tokio::time::sleep(Duration::from_millis(cost)).await;
        Ok::<_, String>(rows.into_iter().map(|r| r as u64 + 1_000_000).collect())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(&LogConfig::default())?;

    let processor = AdaptiveBatchProcessor::new(
        bulk_insert(),
        AdaptiveConfig::default()
            .with_initial_batch_size(4)
            .with_bounds(1, 500)
            .with_target_duration(Duration::from_millis(150))
            .with_adjustment_factor(0.25),
        BatchConfig::default().with_auto_flush(Duration::from_millis(200)),
    )?;

    println!("=== Bulk load ===");
    for batch in processor.add_many(0..1500).await {
        println!(
            "  batch {:>3}: {:>3} rows in {:>7.1?} -> next size {}",
            batch.batch_id,
            batch.len(),
            batch.duration(),
            processor.current_batch_size()
        );
    }
    if let Some(tail) = processor.flush().await {
        println!("  final partial batch: {} rows", tail.len());
    }

    println!("\n=== Slow trickle with auto-flush ===");
    let auto_flush = processor.start_auto_flush()?;
    for row in 0..10 {
        processor.add(10_000 + row).await;
        tokio::time::sleep(Duration::from_millis(90)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    auto_flush.stop().await;
    for batch in processor.take_completed() {
        println!("  auto-flushed batch {}: {:?}", batch.batch_id, batch.items);
    }

    let stats = processor.statistics();
    println!(
        "\nBatches: {} ({} failed), items: {}, {:.0} items/s, average size {:.1}",
        stats.total_batches,
        stats.failed_batches,
        stats.total_items,
        stats.items_per_second,
        stats.average_batch_size
    );
    Ok(())
}
