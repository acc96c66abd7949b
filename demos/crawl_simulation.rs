//! Polite crawler simulation
//!
//! Feeds a list of fake URLs through a rate-limited pipeline. Seed pages are
//! submitted with a higher priority, a few URLs "404", and the run ends with
//! a summary of results and pipeline metrics.
//!
//! Usage: cargo run --example crawl_simulation [config.toml]
//!        THROTTLE_RATE=20 THROTTLE_LOG_LEVEL=debug cargo run --example crawl_simulation

use rand::Rng;
use std::time::Duration;
use throttled_pipeline::{
    init_logging, PipelineBuilder, ProcessingError, Processor, RateLimiter, Result, Submission,
    ThrottleConfig,
};

#[derive(Debug, Clone)]
struct Page {
    url: String,
    is_seed: bool,
}

async fn fetch(page: Page) -> std::result::Result<usize, String> {
    let latency = rand::thread_rng().gen_range(20..120);
    tokio::time::sleep(Duration::from_millis(latency)).await;
    if page.url.ends_with("/missing") {
        return Err(format!("404 for {}", page.url));
    }
    Ok(page.url.len() * 100 + latency as usize)
}

fn frontier() -> Vec<Submission<Page>> {
    let hosts = ["news.example", "blog.example", "wire.example"];
    let mut pages = Vec::new();
    for (h, host) in hosts.iter().enumerate() {
        pages.push(Page {
            url: format!("https://{host}/"),
            is_seed: true,
        });
        for article in 0..8 {
            let path = if (article + h) % 7 == 0 {
                "missing".to_string()
            } else {
                format!("articles/{article}")
            };
            pages.push(Page {
                url: format!("https://{host}/{path}"),
                is_seed: false,
            });
        }
    }
    pages
        .into_iter()
        .map(|page| {
            let priority = if page.is_seed { 10 } else { 0 };
            Submission::with_priority(page, priority)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ThrottleConfig::from_file(path)?,
        None => ThrottleConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    init_logging(&config.logging)?;

    let limiter = config.limiter.build()?;
    let pipeline = PipelineBuilder::from_config(config.pipeline.clone().with_priority_queue(true))
        .rate_limiter(limiter.clone())
        .build::<Page>()?;

    let pages = frontier();
    println!(
        "Crawling {} pages at {} req / {:?} with {} workers",
        pages.len(),
        config.limiter.rate,
        config.limiter.per,
        pipeline.num_consumers()
    );

    let mut report = pipeline.run(pages, Processor::from_async(fetch)).await?;
    report.sort_by_id();

    for record in &report.records {
        match &record.result {
            Ok(bytes) => println!(
                "  #{:<3} ok    {:>6} bytes  waited {:>8.1?}  fetched in {:>8.1?}",
                record.work_item_id, bytes, record.wait_duration, record.process_duration
            ),
            Err(ProcessingError::Cancelled) => {
                println!("  #{:<3} cancelled", record.work_item_id)
            }
            Err(err) => println!("  #{:<3} error {}", record.work_item_id, err),
        }
    }

    println!("\nSucceeded: {}, failed: {}", report.succeeded(), report.failed());
    println!("Metrics: {}", report.metrics.format());
    let stats = limiter.statistics();
    println!(
        "Limiter: allowed {}, rejected {}, total wait {:.2?}",
        stats.allowed, stats.rejected, stats.total_wait_time
    );
    Ok(())
}
