// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use tokio::sync::{mpsc, watch};

use departures_service::config;
use departures_service::repository::pipeline::RedisPipeline;
use departures_service::transxchange::download_latest_zip;

mod loader;

use loader::Counters;

/// Rebuilds the circular-services cache from the most recent TransXChange
/// bundle in object storage.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let redis_host = config::required("CIRCULAR_SERVICES_REDIS_HOST");
    let max_active = config::positive_int_or_default("CIRCULAR_SERVICES_REDIS_MAX_ACTIVE", 10);
    let flush_after = config::positive_int_or_default("FLUSH_AFTER", 10000);
    let bucket = config::required("TXC_S3_BUCKET");
    let prefix = std::env::var("TXC_S3_PREFIX").ok().filter(|p| !p.is_empty());
    let search_terms: Vec<String> = config::required("SEARCH_TERMS")
        .split(';')
        .map(String::from)
        .collect();

    let store = AmazonS3Builder::from_env()
        .with_bucket_name(&bucket)
        .build()?;

    let prefix_path = prefix.map(Path::from);
    let zip_bytes = download_latest_zip(&store, prefix_path.as_ref()).await?;

    let pipeline = RedisPipeline {
        flush_after: flush_after as usize,
        max_active: max_active as usize,
        client: redis::Client::open(format!("redis://{redis_host}"))?,
    };

    let counters = Counters::default();
    let today = Utc::now().date_naive();

    let (exit_tx, exit_rx) = watch::channel(false);
    let (send, receive) = mpsc::channel(pipeline.flush_after);

    let processed = loader::process_transxchange_files(
        &zip_bytes,
        &search_terms,
        today,
        send,
        exit_rx.clone(),
        &counters,
    );
    let piped = pipeline.run(exit_rx, receive);

    let (process_errors, pipe_result) = tokio::join!(processed, piped);
    drop(exit_tx);

    let mut failed = false;
    for error in &process_errors {
        log::error!("{error}");
        failed = true;
    }
    if let Err(e) = pipe_result {
        log::error!("{e}");
        failed = true;
    }

    log::info!("stored {} record(s) in the Redis cache", counters.records_added());
    log::info!("skipped {} file(s)", counters.files_skipped());

    if failed {
        anyhow::bail!("an error occurred performing a concurrent operation: see previous log output");
    }

    Ok(())
}
