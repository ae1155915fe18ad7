// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::time::Duration;

use departures_service::config;
use departures_service::naptan::{run_loader, CsvLoad, Naptan};
use departures_service::repository::pipeline::RedisPipeline;

/// Loads stop ATCO code to locality name mappings from the NaPTAN
/// `Stops.csv` into the locality-names Redis cache.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let naptan_url = config::required("NAPTAN_CSV_DATA_SOURCE");
    let naptan_timeout = config::positive_int_or_default("NAPTAN_CSV_TIMEOUT", 60);
    let stops_filename = config::or_default("NAPTAN_CSV_STOPS_FILENAME", "Stops.csv");
    let redis_host = config::required("LOCALITY_NAMES_REDIS_HOST");
    let max_active = config::positive_int_or_default("LOCALITY_NAMES_REDIS_MAX_ACTIVE", 10);
    let flush_after = config::positive_int_or_default("FLUSH_AFTER", 10000);

    let naptan = Naptan {
        client: reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(naptan_timeout as u64))
            .build()?,
        url: naptan_url,
    };

    let pipeline = RedisPipeline {
        flush_after: flush_after as usize,
        max_active: max_active as usize,
        client: redis::Client::open(format!("redis://{redis_host}"))?,
    };

    run_loader(&naptan, CsvLoad::locality_names(stops_filename), &pipeline).await?;

    Ok(())
}
