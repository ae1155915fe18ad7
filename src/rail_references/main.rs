// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::time::Duration;

use departures_service::config;
use departures_service::naptan::{run_loader, CsvLoad, Naptan};
use departures_service::repository::pipeline::RedisPipeline;

/// Loads CRS code to station ATCO code mappings from the NaPTAN
/// `RailReferences.csv` into the rail-references Redis cache.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let naptan_url = config::required("NAPTAN_CSV_DATA_SOURCE");
    let naptan_timeout = config::positive_int_or_default("NAPTAN_CSV_TIMEOUT", 60);
    let filename = config::or_default("NAPTAN_CSV_RAIL_REFERENCES_FILENAME", "RailReferences.csv");
    let redis_host = config::required("RAIL_REFERENCES_REDIS_HOST");
    let max_active = config::positive_int_or_default("RAIL_REFERENCES_REDIS_MAX_ACTIVE", 10);
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

    run_loader(&naptan, CsvLoad::rail_references(filename), &pipeline).await?;

    Ok(())
}
