// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use departures_service::config;
use departures_service::nationalrail::LdbClient;
use departures_service::pubsub::{Publisher, SnsHttpPublisher};

/// Polls the OpenLDBWS departure board for one station and publishes the
/// raw board to the pub/sub bus.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CRS code of the station to poll
    crs_code: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let url = config::required("NRE_OPENLDBWS_URL");
    let access_token = config::required("NRE_OPENLDBWS_ACCESS_TOKEN");
    let sns_topic_arn = config::required("AWS_SNS_TOPIC_ARN");
    let timeout = config::positive_int_or_default("HTTP_CLIENT_TIMEOUT", 10);

    let client = reqwest::ClientBuilder::new()
        .timeout(Duration::from_secs(timeout as u64))
        .build()?;

    let service = LdbClient {
        client: client.clone(),
        url,
        access_token,
    };

    let board = service
        .get_departure_board(&args.crs_code)
        .await
        .with_context(|| format!("cannot get departure board for {}", args.crs_code))?;

    let message = serde_json::to_string(&board)
        .with_context(|| format!("cannot marshal JSON from departure board for {}", args.crs_code))?;

    let publisher = SnsHttpPublisher::new(client, sns_topic_arn.clone());
    publisher
        .publish(&message)
        .await
        .with_context(|| format!("cannot publish message to SNS topic `{sns_topic_arn}`"))?;

    Ok(())
}
