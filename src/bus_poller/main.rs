// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use departures_service::config;
use departures_service::optis::OptisClient;
use departures_service::pubsub::SnsHttpPublisher;
use departures_service::siri::duration::IsoDuration;

mod poller;

use poller::BusPoller;

/// Polls the upstream SIRI endpoint for one stop and publishes the
/// departures to the pub/sub bus.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ATCO code of the stop to poll
    atcocode: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let optis_url = config::required("OPTIS_STOP_MONITORING_REQUEST_URL");
    let optis_api_key = config::required("OPTIS_API_KEY");
    let optis_requestor_ref = config::required("OPTIS_REQUESTOR_REF");
    let preview_interval_string = config::required("OPTIS_PREVIEW_INTERVAL");
    let maximum_stop_visits = config::required("OPTIS_MAXIMUM_STOP_VISITS");
    let optis_timeout = config::positive_int_or_default("OPTIS_TIMEOUT", 30);
    let sns_topic_arn = config::required("AWS_SNS_TOPIC_ARN");

    let preview_interval = IsoDuration::parse(&preview_interval_string).map_err(|e| {
        anyhow::anyhow!("OPTIS_PREVIEW_INTERVAL value `{preview_interval_string}` is not a valid ISO8601 duration: {e}")
    })?;

    let maximum_stop_visits: i64 = maximum_stop_visits
        .parse()
        .map_err(|_| anyhow::anyhow!("OPTIS_MAXIMUM_STOP_VISITS value `{maximum_stop_visits}` is not valid"))?;

    let client = reqwest::ClientBuilder::new()
        .timeout(Duration::from_secs(optis_timeout as u64))
        .build()?;

    let poller = BusPoller {
        api: Arc::new(OptisClient {
            client: client.clone(),
            url: optis_url,
            api_key: optis_api_key,
        }),
        publisher: Arc::new(SnsHttpPublisher::new(client, sns_topic_arn)),
        requestor_ref: optis_requestor_ref,
        preview_interval,
        maximum_stop_visits,
    };

    poller.handle(&args.atcocode).await?;

    Ok(())
}
