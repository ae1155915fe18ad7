// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer};

use departures_service::config;
use departures_service::siri::duration::IsoDuration;

mod delivery;
mod heartbeat;
mod proxy;

use proxy::ProxyState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let server_url = config::required("SIRI_PROXY_SERVER_URL");
    reqwest::Url::parse(&server_url)
        .map_err(|e| anyhow::anyhow!("SIRI_PROXY_SERVER_URL {server_url} is invalid: {e}"))?;

    let server_port = config::required("SIRI_PROXY_SERVER_PORT");
    let server_port: u16 = server_port
        .parse()
        .map_err(|_| anyhow::anyhow!("SIRI_PROXY_SERVER_PORT {server_port} is invalid"))?;

    let target_url = config::required("SIRI_PROXY_TARGET_URL");
    reqwest::Url::parse(&target_url)
        .map_err(|e| anyhow::anyhow!("SIRI_PROXY_TARGET_URL {target_url} is invalid: {e}"))?;

    let default_interval_string =
        config::or_default("SIRI_DEFAULT_HEARTBEAT_NOTIFICATION_INTERVAL", "PT5M");
    let default_heartbeat_interval = IsoDuration::parse(&default_interval_string)
        .map_err(|e| {
            anyhow::anyhow!(
                "invalid SIRI_DEFAULT_HEARTBEAT_NOTIFICATION_INTERVAL provided: {default_interval_string}: {e}"
            )
        })?
        .to_std();

    let timeout = config::positive_int_or_default("HTTP_CLIENT_TIMEOUT", 10);

    let state = Arc::new(ProxyState::new(
        server_url,
        target_url,
        reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(timeout as u64))
            .build()?,
        default_heartbeat_interval,
    ));

    let data = web::Data::from(Arc::clone(&state));

    log::info!("siri proxy listening on port {server_port}");

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/", web::post().to(proxy::handle))
            .default_service(web::route().to(|| async { HttpResponse::MethodNotAllowed().finish() }))
    })
    .bind(("0.0.0.0", server_port))?
    .run()
    .await?;

    Ok(())
}
