// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};

use departures_service::config;
use departures_service::pubsub::SnsEvent;
use departures_service::repository::RedisStore;

mod ingester;

use ingester::RailIngester;

async fn events(ingester: web::Data<RailIngester>, event: web::Json<SnsEvent>) -> impl Responder {
    match ingester.handle(event.into_inner()).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let departures_host = config::required("DEPARTURES_REDIS_HOST");
    let rail_references_host = config::required("RAIL_REFERENCES_REDIS_HOST");
    let port = config::positive_int_or_default("RAIL_INGESTER_PORT", 8082) as u16;

    let ingester = RailIngester {
        departures: Arc::new(RedisStore::connect(&departures_host).await?),
        rail_references: Arc::new(RedisStore::connect(&rail_references_host).await?),
        time_zone: chrono_tz::Europe::London,
    };

    let data = web::Data::new(ingester);

    log::info!("rail ingester listening on port {port}");

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/", web::post().to(events))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    Ok(())
}
