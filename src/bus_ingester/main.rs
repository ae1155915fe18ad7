// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};

use departures_service::config;
use departures_service::pubsub::SnsEvent;
use departures_service::repository::RedisStore;

mod ingester;

use ingester::Ingester;

async fn events(ingester: web::Data<Ingester>, event: web::Json<SnsEvent>) -> impl Responder {
    match ingester.handle(event.into_inner()).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let departures_host = config::required("DEPARTURES_REDIS_HOST");
    let locality_names_host = config::required("LOCALITY_NAMES_REDIS_HOST");
    let stops_in_area_host = config::required("STOPS_IN_AREA_REDIS_HOST");
    let circular_services_host = config::required("CIRCULAR_SERVICES_REDIS_HOST");
    let port = config::positive_int_or_default("BUS_INGESTER_PORT", 8081) as u16;

    let ingester = Ingester {
        departures: Arc::new(RedisStore::connect(&departures_host).await?),
        locality_names: Arc::new(RedisStore::connect(&locality_names_host).await?),
        stops_in_area: Arc::new(RedisStore::connect(&stops_in_area_host).await?),
        circular_services: Arc::new(RedisStore::connect(&circular_services_host).await?),
    };

    let data = web::Data::new(ingester);

    log::info!("bus ingester listening on port {port}");

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
