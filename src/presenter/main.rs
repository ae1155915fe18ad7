// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use std::sync::Arc;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use qstring::QString;

use departures_service::config;
use departures_service::repository::RedisStore;

mod board;

use board::{Presenter, PresenterError};

async fn departures_board(presenter: web::Data<Presenter>, req: HttpRequest) -> impl Responder {
    let qs = QString::from(req.query_string());

    let Some(atcocode) = qs.get("atcocode") else {
        return HttpResponse::BadRequest()
            .insert_header(("Content-Type", "text/plain"))
            .body("atcocode is required");
    };

    match presenter.board(atcocode, qs.get("top")).await {
        Ok(output) => match serde_json::to_string(&output) {
            Ok(body) => HttpResponse::Ok()
                .insert_header(("Content-Type", "application/json"))
                .body(body),
            Err(e) => {
                log::error!("cannot marshal board: {e}");
                HttpResponse::InternalServerError().finish()
            }
        },
        Err(e) if e.is_validation() => HttpResponse::BadRequest()
            .insert_header(("Content-Type", "text/plain"))
            .body(e.to_string()),
        Err(e) => {
            log::error!("{e}");
            HttpResponse::InternalServerError()
                .insert_header(("Content-Type", "text/plain"))
                .body(e.to_string())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let departures_host = config::required("DEPARTURES_REDIS_HOST");
    let port = config::positive_int_or_default("PRESENTER_PORT", 8080) as u16;

    let presenter = Presenter {
        store: Arc::new(RedisStore::connect(&departures_host).await?),
    };

    let data = web::Data::new(presenter);

    log::info!("presenter listening on port {port}");

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/", web::get().to(departures_board))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    Ok(())
}
