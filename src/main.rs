// SPDX-License-Identifier: Apache-2.0
use actix_web::{web, App, HttpServer};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

use meshgate::config::GatewayConfig;
use meshgate::gateway::{self, AppState};
use meshgate::logging::{self, LogFormat};
use meshgate::memory_session_store::MemorySessionStore;
use meshgate::middleware::AuthMiddleware;
use meshgate::routes::RouteTable;

const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();
    logging::init("meshgate", LogFormat::from_env());

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    let routes = match RouteTable::load(&config.routes_file, &config.idp.prefix) {
        Ok(routes) => routes,
        Err(e) => {
            error!(error = %e, path = %config.routes_file.display(), "Invalid route table");
            std::process::exit(1);
        }
    };
    if routes.iter().next().is_none() {
        warn!("Route table is empty; only gateway endpoints will answer");
    }

    let bind = config.bind.clone();
    info!(
        bind = %bind,
        core = %config.core_url,
        idp = %config.idp.backend_url,
        services = routes.iter().count(),
        "Starting meshgate"
    );

    let state = web::Data::new(AppState::new(config, routes));
    let store = MemorySessionStore::new();

    let pruner = state.clone();
    actix_web::rt::spawn(async move {
        let mut interval = actix_web::rt::time::interval(LIMITER_PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            pruner.limiter.prune();
        }
    });

    HttpServer::new(move || {
        let idp_prefix = state.config.idp.prefix.clone();
        App::new()
            .app_data(state.clone())
            .app_data(web::Data::new(gateway::http_client()))
            .configure(|cfg| gateway::configure(cfg, &idp_prefix))
            .wrap(AuthMiddleware::new())
            .wrap(gateway::session_middleware(&state.config, store.clone()))
            .wrap(TracingLogger::default())
    })
    .bind(bind)?
    .client_request_timeout(Duration::from_secs(60))
    .run()
    .await
}
