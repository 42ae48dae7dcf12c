#[macro_use]
extern crate diesel;

use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use diesel::{prelude::*, r2d2};

mod actions;
mod config;
mod coordinator;
mod errors;
mod handlers;
mod memory;
mod models;
mod queue;
mod reconciler;
mod retry;
mod schema;
mod store;
#[cfg(test)]
mod test_support;

use config::{Config, StoreBackend};
use coordinator::ReservationCoordinator;
use handlers::AppState;
use memory::{MemoryStore, SeedRoom};
use reconciler::PaymentReconciler;
use store::{Backend, DbPool, PgStore};

type StartupError = Box<dyn std::error::Error + Send + Sync>;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().map_err(startup_failure)?;
    let backend = Arc::new(initialize_backend(&config).map_err(startup_failure)?);

    let coordinator = Arc::new(ReservationCoordinator::new(
        Arc::clone(&backend),
        config.retry,
        config.max_stay_days,
    ));
    let reconciler = Arc::new(PaymentReconciler::new(Arc::clone(&backend), config.retry));

    let queue_service = match &config.amqp {
        Some(settings) => {
            let mut queue_service = queue::QueueService::new(settings.clone());
            match queue_service.initialize().await {
                Ok(()) => {
                    if let Err(e) = queue_service
                        .start_consuming_payment_callbacks(Arc::clone(&reconciler))
                        .await
                    {
                        log::error!("Failed to start payment callback consumer: {:?}", e);
                    }
                    Some(queue_service)
                }
                Err(e) => {
                    log::error!("RabbitMQ unavailable, continuing with the HTTP webhook only: {:?}", e);
                    None
                }
            }
        }
        None => {
            log::info!("Messaging disabled; payment callbacks arrive through the HTTP webhook only");
            None
        }
    };

    let state = web::Data::new(AppState {
        coordinator,
        reconciler,
        queue: queue_service,
    });

    log::info!("starting HTTP server at http://{}:{}", config.bind_addr, config.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .app_data(handlers::json_config())
            .app_data(handlers::path_config())
            .configure(handlers::configure)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await
}

fn initialize_backend(config: &Config) -> Result<Backend, StartupError> {
    match config.backend {
        StoreBackend::Postgres => {
            let conn_spec = config.database_url.clone().ok_or("DATABASE_URL should be set")?;
            let manager = r2d2::ConnectionManager::<PgConnection>::new(conn_spec);
            let pool: DbPool = r2d2::Pool::builder()
                .max_size(config.db_pool_size)
                .build(manager)?;
            log::info!("Using Postgres store (pool size {})", config.db_pool_size);
            Ok(Backend::Postgres(PgStore::new(pool)))
        }
        StoreBackend::Memory => {
            let rooms: Vec<SeedRoom> = match &config.memory_seed_file {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => Vec::new(),
            };
            log::warn!("Using in-memory store with {} seeded rooms; data is lost on restart", rooms.len());
            Ok(Backend::Memory(MemoryStore::from_seed(rooms)?))
        }
    }
}

fn startup_failure<E: std::fmt::Display>(e: E) -> std::io::Error {
    log::error!("Startup failed: {}", e);
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}
