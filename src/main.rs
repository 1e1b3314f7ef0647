use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod activity;
mod api;
mod balance;
mod config;
mod error;
mod exchange;
mod identity;
mod schemas;
mod store;
mod sync;

use crate::config::{Backend, ServiceConfig};
use crate::store::{memory::MemoryLedgerStore, mongo::MongoLedgerStore, LedgerStore};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("opensplit_ledger=info,actix_web=info")),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    let store: Arc<dyn LedgerStore> = match config.backend {
        Backend::Mongo => {
            let uri = config.mongodb_uri.as_deref().unwrap_or_default();
            info!(database = %config.database, "Connecting to MongoDB");
            Arc::new(
                MongoLedgerStore::connect(uri, &config.database)
                    .await
                    .context("failed to connect")?,
            )
        }
        Backend::Memory => {
            info!("Using the in-memory ledger store");
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let sessions = web::Data::new(api::Sessions::new(store));
    info!(addr = %config.http_addr, "Listening");
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(sessions.clone())
            .configure(api::configure)
    })
    .bind(config.http_addr.as_str())?
    .run()
    .await?;
    Ok(())
}
