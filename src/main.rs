//! Storefront Payments - checkout, payment and refund service

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_payments::http::{router, AppState};
use storefront_payments::providers::{Providers, SandboxCardProvider, SandboxQrProvider, SandboxWalletProvider};
use storefront_payments::services::{AppServices, EventBus};
use storefront_payments::store::{MemoryStore, PgStore, Store};
use storefront_payments::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    let config = AppConfig::from_env()?;

    let store: Arc<dyn Store> = match config.database_url.as_deref() {
        Some(url) => {
            let pg = PgStore::connect(url, config.db_max_connections).await?;
            pg.migrate().await?;
            Arc::new(pg)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let nats = match config.nats_url.as_deref() {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, domain events will only be logged");
                None
            }
        },
        None => None,
    };

    let providers = Providers {
        card: Arc::new(SandboxCardProvider::new(true)),
        wallet: Arc::new(SandboxWalletProvider::new(true)),
        qr: Arc::new(SandboxQrProvider::new(true)),
    };
    let services = AppServices::new(store, providers, EventBus::new(nats), &config);
    let app = router(AppState::new(services, &config));

    tracing::info!("🚀 Storefront payments listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
