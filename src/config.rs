//! Service configuration loaded from the environment

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{EcommerceError, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub app_base_url: String,
    pub currency: String,
    pub shipping_fee: Decimal,
    pub webhook_secret: Option<String>,
    pub webhook_dedup_capacity: usize,
    pub qr_poll_interval: Duration,
    pub checkout_intent_ttl: Duration,
    pub nats_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8083,
            database_url: None,
            db_max_connections: 10,
            app_base_url: "http://localhost:8083".into(),
            currency: "SGD".into(),
            shipping_fee: Decimal::new(200, 2),
            webhook_secret: None,
            webhook_dedup_capacity: 1000,
            qr_poll_interval: Duration::from_millis(3000),
            checkout_intent_ttl: Duration::from_secs(1800),
            nats_url: None,
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.parse::<T>().map_err(|e| EcommerceError::Validation(format!("Invalid {name}: {e}"))),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let port = parsed("PORT", defaults.port)?;
        let shipping_fee = parsed("SHIPPING_FEE", defaults.shipping_fee)?;
        if shipping_fee.is_sign_negative() {
            return Err(EcommerceError::Validation("SHIPPING_FEE must not be negative".into()));
        }

        let config = Self {
            port,
            database_url: var("DATABASE_URL"),
            db_max_connections: parsed("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            app_base_url: var("APP_BASE_URL").unwrap_or_else(|| format!("http://localhost:{port}")),
            currency: var("CURRENCY").unwrap_or(defaults.currency).to_uppercase(),
            shipping_fee,
            webhook_secret: var("WEBHOOK_SECRET"),
            webhook_dedup_capacity: parsed("WEBHOOK_DEDUP_CAPACITY", defaults.webhook_dedup_capacity)?.max(1),
            qr_poll_interval: Duration::from_millis(parsed("QR_POLL_INTERVAL_MS", 3000u64)?.max(100)),
            checkout_intent_ttl: Duration::from_secs(parsed("CHECKOUT_INTENT_TTL_SECS", 1800u64)?),
            nats_url: var("NATS_URL"),
        };

        tracing::info!(
            port = config.port,
            persistent = config.database_url.is_some(),
            currency = %config.currency,
            signed_webhooks = config.webhook_secret.is_some(),
            "Configuration loaded"
        );
        Ok(config)
    }
}
