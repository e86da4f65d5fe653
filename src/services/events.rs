//! Best-effort domain event publishing

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::events::DomainEvent;

/// Publishes to NATS when a client is configured. Failures are logged and dropped.
#[derive(Clone, Default)]
pub struct EventBus {
    nats: Option<async_nats::Client>,
    log: Option<Arc<Mutex<Vec<DomainEvent>>>>,
}

impl EventBus {
    pub fn new(nats: Option<async_nats::Client>) -> Self { Self { nats, log: None } }

    /// A bus that keeps every event in memory instead of publishing it.
    pub fn recording() -> Self { Self { nats: None, log: Some(Arc::default()) } }

    pub fn recorded(&self) -> Vec<DomainEvent> {
        self.log.as_ref().map(|l| l.lock().clone()).unwrap_or_default()
    }

    pub async fn publish(&self, event: DomainEvent) {
        if let Some(log) = &self.log {
            log.lock().push(event.clone());
        }
        let Some(client) = &self.nats else {
            debug!(kind = event.kind(), ?event, "Domain event");
            return;
        };
        let subject = format!("storefront.{}", event.kind());
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                    warn!(%subject, error = %e, "Failed to publish domain event");
                }
            }
            Err(e) => warn!(%subject, error = %e, "Failed to encode domain event"),
        }
    }
}
