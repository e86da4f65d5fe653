//! Provider push notifications
//!
//! Events are deduplicated twice: a bounded in-process window catches bursts of
//! redeliveries cheaply, the persisted table survives restarts. An event is
//! recorded only after it was applied, so a failed attempt stays retryable.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::providers::{ProviderError, Providers};
use crate::services::payments::PaymentService;
use crate::store::Store;
use crate::{EcommerceError, Result};

/// Bounded set of recently processed event keys; the oldest key is evicted first.
#[derive(Debug)]
pub struct RecentEvents {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, order: VecDeque::with_capacity(capacity), seen: HashSet::with_capacity(capacity) }
    }

    pub fn contains(&self, key: &str) -> bool { self.seen.contains(key) }

    /// Returns `false` if the key was already present.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        true
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed { order_id: i64 },
    Duplicate,
    Ignored,
    UnknownReference,
}

pub struct WebhookService {
    store: Arc<dyn Store>,
    providers: Providers,
    payments: Arc<PaymentService>,
    recent: Mutex<RecentEvents>,
}

impl WebhookService {
    pub fn new(store: Arc<dyn Store>, providers: Providers, payments: Arc<PaymentService>, dedup_capacity: usize) -> Self {
        Self { store, providers, payments, recent: Mutex::new(RecentEvents::new(dedup_capacity)) }
    }

    /// Applies one verified notification body from `provider`.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn handle_event(&self, provider: &str, payload: &[u8]) -> Result<WebhookOutcome> {
        let adapter = self.providers.by_name(provider).ok_or(EcommerceError::NotFound("provider"))?;
        let event = match adapter.parse_event(payload) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(WebhookOutcome::Ignored),
            Err(ProviderError::Unsupported(name)) => {
                return Err(EcommerceError::Validation(format!("{name} does not send notifications")))
            }
            Err(e) => return Err(EcommerceError::Validation(e.to_string())),
        };
        let name = adapter.name();
        let key = format!("{name}:{}", event.id);

        if self.recent.lock().contains(&key) {
            debug!(%key, "Duplicate notification (recent window)");
            return Ok(WebhookOutcome::Duplicate);
        }
        {
            let mut tx = self.store.begin().await?;
            if tx.webhook_event_seen(name, &event.id).await? {
                drop(tx);
                self.recent.lock().insert(&key);
                debug!(%key, "Duplicate notification (persisted)");
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        let applied = self.payments.apply_event(&event).await?;

        let mut tx = self.store.begin().await?;
        tx.record_webhook_event(name, &event.id).await?;
        tx.commit().await?;
        self.recent.lock().insert(&key);

        Ok(match applied {
            Some(order_id) => {
                info!(%key, order_id, event_type = %event.event_type, "Notification applied");
                WebhookOutcome::Processed { order_id }
            }
            None => WebhookOutcome::UnknownReference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{DeliveryType, PaymentMethod};
    use crate::domain::status::OrderStatus;
    use crate::services::payments::tests::Harness;

    fn card_event(id: &str, intent: &str, amount: i64) -> Vec<u8> {
        format!(r#"{{"id":"{id}","type":"payment_intent.succeeded","data":{{"object":{{"id":"{intent}","amount_received":{amount}}}}}}}"#)
            .into_bytes()
    }

    #[test]
    fn test_recent_window_evicts_oldest() {
        let mut recent = RecentEvents::new(2);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c"));
        assert!(!recent.contains("a"));
        assert!(recent.contains("c"));
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_acknowledged_once() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(10, 2, 400)], 0).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        let webhooks = WebhookService::new(Arc::new(h.store.clone()), h.providers(), h.payments.clone(), 16);
        let body = card_event("evt_1", session.reference.value(), 800);

        assert_eq!(webhooks.handle_event("card", &body).await.unwrap(), WebhookOutcome::Processed { order_id });
        assert_eq!(webhooks.handle_event("card", &body).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(h.status(order_id).await, OrderStatus::PaymentSuccessful);
        assert_eq!(h.store.stock(10).await, Some(8));

        // a fresh process only has the persisted table
        let restarted = WebhookService::new(Arc::new(h.store.clone()), h.providers(), h.payments.clone(), 16);
        assert_eq!(restarted.handle_event("card", &body).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(h.store.stock(10).await, Some(8));
    }

    #[tokio::test]
    async fn test_unknown_reference_and_ignored_types() {
        let h = Harness::new().await;
        let webhooks = WebhookService::new(Arc::new(h.store.clone()), h.providers(), h.payments.clone(), 16);
        let body = card_event("evt_9", "pi_nobody", 100);
        assert_eq!(webhooks.handle_event("card", &body).await.unwrap(), WebhookOutcome::UnknownReference);
        let other = br#"{"id":"evt_10","type":"charge.refunded","data":{"object":{"id":"ch_1"}}}"#;
        assert_eq!(webhooks.handle_event("card", other).await.unwrap(), WebhookOutcome::Ignored);
        assert!(matches!(webhooks.handle_event("card", b"{").await, Err(EcommerceError::Validation(_))));
        assert!(matches!(webhooks.handle_event("qr", b"{}").await, Err(EcommerceError::Validation(_))));
        assert!(matches!(webhooks.handle_event("cash", b"{}").await, Err(EcommerceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_wallet_capture_denied_fails_order() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Wallet, DeliveryType::Pickup, &[(11, 1, 1000)], 0).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        let webhooks = WebhookService::new(Arc::new(h.store.clone()), h.providers(), h.payments.clone(), 16);
        let body = format!(
            r#"{{"id":"WH-7","event_type":"PAYMENT.CAPTURE.DENIED","resource":{{"order_id":"{}"}}}}"#,
            session.reference.value()
        );
        assert_eq!(webhooks.handle_event("paypal", body.as_bytes()).await.unwrap(), WebhookOutcome::Processed { order_id });
        assert_eq!(h.status(order_id).await, OrderStatus::PaymentFailed);
    }

    #[tokio::test]
    async fn test_event_amount_mismatch_is_acknowledged_but_not_paid() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(10, 1, 400)], 0).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        let webhooks = WebhookService::new(Arc::new(h.store.clone()), h.providers(), h.payments.clone(), 16);
        let body = card_event("evt_2", session.reference.value(), 300);
        assert_eq!(webhooks.handle_event("card", &body).await.unwrap(), WebhookOutcome::Processed { order_id });
        assert_eq!(h.status(order_id).await, OrderStatus::PaymentFailed);
    }
}
