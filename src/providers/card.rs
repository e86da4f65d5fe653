//! Tokenized card processor (payment-intent protocol)
//!
//! Sandbox implementation: intents live in process memory and move through the
//! same states the hosted processor reports (`requires_confirmation`, `succeeded`,
//! `canceled`). With `auto_approve` a retrieve settles the intent for its full
//! amount, standing in for the customer completing card entry client-side.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::aggregates::{PaymentMethod, ProviderRef, ProviderRefs};
use crate::domain::value_objects::IdempotencyKey;
use crate::providers::{
    IdempotencyLedger, Outcome, PaymentProvider, PaymentRequest, PaymentSession, ProviderError, ProviderEvent,
    RefundReceipt, RefundRequest, Settlement,
};

/// Maps the processor's intent status onto the shared outcome.
pub fn normalize_status(raw: &str) -> Outcome {
    match raw.trim().to_ascii_lowercase().as_str() {
        "succeeded" => Outcome::SUCCESS,
        "canceled" | "cancelled" | "failed" | "payment_failed" => Outcome::FAIL,
        _ => Outcome::PENDING,
    }
}

#[derive(Debug, Clone)]
struct Intent {
    amount: i64,
    status: String,
    amount_received: i64,
    refunded: i64,
}

#[derive(Default)]
struct CardState {
    intents: HashMap<String, Intent>,
    creates: IdempotencyLedger,
    refunds: IdempotencyLedger,
    refund_failure: Option<String>,
}

pub struct SandboxCardProvider {
    auto_approve: bool,
    state: Mutex<CardState>,
}

impl SandboxCardProvider {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve, state: Mutex::new(CardState::default()) }
    }

    /// Marks the intent succeeded, reporting `amount_received` minor units.
    pub fn succeed(&self, intent_id: &str, amount_received: i64) {
        if let Some(intent) = self.state.lock().intents.get_mut(intent_id) {
            intent.status = "succeeded".into();
            intent.amount_received = amount_received;
        }
    }

    pub fn decline(&self, intent_id: &str) {
        if let Some(intent) = self.state.lock().intents.get_mut(intent_id) {
            intent.status = "canceled".into();
        }
    }

    /// Makes every following refund call fail with `reason`, or succeed again with `None`.
    pub fn fail_refunds(&self, reason: Option<&str>) {
        self.state.lock().refund_failure = reason.map(str::to_string);
    }

    pub fn create_calls(&self, key: &IdempotencyKey) -> u32 { self.state.lock().creates.calls(key) }
    pub fn intents_created(&self) -> usize { self.state.lock().creates.objects_created() }
    pub fn refunds_created(&self) -> usize { self.state.lock().refunds.objects_created() }
}

#[derive(Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Deserialize)]
struct WebhookData { object: WebhookIntent }

#[derive(Deserialize)]
struct WebhookIntent {
    id: String,
    #[serde(default)]
    amount_received: Option<i64>,
}

#[async_trait]
impl PaymentProvider for SandboxCardProvider {
    fn method(&self) -> PaymentMethod { PaymentMethod::Card }

    async fn create_payment(&self, req: &PaymentRequest) -> Result<PaymentSession, ProviderError> {
        if req.amount_minor <= 0 {
            return Err(ProviderError::Rejected("amount must be greater than zero".into()));
        }
        let mut state = self.state.lock();
        let id = match state.creates.lookup(&req.idempotency_key) {
            Some(existing) => {
                debug!(order_id = req.order_id, intent_id = %existing, "Idempotent replay of intent creation");
                existing
            }
            None => {
                let id = format!("pi_{}", Uuid::new_v4().simple());
                state.intents.insert(
                    id.clone(),
                    Intent { amount: req.amount_minor, status: "requires_confirmation".into(), amount_received: 0, refunded: 0 },
                );
                state.creates.remember(&req.idempotency_key, &id);
                info!(order_id = req.order_id, intent_id = %id, amount = req.amount_minor, "Created card payment intent");
                id
            }
        };
        Ok(PaymentSession {
            client_secret: Some(format!("{id}_secret_{}", Uuid::new_v4().simple())),
            reference: ProviderRef::PaymentIntent(id),
            secondary: None,
            approve_url: None,
            qr_image: None,
        })
    }

    async fn settle(&self, refs: &ProviderRefs) -> Result<Settlement, ProviderError> {
        let intent_id = refs
            .payment_intent_id
            .as_deref()
            .ok_or_else(|| ProviderError::Rejected("order has no payment intent".into()))?;
        let mut state = self.state.lock();
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| ProviderError::Rejected(format!("no such intent {intent_id}")))?;
        if self.auto_approve && normalize_status(&intent.status) == Outcome::PENDING {
            intent.status = "succeeded".into();
            intent.amount_received = intent.amount;
        }
        let outcome = normalize_status(&intent.status);
        Ok(Settlement {
            outcome,
            amount_minor: outcome.success.then_some(intent.amount_received),
            capture: None,
            raw_status: intent.status.clone(),
        })
    }

    async fn refund(&self, req: &RefundRequest) -> Result<RefundReceipt, ProviderError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.refund_failure.clone() {
            return Err(ProviderError::Rejected(reason));
        }
        if let Some(existing) = state.refunds.lookup(&req.idempotency_key) {
            return Ok(RefundReceipt { raw: serde_json::json!({"id": existing, "status": "succeeded"}), provider_ref: existing });
        }
        let intent = state
            .intents
            .get_mut(&req.settlement_ref)
            .ok_or_else(|| ProviderError::Rejected(format!("no such intent {}", req.settlement_ref)))?;
        if intent.refunded + req.amount_minor > intent.amount_received {
            return Err(ProviderError::Rejected("refund exceeds captured amount".into()));
        }
        intent.refunded += req.amount_minor;
        let id = format!("re_{}", Uuid::new_v4().simple());
        state.refunds.remember(&req.idempotency_key, &id);
        Ok(RefundReceipt {
            raw: serde_json::json!({"id": id, "status": "succeeded", "amount": req.amount_minor, "currency": req.currency}),
            provider_ref: id,
        })
    }

    fn parse_event(&self, payload: &[u8]) -> Result<Option<ProviderEvent>, ProviderError> {
        let env: WebhookEnvelope = serde_json::from_slice(payload).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let outcome = match env.event_type.as_str() {
            "payment_intent.succeeded" => Outcome::SUCCESS,
            "payment_intent.payment_failed" | "payment_intent.canceled" => Outcome::FAIL,
            _ => return Ok(None),
        };
        Ok(Some(ProviderEvent {
            id: env.id,
            event_type: env.event_type,
            reference: ProviderRef::PaymentIntent(env.data.object.id),
            outcome,
            amount_minor: env.data.object.amount_received.filter(|_| outcome.success),
        }))
    }
}
