//! Wallet redirect processor (create order, approve off-site, capture)
//!
//! Sandbox implementation. Orders start `CREATED`; the customer approving on the
//! wallet's site moves them to `APPROVED`; capture yields a capture id and the
//! captured amount. With `auto_approve` a capture of a `CREATED` order succeeds.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::domain::aggregates::{PaymentMethod, ProviderRef, ProviderRefs};
use crate::domain::value_objects::{to_minor_units, IdempotencyKey};
use crate::providers::{
    IdempotencyLedger, Outcome, PaymentProvider, PaymentRequest, PaymentSession, ProviderError, ProviderEvent,
    RefundReceipt, RefundRequest, Settlement,
};

pub fn normalize_status(raw: &str) -> Outcome {
    match raw.trim().to_ascii_uppercase().as_str() {
        "COMPLETED" => Outcome::SUCCESS,
        "DECLINED" | "VOIDED" | "FAILED" | "DENIED" => Outcome::FAIL,
        _ => Outcome::PENDING,
    }
}

#[derive(Debug, Clone)]
struct WalletOrder {
    amount: i64,
    status: String,
    capture_id: Option<String>,
    captured: i64,
    refunded: i64,
}

#[derive(Default)]
struct WalletState {
    orders: HashMap<String, WalletOrder>,
    captures: HashMap<String, String>,
    creates: IdempotencyLedger,
    refunds: IdempotencyLedger,
    capture_override: HashMap<String, i64>,
}

pub struct SandboxWalletProvider {
    auto_approve: bool,
    checkout_base: String,
    state: Mutex<WalletState>,
}

impl SandboxWalletProvider {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve, checkout_base: "https://wallet.sandbox/checkoutnow".into(), state: Mutex::new(WalletState::default()) }
    }

    pub fn approve(&self, wallet_order_id: &str) {
        if let Some(order) = self.state.lock().orders.get_mut(wallet_order_id) {
            order.status = "APPROVED".into();
        }
    }

    pub fn decline(&self, wallet_order_id: &str) {
        if let Some(order) = self.state.lock().orders.get_mut(wallet_order_id) {
            order.status = "DECLINED".into();
        }
    }

    /// Forces the next capture of this order to report a different amount.
    pub fn capture_amount(&self, wallet_order_id: &str, amount_minor: i64) {
        self.state.lock().capture_override.insert(wallet_order_id.to_string(), amount_minor);
    }

    pub fn create_calls(&self, key: &IdempotencyKey) -> u32 { self.state.lock().creates.calls(key) }
    pub fn orders_created(&self) -> usize { self.state.lock().creates.objects_created() }
}

#[derive(Deserialize)]
struct WebhookEnvelope {
    id: String,
    event_type: String,
    resource: WebhookResource,
}

#[derive(Deserialize)]
struct WebhookResource {
    order_id: String,
    #[serde(default)]
    amount: Option<WebhookAmount>,
}

#[derive(Deserialize)]
struct WebhookAmount { value: String }

#[async_trait]
impl PaymentProvider for SandboxWalletProvider {
    fn method(&self) -> PaymentMethod { PaymentMethod::Wallet }

    async fn create_payment(&self, req: &PaymentRequest) -> Result<PaymentSession, ProviderError> {
        if req.amount_minor <= 0 {
            return Err(ProviderError::Rejected("amount must be greater than zero".into()));
        }
        let mut state = self.state.lock();
        let id = match state.creates.lookup(&req.idempotency_key) {
            Some(existing) => existing,
            None => {
                let id = Uuid::new_v4().simple().to_string().to_uppercase()[..17].to_string();
                state.orders.insert(
                    id.clone(),
                    WalletOrder { amount: req.amount_minor, status: "CREATED".into(), capture_id: None, captured: 0, refunded: 0 },
                );
                state.creates.remember(&req.idempotency_key, &id);
                info!(order_id = req.order_id, wallet_order_id = %id, "Created wallet order");
                id
            }
        };
        Ok(PaymentSession {
            approve_url: Some(format!("{}?token={id}&return={}&cancel={}", self.checkout_base, req.return_url, req.cancel_url)),
            reference: ProviderRef::WalletOrder(id),
            secondary: None,
            client_secret: None,
            qr_image: None,
        })
    }

    /// Captures the approved order. Capturing an already captured order returns the existing capture.
    async fn settle(&self, refs: &ProviderRefs) -> Result<Settlement, ProviderError> {
        let order_id = refs
            .wallet_order_id
            .as_deref()
            .ok_or_else(|| ProviderError::Rejected("order has no wallet order".into()))?;
        let mut state = self.state.lock();
        let forced = state.capture_override.get(order_id).copied();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ProviderError::Rejected(format!("no such wallet order {order_id}")))?;

        let approved = order.status == "APPROVED" || (self.auto_approve && order.status == "CREATED");
        if approved {
            order.status = "COMPLETED".into();
            order.captured = forced.unwrap_or(order.amount);
            order.capture_id = Some(format!("CAP-{}", Uuid::new_v4().simple()));
        }
        let outcome = normalize_status(&order.status);
        let settlement = Settlement {
            outcome,
            amount_minor: outcome.success.then_some(order.captured),
            capture: order.capture_id.clone().map(ProviderRef::WalletCapture),
            raw_status: order.status.clone(),
        };
        if let Some(capture_id) = order.capture_id.clone() {
            state.captures.insert(capture_id, order_id.to_string());
        }
        Ok(settlement)
    }

    async fn refund(&self, req: &RefundRequest) -> Result<RefundReceipt, ProviderError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.refunds.lookup(&req.idempotency_key) {
            return Ok(RefundReceipt { raw: serde_json::json!({"id": existing, "status": "COMPLETED"}), provider_ref: existing });
        }
        let order_id = state
            .captures
            .get(&req.settlement_ref)
            .cloned()
            .ok_or_else(|| ProviderError::Rejected(format!("no such capture {}", req.settlement_ref)))?;
        let order = state.orders.get_mut(&order_id).ok_or_else(|| ProviderError::Rejected("capture without order".into()))?;
        if order.refunded + req.amount_minor > order.captured {
            return Err(ProviderError::Rejected("refund exceeds captured amount".into()));
        }
        order.refunded += req.amount_minor;
        let id = format!("RF-{}", Uuid::new_v4().simple());
        state.refunds.remember(&req.idempotency_key, &id);
        Ok(RefundReceipt { raw: serde_json::json!({"id": id, "status": "COMPLETED"}), provider_ref: id })
    }

    fn parse_event(&self, payload: &[u8]) -> Result<Option<ProviderEvent>, ProviderError> {
        let env: WebhookEnvelope = serde_json::from_slice(payload).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let outcome = match env.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => Outcome::SUCCESS,
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => Outcome::FAIL,
            _ => return Ok(None),
        };
        let amount_minor = match env.resource.amount {
            Some(a) => Some(to_minor_units(Decimal::from_str(&a.value).map_err(|e| ProviderError::Malformed(e.to_string()))?)),
            None => None,
        };
        Ok(Some(ProviderEvent {
            id: env.id,
            event_type: env.event_type,
            reference: ProviderRef::WalletOrder(env.resource.order_id),
            outcome,
            amount_minor,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PaymentRequest {
        PaymentRequest {
            order_id: 3,
            amount_minor: 2000,
            currency: "SGD".into(),
            idempotency_key: IdempotencyKey::for_order(3),
            return_url: "http://shop/return".into(),
            cancel_url: "http://shop/cancel".into(),
        }
    }

    #[tokio::test]
    async fn test_capture_after_approval() {
        let wallet = SandboxWalletProvider::new(false);
        let session = wallet.create_payment(&request()).await.unwrap();
        assert!(session.approve_url.unwrap().contains("token="));
        let refs = ProviderRefs { wallet_order_id: Some(session.reference.value().into()), ..Default::default() };
        assert_eq!(wallet.settle(&refs).await.unwrap().outcome, Outcome::PENDING);
        wallet.approve(session.reference.value());
        let first = wallet.settle(&refs).await.unwrap();
        let again = wallet.settle(&refs).await.unwrap();
        assert!(first.outcome.success);
        assert_eq!(first.amount_minor, Some(2000));
        assert_eq!(first.capture, again.capture);
    }

    #[tokio::test]
    async fn test_refund_against_capture() {
        let wallet = SandboxWalletProvider::new(true);
        let session = wallet.create_payment(&request()).await.unwrap();
        let refs = ProviderRefs { wallet_order_id: Some(session.reference.value().into()), ..Default::default() };
        let capture = wallet.settle(&refs).await.unwrap().capture.unwrap();
        let req = RefundRequest { settlement_ref: capture.value().into(), amount_minor: 2500, currency: "SGD".into(), idempotency_key: IdempotencyKey::for_refund(1) };
        assert!(wallet.refund(&req).await.is_err());
        let req = RefundRequest { amount_minor: 1500, idempotency_key: IdempotencyKey::for_refund(2), ..req };
        assert!(wallet.refund(&req).await.is_ok());
    }

    #[test]
    fn test_parse_capture_event() {
        let wallet = SandboxWalletProvider::new(false);
        let body = br#"{"id":"WH-1","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{"order_id":"ABC","amount":{"value":"22.00"}}}"#;
        let ev = wallet.parse_event(body).unwrap().unwrap();
        assert_eq!(ev.amount_minor, Some(2200));
        assert_eq!(ev.reference, ProviderRef::WalletOrder("ABC".into()));
    }
}
