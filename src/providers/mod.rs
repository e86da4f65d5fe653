//! Payment provider contract
//!
//! Each adapter wraps one external settlement protocol and reduces its status
//! vocabulary to [`Outcome`] before anything reaches order logic.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::aggregates::{PaymentMethod, ProviderRef, ProviderRefs};
use crate::domain::value_objects::IdempotencyKey;

pub mod card;
pub mod qr;
pub mod wallet;

pub use card::SandboxCardProvider;
pub use qr::SandboxQrProvider;
pub use wallet::SandboxWalletProvider;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Network(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("operation not supported by {0}")]
    Unsupported(&'static str),
    #[error("malformed provider payload: {0}")]
    Malformed(String),
}

/// Normalized settlement state. Neither flag set means "still pending".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub fail: bool,
}

impl Outcome {
    pub const SUCCESS: Outcome = Outcome { success: true, fail: false };
    pub const FAIL: Outcome = Outcome { success: false, fail: true };
    pub const PENDING: Outcome = Outcome { success: false, fail: false };

    pub fn is_resolved(&self) -> bool { self.success || self.fail }
}

#[derive(Clone, Debug)]
pub struct PaymentRequest {
    pub order_id: i64,
    pub amount_minor: i64,
    pub currency: String,
    pub idempotency_key: IdempotencyKey,
    pub return_url: String,
    pub cancel_url: String,
}

/// What the client needs to complete the payment with the provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub reference: ProviderRef,
    pub secondary: Option<ProviderRef>,
    pub client_secret: Option<String>,
    pub approve_url: Option<String>,
    pub qr_image: Option<String>,
}

/// The provider's current view of a payment.
#[derive(Clone, Debug, PartialEq)]
pub struct Settlement {
    pub outcome: Outcome,
    pub amount_minor: Option<i64>,
    pub capture: Option<ProviderRef>,
    pub raw_status: String,
}

#[derive(Clone, Debug)]
pub struct RefundRequest {
    pub settlement_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RefundReceipt {
    pub provider_ref: String,
    pub raw: serde_json::Value,
}

/// Asynchronous notification reduced to what order logic needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    pub reference: ProviderRef,
    pub outcome: Outcome,
    pub amount_minor: Option<i64>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    fn name(&self) -> &'static str { self.method().as_str() }

    /// Creates the provider-side charge/order. Must be idempotent on `req.idempotency_key`.
    async fn create_payment(&self, req: &PaymentRequest) -> Result<PaymentSession, ProviderError>;

    /// Confirms, captures or queries the payment identified by the order's stored references.
    async fn settle(&self, refs: &ProviderRefs) -> Result<Settlement, ProviderError>;

    async fn refund(&self, _req: &RefundRequest) -> Result<RefundReceipt, ProviderError> {
        Err(ProviderError::Unsupported(self.name()))
    }

    /// Parses a push notification. `Ok(None)` for event types this service ignores.
    fn parse_event(&self, _payload: &[u8]) -> Result<Option<ProviderEvent>, ProviderError> {
        Err(ProviderError::Unsupported(self.name()))
    }
}

/// The three configured adapters, looked up by an order's payment method.
#[derive(Clone)]
pub struct Providers {
    pub card: Arc<dyn PaymentProvider>,
    pub wallet: Arc<dyn PaymentProvider>,
    pub qr: Arc<dyn PaymentProvider>,
}

impl Providers {
    pub fn for_method(&self, method: PaymentMethod) -> &Arc<dyn PaymentProvider> {
        match method {
            PaymentMethod::Card => &self.card,
            PaymentMethod::Wallet => &self.wallet,
            PaymentMethod::QrPoll => &self.qr,
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn PaymentProvider>> {
        name.parse::<PaymentMethod>().ok().map(|m| self.for_method(m))
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Checks a hex HMAC-SHA256 signature over the raw notification body in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else { return false };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Bookkeeping shared by the sandbox adapters: one provider object per idempotency key.
#[derive(Debug, Default)]
pub(crate) struct IdempotencyLedger {
    by_key: std::collections::HashMap<String, String>,
    calls: std::collections::HashMap<String, u32>,
}

impl IdempotencyLedger {
    /// Returns the object id already created for `key`, counting the call either way.
    pub(crate) fn lookup(&mut self, key: &IdempotencyKey) -> Option<String> {
        *self.calls.entry(key.as_str().to_string()).or_default() += 1;
        self.by_key.get(key.as_str()).cloned()
    }

    pub(crate) fn remember(&mut self, key: &IdempotencyKey, id: &str) {
        self.by_key.insert(key.as_str().to_string(), id.to_string());
    }

    pub(crate) fn calls(&self, key: &IdempotencyKey) -> u32 {
        self.calls.get(key.as_str()).copied().unwrap_or(0)
    }

    pub(crate) fn objects_created(&self) -> usize { self.by_key.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round() {
        let body = br#"{"id":"evt_1"}"#;
        let sig = sign("whsec_test", body);
        assert!(verify_signature("whsec_test", body, &sig));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("whsec_test", br#"{"id":"evt_2"}"#, &sig));
        assert!(!verify_signature("whsec_test", body, "not-hex"));
    }

    #[test]
    fn test_outcome_flags() {
        assert!(Outcome::SUCCESS.is_resolved());
        assert!(!Outcome::PENDING.is_resolved());
    }
}
