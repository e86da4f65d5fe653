//! QR code processor (request code, then poll)
//!
//! There is no push channel: callers poll [`PaymentProvider::settle`] with the
//! retrieval reference and the session id returned when the code was issued.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::domain::aggregates::{PaymentMethod, ProviderRef, ProviderRefs};
use crate::domain::value_objects::IdempotencyKey;
use crate::providers::{IdempotencyLedger, Outcome, PaymentProvider, PaymentRequest, PaymentSession, ProviderError, Settlement};

/// The processor answers with two-digit response codes or words depending on the endpoint.
pub fn normalize_status(raw: &str) -> Outcome {
    match raw.trim().to_ascii_uppercase().as_str() {
        "00" | "SUCCESS" | "PAID" => Outcome::SUCCESS,
        "05" | "51" | "68" | "FAILED" | "FAIL" | "EXPIRED" | "CANCELLED" => Outcome::FAIL,
        _ => Outcome::PENDING,
    }
}

#[derive(Debug, Clone)]
struct QrCode {
    session_id: String,
    amount: i64,
    status: String,
}

#[derive(Default)]
struct QrState {
    codes: HashMap<String, QrCode>,
    creates: IdempotencyLedger,
    queries: u32,
}

pub struct SandboxQrProvider {
    auto_approve: bool,
    state: Mutex<QrState>,
}

impl SandboxQrProvider {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve, state: Mutex::new(QrState::default()) }
    }

    pub fn set_status(&self, retrieval_ref: &str, raw_status: &str) {
        if let Some(code) = self.state.lock().codes.get_mut(retrieval_ref) {
            code.status = raw_status.to_string();
        }
    }

    pub fn create_calls(&self, key: &IdempotencyKey) -> u32 { self.state.lock().creates.calls(key) }
    pub fn queries(&self) -> u32 { self.state.lock().queries }
}

#[async_trait]
impl PaymentProvider for SandboxQrProvider {
    fn method(&self) -> PaymentMethod { PaymentMethod::QrPoll }

    async fn create_payment(&self, req: &PaymentRequest) -> Result<PaymentSession, ProviderError> {
        if req.amount_minor <= 0 {
            return Err(ProviderError::Rejected("amount must be greater than zero".into()));
        }
        let mut state = self.state.lock();
        let retrieval_ref = match state.creates.lookup(&req.idempotency_key) {
            Some(existing) => existing,
            None => {
                let retrieval_ref = format!("QR{}", Uuid::new_v4().simple());
                state.codes.insert(
                    retrieval_ref.clone(),
                    QrCode { session_id: Uuid::new_v4().to_string(), amount: req.amount_minor, status: "PENDING".into() },
                );
                state.creates.remember(&req.idempotency_key, &retrieval_ref);
                info!(order_id = req.order_id, %retrieval_ref, "Issued QR code");
                retrieval_ref
            }
        };
        let code = state
            .codes
            .get(&retrieval_ref)
            .ok_or_else(|| ProviderError::Rejected("code vanished".into()))?;
        Ok(PaymentSession {
            qr_image: Some(format!("qr:{retrieval_ref}:{}:{}", code.amount, req.currency)),
            secondary: Some(ProviderRef::QrCourseInit(code.session_id.clone())),
            reference: ProviderRef::QrRetrieval(retrieval_ref),
            client_secret: None,
            approve_url: None,
        })
    }

    async fn settle(&self, refs: &ProviderRefs) -> Result<Settlement, ProviderError> {
        let (Some(retrieval_ref), Some(session_id)) = (refs.qr_retrieval_ref.as_deref(), refs.qr_course_init_id.as_deref()) else {
            return Err(ProviderError::Rejected("order has no QR session".into()));
        };
        let mut state = self.state.lock();
        state.queries += 1;
        let code = state
            .codes
            .get_mut(retrieval_ref)
            .filter(|c| c.session_id == session_id)
            .ok_or_else(|| ProviderError::Rejected(format!("no QR session {retrieval_ref}")))?;
        if self.auto_approve && normalize_status(&code.status) == Outcome::PENDING {
            code.status = "00".into();
        }
        let outcome = normalize_status(&code.status);
        Ok(Settlement {
            outcome,
            amount_minor: outcome.success.then_some(code.amount),
            capture: None,
            raw_status: code.status.clone(),
        })
    }
}
