//! Customer order, payment and refund handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;
use validator::Validate;

use crate::domain::aggregates::{PaymentMethod, PreferredMethod, RefundEvidence, RequestedLine};
use crate::http::{validated, ApiError, AppState};
use crate::services::payments::PaymentService;
use crate::services::refunds::RefundSubmission;
use crate::services::{Actor, Confirmation};
use crate::EcommerceError;

fn confirmation_body(order_id: i64, confirmation: &Confirmation) -> Value {
    let outcome = confirmation.outcome();
    let (status, detail) = match confirmation {
        Confirmation::Paid(f) => ("paid", json!({ "already_paid": f.already_paid, "blocked": f.blocked, "order_status": f.order.status })),
        Confirmation::Failed { reason } => ("failed", json!({ "reason": reason })),
        Confirmation::Pending => ("pending", Value::Null),
    };
    json!({ "order_id": order_id, "success": outcome.success, "fail": outcome.fail, "status": status, "detail": detail })
}

pub async fn get_order(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.services.payments.order_view(id, actor.user_id, actor.is_staff()).await?))
}

pub async fn start_payment(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.services.payments.start_payment(id, actor.user_id).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmCardRequest {
    #[validate(length(min = 1, max = 255))]
    pub payment_intent_id: String,
}

pub async fn confirm_card(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<ConfirmCardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let req = validated(req)?;
    let confirmation = s.services.payments.confirm_card_payment(id, actor.user_id, &req.payment_intent_id).await?;
    Ok(Json(confirmation_body(id, &confirmation)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CaptureRequest {
    #[validate(length(min = 1, max = 64))]
    pub token: String,
}

pub async fn capture_wallet(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<CaptureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let req = validated(req)?;
    let confirmation = s.services.payments.capture_wallet_payment(id, actor.user_id, &req.token).await?;
    Ok(Json(confirmation_body(id, &confirmation)))
}

pub async fn cancel_wallet(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    let failed = s.services.payments.cancel_wallet_payment(id, actor.user_id).await?;
    Ok(Json(json!({ "order_id": id, "cancelled": failed })))
}

pub async fn discard_qr_order(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    s.services.payments.discard_abandoned_qr_order(id, actor.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Server-sent `{success, fail, status}` updates until the QR payment resolves.
pub async fn qr_events(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let view = s.services.payments.order_view(id, actor.user_id, actor.is_staff()).await?;
    if view.order.payment_method != PaymentMethod::QrPoll {
        return Err(EcommerceError::ReferenceMismatch.into());
    }
    let payments = s.services.payments.clone();
    let interval = tokio::time::interval(s.qr_poll_interval);
    Ok(Sse::new(qr_status_stream(payments, id, interval)).keep_alive(KeepAlive::default()))
}

fn qr_status_stream(
    payments: Arc<PaymentService>,
    order_id: i64,
    interval: tokio::time::Interval,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some((payments, interval)), move |state| async move {
        let (payments, mut interval) = state?;
        interval.tick().await;
        let (body, resolved) = match payments.poll_qr_payment(order_id).await {
            Ok(confirmation) => (confirmation_body(order_id, &confirmation), confirmation.outcome().is_resolved()),
            Err(e) => {
                warn!(order_id, error = %e, "QR status poll failed");
                (json!({ "order_id": order_id, "success": false, "fail": false, "status": "unknown" }), false)
            }
        };
        let event = Event::default().event("status").data(body.to_string());
        Some((Ok::<_, Infallible>(event), (!resolved).then_some((payments, interval))))
    })
}

pub async fn refundable(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.services.refunds.refundable_lines(id, actor.user_id).await?))
}

pub async fn list_refunds(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.services.refunds.refunds_for_order(id, actor.user_id, actor.is_admin()).await?))
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RefundLineDto {
    pub order_item_id: i64,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct EvidenceDto {
    #[validate(length(min = 1, max = 500))]
    pub file_ref: String,
    #[validate(length(min = 1, max = 100))]
    pub content_type: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequestDto {
    pub refund_type: String,
    pub reason: String,
    #[validate(length(max = 2000))]
    pub note: Option<String>,
    pub preferred_method: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<RefundLineDto>,
    #[serde(default)]
    #[validate(length(max = 3))]
    pub evidence: Vec<EvidenceDto>,
}

impl RefundRequestDto {
    fn into_submission(self) -> Result<RefundSubmission, ApiError> {
        for line in &self.items {
            line.validate()?;
        }
        for file in &self.evidence {
            file.validate()?;
        }
        Ok(RefundSubmission {
            refund_type: self.refund_type.parse().map_err(ApiError::bad_request)?,
            reason: self.reason.parse().map_err(ApiError::bad_request)?,
            note: self.note.filter(|n| !n.trim().is_empty()),
            preferred_method: match self.preferred_method.as_deref() {
                Some(raw) => raw.parse().map_err(ApiError::bad_request)?,
                None => PreferredMethod::OriginalPayment,
            },
            lines: self.items.iter().map(|l| RequestedLine { order_item_id: l.order_item_id, quantity: l.quantity }).collect(),
            evidence: self
                .evidence
                .into_iter()
                .map(|e| RefundEvidence { file_ref: e.file_ref, content_type: e.content_type })
                .collect(),
        })
    }
}

pub async fn submit_refund(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<RefundRequestDto>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = validated(req)?.into_submission()?;
    let refund_id = s.services.refunds.submit_refund_request(id, actor.user_id, submission).await?;
    Ok((StatusCode::CREATED, Json(json!({ "refund_id": refund_id, "status": "requested" }))))
}

pub async fn cancel_order(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.services.refunds.cancel_order_with_auto_refund(id, actor.user_id).await?))
}

pub async fn get_refund(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.services.refunds.refund_view(id, actor.user_id, actor.is_admin()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: Value) -> RefundRequestDto {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_refund_request_bounds() {
        let ok = request(json!({
            "refund_type": "partial",
            "reason": "damaged",
            "items": [{ "order_item_id": 1, "quantity": 2 }],
            "evidence": [{ "file_ref": "uploads/a.jpg", "content_type": "image/jpeg" }]
        }));
        let submission = validated(ok).unwrap().into_submission().unwrap();
        assert_eq!(submission.lines, vec![RequestedLine { order_item_id: 1, quantity: 2 }]);
        assert_eq!(submission.preferred_method, PreferredMethod::OriginalPayment);

        let photo = json!({ "file_ref": "uploads/a.jpg", "content_type": "image/jpeg" });
        let too_many = request(json!({
            "refund_type": "partial",
            "reason": "damaged",
            "items": [{ "order_item_id": 1, "quantity": 1 }],
            "evidence": [photo.clone(), photo.clone(), photo.clone(), photo]
        }));
        assert_eq!(validated(too_many).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let no_items = request(json!({ "refund_type": "partial", "reason": "damaged", "items": [] }));
        assert!(validated(no_items).is_err());

        let huge = request(json!({
            "refund_type": "partial",
            "reason": "damaged",
            "items": [{ "order_item_id": 1, "quantity": i32::MAX }, { "order_item_id": 1, "quantity": i32::MAX }]
        }));
        let err = validated(huge).unwrap().into_submission().unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
