//! Error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, warn};
use validator::ValidationErrors;

use crate::EcommerceError;

/// JSON error body: `{"error": code, "message": text, "details": {...}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), details: None }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthenticated() -> Self { Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", "Sign in to continue") }
    pub fn forbidden() -> Self { Self::new(StatusCode::FORBIDDEN, "forbidden", "You are not allowed to do that") }
    pub fn bad_request(message: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, "invalid_request", message) }

    pub fn status(&self) -> StatusCode { self.status }
}

impl From<EcommerceError> for ApiError {
    fn from(err: EcommerceError) -> Self {
        use EcommerceError::*;
        match err {
            NotFound(what) => Self::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
            Validation(message) => Self::bad_request(message),
            Forbidden => Self::forbidden(),
            e @ InvalidState { .. } => Self::new(StatusCode::CONFLICT, "invalid_state", e.to_string()),
            Conflict(what) => {
                warn!(%what, "Write conflict surfaced to client");
                Self::new(StatusCode::CONFLICT, "conflict", "Please try again")
            }
            DuplicateRefund { existing_refund_id } => {
                Self::new(StatusCode::CONFLICT, "duplicate_refund", "A refund is already open for this order")
                    .with_details(json!({ "existing_refund_id": existing_refund_id }))
            }
            QuantityExceeded { order_item_id, requested, remaining } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "quantity_exceeded", "Requested quantity exceeds what can still be refunded")
                    .with_details(json!({ "order_item_id": order_item_id, "requested": requested, "remaining": remaining }))
            }
            AmountMismatch { expected_minor, received_minor } => {
                warn!(expected_minor, received_minor, "Payment amount mismatch");
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "payment_mismatch", "Payment could not be verified")
            }
            ReferenceMismatch => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "payment_mismatch", "Payment could not be verified"),
            e @ (OverRefund | NonPositiveRefund) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_refund", e.to_string()),
            Provider(e) => {
                warn!(error = %e, "Payment provider call failed");
                Self::new(StatusCode::BAD_GATEWAY, "provider_error", "Could not process payment or refund, please retry")
            }
            e @ (Storage(_) | Corrupt(_)) => {
                error!(error = %e, "Internal error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "Something went wrong")
            }
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        let fields: Vec<&str> = errors.field_errors().keys().copied().collect();
        Self::bad_request(format!("Invalid fields: {}", fields.join(", "))).with_details(json!(errors))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.code, "message": self.message });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}
