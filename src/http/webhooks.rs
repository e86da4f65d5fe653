//! Provider notification endpoint

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::{debug, warn};

use crate::http::{ApiError, AppState};
use crate::providers::verify_signature;

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Duplicates and unknown references are acknowledged with 200 so the provider stops retrying.
pub async fn receive(
    State(s): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    match s.webhook_secret.as_deref() {
        Some(secret) => {
            let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or_default();
            if !verify_signature(secret, &body, signature) {
                warn!(%provider, "Rejected notification with bad signature");
                return Err(ApiError::new(StatusCode::UNAUTHORIZED, "bad_signature", "Signature verification failed"));
            }
        }
        None => debug!(%provider, "Accepting unsigned notification, no webhook secret configured"),
    }
    let outcome = s.services.webhooks.handle_event(&provider, &body).await?;
    Ok(Json(outcome))
}
