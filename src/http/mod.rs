//! HTTP surface
//!
//! Thin axum handlers over [`AppServices`]. Identity comes from the upstream
//! session layer as `x-user-id` / `x-user-role` headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use validator::Validate;

use crate::config::AppConfig;
use crate::services::{Actor, AppServices, Role};

pub mod admin;
pub mod checkout;
pub mod error;
pub mod orders;
pub mod webhooks;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub services: AppServices,
    pub webhook_secret: Option<Arc<str>>,
    pub qr_poll_interval: Duration,
}

impl AppState {
    pub fn new(services: AppServices, config: &AppConfig) -> Self {
        Self {
            services,
            webhook_secret: config.webhook_secret.as_deref().map(Arc::from),
            qr_poll_interval: config.qr_poll_interval,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "storefront-payments"})) }))
        .route("/checkout", get(checkout::preview))
        .route("/checkout/orders", post(checkout::place_order))
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/payments", post(orders::start_payment))
        .route("/orders/:id/payments/card/confirm", post(orders::confirm_card))
        .route("/orders/:id/payments/wallet/capture", post(orders::capture_wallet))
        .route("/orders/:id/payments/wallet/cancel", post(orders::cancel_wallet))
        .route("/orders/:id/qr", delete(orders::discard_qr_order))
        .route("/payments/qr/:id/events", get(orders::qr_events))
        .route("/orders/:id/refundable", get(orders::refundable))
        .route("/orders/:id/refunds", get(orders::list_refunds).post(orders::submit_refund))
        .route("/orders/:id/cancel", post(orders::cancel_order))
        .route("/refunds/:id", get(orders::get_refund))
        .route("/admin/refunds/:id/decision", post(admin::decide))
        .route("/admin/refunds/:id/process", post(admin::process))
        .route("/admin/refunds/:id/initiate", post(admin::initiate))
        .route("/admin/refunds/:id/complete", post(admin::complete))
        .route("/admin/refunds/:id/fail", post(admin::fail))
        .route("/admin/refunds/:id/manual-review", post(admin::manual_review))
        .route("/pickup/redeem", post(admin::redeem_pickup))
        .route("/webhooks/:provider", post(webhooks::receive))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
        let user_id = header("x-user-id").and_then(|v| v.parse::<i64>().ok()).ok_or_else(ApiError::unauthenticated)?;
        let role = match header("x-user-role") {
            Some(raw) if !raw.is_empty() => raw.parse::<Role>().map_err(ApiError::bad_request)?,
            _ => Role::Customer,
        };
        Ok(Actor { user_id, role })
    }
}

pub(crate) fn require_admin(actor: &Actor) -> Result<(), ApiError> {
    if actor.is_admin() { Ok(()) } else { Err(ApiError::forbidden()) }
}

pub(crate) fn validated<T: Validate>(dto: T) -> Result<T, ApiError> {
    dto.validate()?;
    Ok(dto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rust_decimal::Decimal;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::domain::aggregates::UserProfile;
    use crate::domain::status::OrderStatus;
    use crate::providers::{sign, Providers, SandboxCardProvider, SandboxQrProvider, SandboxWalletProvider};
    use crate::services::EventBus;
    use crate::store::{MemoryStore, Store};

    struct TestApp {
        store: MemoryStore,
        card: Arc<SandboxCardProvider>,
        app: Router,
    }

    async fn test_app(secret: Option<&str>, auto_approve: bool) -> TestApp {
        let store = MemoryStore::new();
        store.put_user(UserProfile { id: 1, name: Some("Ana".into()), address: Some("1 Main St".into()), ..Default::default() }).await;
        store.put_product(10, "Tea", Decimal::new(400, 2), 10).await;
        store.put_cart_item(1, 10, 5).await;
        let card = Arc::new(SandboxCardProvider::new(false));
        let providers = Providers {
            card: card.clone(),
            wallet: Arc::new(SandboxWalletProvider::new(auto_approve)),
            qr: Arc::new(SandboxQrProvider::new(auto_approve)),
        };
        let config = AppConfig {
            webhook_secret: secret.map(str::to_string),
            qr_poll_interval: Duration::from_millis(10),
            ..AppConfig::default()
        };
        let services = AppServices::new(Arc::new(store.clone()), providers, EventBus::default(), &config);
        TestApp { store, card, app: router(AppState::new(services, &config)) }
    }

    async fn call(app: &Router, method: &str, uri: &str, user: Option<(&str, &str)>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = user {
            req = req.header("x-user-id", id).header("x-user-role", role);
        }
        let req = match body {
            Some(v) => req.header("content-type", "application/json").body(Body::from(v.to_string())).unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    const ANA: Option<(&str, &str)> = Some(("1", "customer"));

    async fn pending_order(t: &TestApp, payment: &str) -> i64 {
        let (status, body) = call(&t.app, "GET", &format!("/checkout?delivery=delivery&payment={payment}"), ANA, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshot"]["total"], "22.00");
        let token = body["token"].as_str().unwrap().to_string();
        let (status, body) = call(&t.app, "POST", "/checkout/orders", ANA, Some(serde_json::json!({ "token": token }))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["order_id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health_and_identity() {
        let t = test_app(None, false).await;
        let (status, body) = call(&t.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        let (status, _) = call(&t.app, "GET", "/checkout", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&t.app, "GET", "/checkout", Some(("1", "wizard")), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_card_checkout_end_to_end() {
        let t = test_app(None, false).await;
        let order_id = pending_order(&t, "card").await;
        let (status, session) = call(&t.app, "POST", &format!("/orders/{order_id}/payments"), ANA, None).await;
        assert_eq!(status, StatusCode::OK);
        let intent = session["reference"]["value"].as_str().unwrap().to_string();

        t.card.succeed(&intent, 2100);
        let uri = format!("/orders/{order_id}/payments/card/confirm");
        let (status, body) = call(&t.app, "POST", &uri, ANA, Some(serde_json::json!({ "payment_intent_id": intent }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "payment_mismatch");

        let (status, body) = call(&t.app, "GET", &format!("/orders/{order_id}"), ANA, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order"]["status"], OrderStatus::PaymentFailed.as_str());
        let (status, _) = call(&t.app, "GET", &format!("/orders/{order_id}"), Some(("2", "customer")), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_signed_webhook_finalizes_and_dedups() {
        let t = test_app(Some("whsec"), false).await;
        let order_id = pending_order(&t, "card").await;
        let (_, session) = call(&t.app, "POST", &format!("/orders/{order_id}/payments"), ANA, None).await;
        let intent = session["reference"]["value"].as_str().unwrap();
        let payload = format!(
            r#"{{"id":"evt_1","type":"payment_intent.succeeded","data":{{"object":{{"id":"{intent}","amount_received":2200}}}}}}"#
        );

        let send = |signature: String| {
            let req = Request::builder()
                .method("POST")
                .uri("/webhooks/card")
                .header("x-signature", signature)
                .body(Body::from(payload.clone()))
                .unwrap();
            t.app.clone().oneshot(req)
        };
        assert_eq!(send("00".into()).await.unwrap().status(), StatusCode::UNAUTHORIZED);
        let first = send(sign("whsec", payload.as_bytes())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let again = send(sign("whsec", payload.as_bytes())).await.unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        let body = axum::body::to_bytes(again.into_body(), 1024).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["result"], "duplicate");
        assert_eq!(t.store.stock(10).await, Some(5));
    }

    #[tokio::test]
    async fn test_qr_event_stream_ends_when_resolved() {
        let t = test_app(None, true).await;
        let order_id = pending_order(&t, "paynow").await;
        let (status, session) = call(&t.app, "POST", &format!("/orders/{order_id}/payments"), ANA, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(session["qr_image"].is_string());

        let req = Request::builder()
            .uri(format!("/payments/qr/{order_id}/events"))
            .header("x-user-id", "1")
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(r#""success":true"#));

        let mut tx = t.store.begin().await.unwrap();
        assert_eq!(tx.order(order_id).await.unwrap().unwrap().status, OrderStatus::PaymentSuccessful);
    }

    #[tokio::test]
    async fn test_refund_admin_flow_and_validation() {
        let t = test_app(None, true).await;
        let order_id = pending_order(&t, "wallet").await;
        let (_, session) = call(&t.app, "POST", &format!("/orders/{order_id}/payments"), ANA, None).await;
        let token = session["reference"]["value"].as_str().unwrap();
        let uri = format!("/orders/{order_id}/payments/wallet/capture");
        let (status, body) = call(&t.app, "POST", &uri, ANA, Some(serde_json::json!({ "token": token }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, lines) = call(&t.app, "GET", &format!("/orders/{order_id}/refundable"), ANA, None).await;
        let item_id = lines[0]["order_item_id"].as_i64().unwrap();
        assert_eq!(lines[0]["remaining"], 5);

        let refunds_uri = format!("/orders/{order_id}/refunds");
        let empty = serde_json::json!({ "refund_type": "partial", "reason": "damaged", "items": [] });
        let (status, _) = call(&t.app, "POST", &refunds_uri, ANA, Some(empty)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let too_many = serde_json::json!({ "refund_type": "partial", "reason": "damaged", "items": [{ "order_item_id": item_id, "quantity": 6 }] });
        let (status, body) = call(&t.app, "POST", &refunds_uri, ANA, Some(too_many)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["details"]["remaining"], 5);

        let request = serde_json::json!({
            "refund_type": "partial",
            "reason": "damaged",
            "items": [{ "order_item_id": item_id, "quantity": 2 }],
            "evidence": [{ "file_ref": "uploads/a.png", "content_type": "image/png" }]
        });
        let (status, body) = call(&t.app, "POST", &refunds_uri, ANA, Some(request)).await;
        assert_eq!(status, StatusCode::CREATED);
        let refund_id = body["refund_id"].as_i64().unwrap();

        let decision_uri = format!("/admin/refunds/{refund_id}/decision");
        let approve = serde_json::json!({ "action": "approve" });
        let (status, _) = call(&t.app, "POST", &decision_uri, ANA, Some(approve.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let admin = Some(("9", "admin"));
        let (status, _) = call(&t.app, "POST", &decision_uri, admin, Some(serde_json::json!({ "action": "reject" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&t.app, "POST", &decision_uri, admin, Some(approve)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&t.app, "POST", &format!("/admin/refunds/{refund_id}/process"), admin, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["txn_status"], "completed");
        assert_eq!(body["provider"], "wallet");

        let (status, body) = call(&t.app, "GET", &format!("/refunds/{refund_id}"), ANA, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refund"]["status"], "refunded");
        let (_, listed) = call(&t.app, "GET", &refunds_uri, ANA, None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }
}
