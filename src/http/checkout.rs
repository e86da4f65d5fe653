//! Checkout handlers

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::domain::aggregates::{DeliveryType, PaymentMethod, ShippingChoice};
use crate::http::{validated, ApiError, AppState};
use crate::services::Actor;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutQuery {
    /// Comma separated product ids; empty selects the whole cart.
    #[validate(length(max = 2000))]
    pub selected: Option<String>,
    pub delivery: Option<String>,
    pub payment: Option<String>,
    #[validate(length(max = 120))]
    pub contact_name: Option<String>,
    #[validate(length(max = 40))]
    pub contact_phone: Option<String>,
    #[validate(length(max = 500))]
    pub address: Option<String>,
}

pub async fn preview(State(s): State<AppState>, actor: Actor, Query(q): Query<CheckoutQuery>) -> Result<impl IntoResponse, ApiError> {
    let q = validated(q)?;
    let delivery_type = match q.delivery.as_deref() {
        Some(raw) if !raw.trim().is_empty() => raw.parse::<DeliveryType>().map_err(ApiError::bad_request)?,
        _ => DeliveryType::default(),
    };
    let selection: Vec<&str> = q.selected.as_deref().map(|s| s.split(',').filter(|p| !p.trim().is_empty()).collect()).unwrap_or_default();
    let choice = ShippingChoice {
        delivery_type,
        contact_name: q.contact_name,
        contact_phone: q.contact_phone,
        address: q.address,
        payment_method: q.payment,
    };
    let (token, snapshot) = s.services.checkout.begin_checkout(actor.user_id, &selection, &choice).await?;
    Ok(Json(json!({ "token": token, "snapshot": snapshot })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub token: Uuid,
    #[validate(length(min = 1, max = 32))]
    pub payment_method: Option<String>,
}

pub async fn place_order(State(s): State<AppState>, actor: Actor, Json(req): Json<PlaceOrderRequest>) -> Result<impl IntoResponse, ApiError> {
    let req = validated(req)?;
    let method = req.payment_method.as_deref().map(str::parse::<PaymentMethod>).transpose().map_err(ApiError::bad_request)?;
    let order_id = s.services.checkout.place_order(actor.user_id, req.token, method).await?;
    Ok((StatusCode::CREATED, Json(json!({ "order_id": order_id }))))
}
