//! Admin refund handlers and staff pickup redemption

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use validator::Validate;

use crate::http::{require_admin, validated, ApiError, AppState};
use crate::services::refunds::RefundDecision;
use crate::services::Actor;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction { Approve, Reject }

#[derive(Debug, Deserialize, Validate)]
pub struct DecisionRequest {
    pub action: DecisionAction,
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
    #[validate(length(max = 2000))]
    pub note: Option<String>,
    /// Approved quantity per refund item id; lines not listed are approved in full.
    #[serde(default)]
    pub quantities: HashMap<i64, i32>,
}

pub async fn decide(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<DecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&actor)?;
    let req = validated(req)?;
    let decision = match req.action {
        DecisionAction::Approve => RefundDecision::Approve { quantities: req.quantities, note: req.note },
        DecisionAction::Reject => RefundDecision::Reject { reason: req.reason.unwrap_or_default(), note: req.note },
    };
    Ok(Json(s.services.refunds.decide_refund(id, actor.user_id, decision).await?))
}

pub async fn process(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    require_admin(&actor)?;
    Ok(Json(s.services.refunds.process_refund(id, Some(actor.user_id)).await?))
}

pub async fn initiate(State(s): State<AppState>, actor: Actor, Path(id): Path<i64>) -> Result<impl IntoResponse, ApiError> {
    require_admin(&actor)?;
    let initiated = s.services.refunds.initiate_refund(id, actor.user_id).await?;
    let message = if initiated { "Refund initiated" } else { "Refund already initiated" };
    Ok(Json(json!({ "refund_id": id, "status": "initiated", "message": message })))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CompleteRequest {
    #[validate(length(min = 1, max = 255))]
    pub provider_ref: Option<String>,
}

pub async fn complete(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    body: Option<Json<CompleteRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&actor)?;
    let req = validated(body.map(|Json(b)| b).unwrap_or_default())?;
    Ok(Json(s.services.refunds.complete_refund(id, actor.user_id, req.provider_ref).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct FailRequest {
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

pub async fn fail(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<FailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&actor)?;
    let req = validated(req)?;
    Ok(Json(s.services.refunds.fail_refund(id, actor.user_id, req.reason.trim()).await?))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ManualReviewRequest {
    #[validate(length(max = 2000))]
    pub note: Option<String>,
}

pub async fn manual_review(
    State(s): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    body: Option<Json<ManualReviewRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&actor)?;
    let req = validated(body.map(|Json(b)| b).unwrap_or_default())?;
    Ok(Json(s.services.refunds.mark_manual_review(id, actor.user_id, req.note).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RedeemRequest {
    #[validate(length(min = 1, max = 16))]
    pub code: String,
}

pub async fn redeem_pickup(State(s): State<AppState>, actor: Actor, Json(req): Json<RedeemRequest>) -> Result<impl IntoResponse, ApiError> {
    let req = validated(req)?;
    let order = s.services.pickup.redeem_pickup(actor, &req.code).await?;
    Ok(Json(json!({
        "order_id": order.id,
        "pickup_code": order.pickup_code,
        "redeemed_at": order.pickup_code_redeemed_at,
    })))
}
