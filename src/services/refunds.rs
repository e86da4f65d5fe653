//! Refund requests, decisions and settlement
//!
//! `requested -> approved | rejected`, then either provider settlement
//! (`processing -> refunded | failed`, retryable from `failed` and `manual_review`)
//! or the offline track (`initiated -> completed | manual_review`).
//! Stock returns to the shelf when a refund is approved, not when money moves.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::domain::aggregates::refund::{approved_quantity, plan_refund_items, refund_amount, remaining_refundable, LineViolation};
use crate::domain::aggregates::{
    NewRefund, Order, PreferredMethod, Refund, RefundEvidence, RefundItem, RefundReason, RefundTransaction, RefundType,
    RequestedLine, TxnStatus,
};
use crate::domain::events::DomainEvent;
use crate::domain::status::{OrderStatus, RefundStatus};
use crate::domain::value_objects::{round2, to_minor_units, IdempotencyKey};
use crate::providers::{ProviderError, Providers, RefundReceipt, RefundRequest};
use crate::services::events::EventBus;
use crate::services::inventory::{InventoryLedger, StockLine};
use crate::store::{Store, StoreTx};
use crate::{EcommerceError, Result};

const MANUAL_PROVIDER: &str = "manual";

impl From<LineViolation> for EcommerceError {
    fn from(v: LineViolation) -> Self {
        match v {
            LineViolation::UnknownItem(id) => EcommerceError::Validation(format!("Order item {id} is not part of this order")),
            LineViolation::NonPositive(id) => EcommerceError::Validation(format!("Quantity for order item {id} must be at least 1")),
            LineViolation::Exceeds { order_item_id, requested, remaining } => {
                EcommerceError::QuantityExceeded { order_item_id, requested, remaining }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RefundSubmission {
    pub refund_type: RefundType,
    pub reason: RefundReason,
    pub note: Option<String>,
    pub preferred_method: PreferredMethod,
    pub lines: Vec<RequestedLine>,
    pub evidence: Vec<RefundEvidence>,
}

#[derive(Clone, Debug)]
pub enum RefundDecision {
    /// `quantities` overrides the approved quantity per refund item id.
    Approve { quantities: HashMap<i64, i32>, note: Option<String> },
    Reject { reason: String, note: Option<String> },
}

#[derive(Clone, Debug, Serialize)]
pub struct RefundableLine {
    pub order_item_id: i64,
    pub product_name: String,
    pub unit_price: Decimal,
    pub purchased: i32,
    pub remaining: i32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefundView {
    pub refund: Refund,
    pub items: Vec<RefundItem>,
    pub evidence: Vec<RefundEvidence>,
    pub transaction: Option<RefundTransaction>,
    pub approved_total: Decimal,
}

#[derive(Clone, Debug, Serialize)]
pub struct CancellationOutcome {
    pub refund_id: i64,
    pub settled: bool,
}

pub struct RefundService {
    store: Arc<dyn Store>,
    providers: Providers,
    events: EventBus,
    currency: String,
}

impl RefundService {
    pub fn new(store: Arc<dyn Store>, providers: Providers, events: EventBus, currency: &str) -> Self {
        Self { store, providers, events, currency: currency.to_string() }
    }

    /// Per-line quantities the customer may still ask to refund.
    pub async fn refundable_lines(&self, order_id: i64, user_id: i64) -> Result<Vec<RefundableLine>> {
        let mut tx = self.store.begin().await?;
        let order = tx.order(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if !order.is_owned_by(user_id) {
            return Err(EcommerceError::Forbidden);
        }
        let items = tx.order_items(order_id).await?;
        let remaining = remaining_refundable(&items, &tx.refund_usage(order_id).await?);
        Ok(items
            .into_iter()
            .map(|i| RefundableLine {
                remaining: remaining.get(&i.id).copied().unwrap_or(0),
                order_item_id: i.id,
                product_name: i.product_name,
                unit_price: i.unit_price,
                purchased: i.quantity,
            })
            .collect())
    }

    pub async fn refund_view(&self, refund_id: i64, user_id: i64, privileged: bool) -> Result<RefundView> {
        let mut tx = self.store.begin().await?;
        let refund = tx.refund(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
        if !privileged && refund.user_id != user_id {
            return Err(EcommerceError::Forbidden);
        }
        let items = tx.refund_items(refund_id).await?;
        Ok(RefundView {
            approved_total: refund_amount(&refund, &items),
            evidence: tx.refund_evidence(refund_id).await?,
            transaction: tx.refund_transaction(refund_id).await?,
            refund,
            items,
        })
    }

    pub async fn refunds_for_order(&self, order_id: i64, user_id: i64, privileged: bool) -> Result<Vec<Refund>> {
        let mut tx = self.store.begin().await?;
        let order = tx.order(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if !privileged && !order.is_owned_by(user_id) {
            return Err(EcommerceError::Forbidden);
        }
        tx.refunds_for_order(order_id).await
    }

    /// Opens a refund request. Every line is validated before anything is written.
    #[instrument(skip(self, submission), fields(lines = submission.lines.len()))]
    pub async fn submit_refund_request(&self, order_id: i64, user_id: i64, submission: RefundSubmission) -> Result<i64> {
        if submission.lines.is_empty() {
            return Err(EcommerceError::Validation("Select at least one item to refund".into()));
        }
        if submission.evidence.len() > RefundEvidence::MAX_PER_REFUND {
            return Err(EcommerceError::Validation(format!("At most {} evidence images are allowed", RefundEvidence::MAX_PER_REFUND)));
        }
        if let Some(bad) = submission.evidence.iter().find(|e| !e.is_image()) {
            return Err(EcommerceError::Validation(format!("Evidence must be an image, got {}", bad.content_type)));
        }

        let mut tx = self.store.begin().await?;
        let order = tx.order_for_update(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if !order.is_owned_by(user_id) {
            return Err(EcommerceError::Forbidden);
        }
        let open = order.status.is_paid() || order.status == OrderStatus::RefundRequested;
        if !open || order.status.is_cancelled() {
            return Err(EcommerceError::invalid_state("order", order.status, "request a refund"));
        }
        let items = tx.order_items(order_id).await?;
        let usage = tx.refund_usage(order_id).await?;
        let planned = plan_refund_items(&items, &usage, &submission.lines)?;

        let refund_id = tx
            .insert_refund(&NewRefund {
                order_id,
                user_id,
                refund_type: submission.refund_type,
                reason: submission.reason,
                note: submission.note,
                preferred_method: submission.preferred_method,
                status: RefundStatus::Requested,
                admin_id: None,
                approved_at: None,
                shipping_refund: Decimal::ZERO,
            })
            .await?;
        tx.insert_refund_items(refund_id, &planned).await?;
        tx.insert_refund_evidence(refund_id, &submission.evidence).await?;
        tx.update_order_status(order_id, OrderStatus::RefundRequested).await?;
        tx.commit().await?;

        info!(refund_id, order_id, "Refund requested");
        self.events.publish(DomainEvent::RefundRequested { refund_id, order_id }).await;
        Ok(refund_id)
    }

    /// Approves (restocking the approved quantities) or rejects a requested refund.
    #[instrument(skip(self, decision))]
    pub async fn decide_refund(&self, refund_id: i64, admin_id: i64, decision: RefundDecision) -> Result<Refund> {
        if let RefundDecision::Reject { reason, .. } = &decision {
            if reason.trim().is_empty() {
                return Err(EcommerceError::Validation("A rejection reason is required".into()));
            }
        }

        let mut tx = self.store.begin().await?;
        let mut refund = tx.refund_for_update(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
        if refund.status != RefundStatus::Requested {
            return Err(EcommerceError::invalid_state("refund", refund.status, "decide"));
        }
        let items = tx.refund_items(refund_id).await?;
        let now = Utc::now();
        refund.admin_id = Some(admin_id);

        match decision {
            RefundDecision::Approve { quantities, note } => {
                let mut restock = Vec::with_capacity(items.len());
                for item in &items {
                    let qty = approved_quantity(item.qty_requested, quantities.get(&item.id).copied());
                    let amount = round2(item.unit_price * Decimal::from(qty));
                    tx.set_refund_item_approved(item.id, qty, amount).await?;
                    restock.push(StockLine { product_id: item.product_id, product_name: item.product_name.clone(), quantity: qty });
                }
                InventoryLedger::restock_in(tx.as_mut(), restock).await?;
                refund.status = RefundStatus::Approved;
                refund.approved_at = Some(now);
                refund.admin_note = note;
                tx.update_order_status(refund.order_id, OrderStatus::Cancelled).await?;
            }
            RefundDecision::Reject { reason, note } => {
                for item in &items {
                    tx.set_refund_item_approved(item.id, 0, Decimal::ZERO).await?;
                }
                refund.status = RefundStatus::Rejected;
                refund.rejected_at = Some(now);
                refund.rejection_reason = Some(reason.trim().to_string());
                refund.admin_note = note;
                // Only an order waiting on refund requests goes back to fulfilment.
                let order = tx.order_for_update(refund.order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
                let others_active = tx
                    .refunds_for_order(refund.order_id)
                    .await?
                    .iter()
                    .any(|r| r.id != refund_id && r.status.is_active());
                if order.status == OrderStatus::RefundRequested && !others_active {
                    tx.update_order_status(refund.order_id, OrderStatus::PaymentSuccessful).await?;
                }
            }
        }
        tx.update_refund(&refund).await?;
        tx.commit().await?;

        info!(refund_id, status = %refund.status, admin_id, "Refund decided");
        self.events
            .publish(DomainEvent::RefundDecided { refund_id, order_id: refund.order_id, status: refund.status })
            .await;
        Ok(refund)
    }

    /// Settles an approved refund with the provider that took the payment.
    ///
    /// The refund row is moved to `processing` and released before the provider
    /// call, so a concurrent attempt sees `processing` and is refused.
    #[instrument(skip(self))]
    pub async fn process_refund(&self, refund_id: i64, admin_id: Option<i64>) -> Result<RefundTransaction> {
        let (order, amount) = {
            let mut tx = self.store.begin().await?;
            let mut refund = tx.refund_for_update(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
            if !refund.status.can_process() {
                return Err(EcommerceError::invalid_state("refund", refund.status, "process"));
            }
            let (order, amount) = self.checked_amount(tx.as_mut(), &refund).await?;
            refund.status = RefundStatus::Processing;
            refund.processed_at = Some(Utc::now());
            refund.failed_reason = None;
            if admin_id.is_some() {
                refund.admin_id = admin_id;
            }
            tx.update_refund(&refund).await?;
            tx.upsert_refund_transaction(&self.transaction(refund_id, self.channel(&order), amount, TxnStatus::Pending))
                .await?;
            tx.commit().await?;
            (order, amount)
        };

        let result = self.dispatch(&order, refund_id, amount).await;

        let mut tx = self.store.begin().await?;
        let mut refund = tx.refund_for_update(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
        if refund.status != RefundStatus::Processing {
            error!(refund_id, status = %refund.status, ok = result.is_ok(), "Refund left processing during provider call");
            return Err(EcommerceError::invalid_state("refund", refund.status, "record settlement"));
        }
        let channel = self.channel(&order);
        match result {
            Ok(receipt) => {
                let txn = RefundTransaction {
                    provider_ref: Some(receipt.provider_ref),
                    raw_response: Some(receipt.raw),
                    ..self.transaction(refund_id, channel, amount, TxnStatus::Completed)
                };
                tx.upsert_refund_transaction(&txn).await?;
                refund.status = RefundStatus::Refunded;
                refund.refunded_at = Some(Utc::now());
                tx.update_refund(&refund).await?;
                Self::close_order(tx.as_mut(), order.id).await?;
                tx.commit().await?;
                info!(refund_id, order_id = order.id, provider = channel, %amount, "Refund settled");
                self.events
                    .publish(DomainEvent::RefundSettled { refund_id, order_id: order.id, provider: channel.to_string(), amount })
                    .await;
                Ok(txn)
            }
            Err(e) => {
                let reason = e.to_string();
                let txn = RefundTransaction {
                    raw_response: Some(serde_json::json!({ "error": reason })),
                    ..self.transaction(refund_id, channel, amount, TxnStatus::Failed)
                };
                tx.upsert_refund_transaction(&txn).await?;
                refund.status = RefundStatus::Failed;
                refund.failed_reason = Some(reason.clone());
                tx.update_refund(&refund).await?;
                tx.commit().await?;
                warn!(refund_id, provider = channel, %reason, "Refund failed");
                self.events.publish(DomainEvent::RefundFailed { refund_id, order_id: order.id, reason }).await;
                Err(e.into())
            }
        }
    }

    /// Customer cancellation before shipment: a pre-approved full refund of the remaining lines
    /// and the delivery fee, restocked and settled at once.
    #[instrument(skip(self))]
    pub async fn cancel_order_with_auto_refund(&self, order_id: i64, user_id: i64) -> Result<CancellationOutcome> {
        let refund_id = {
            let mut tx = self.store.begin().await?;
            let order = tx.order_for_update(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
            if !order.is_owned_by(user_id) {
                return Err(EcommerceError::Forbidden);
            }
            if let Some(existing) = tx.refunds_for_order(order_id).await?.iter().find(|r| r.status.is_active()) {
                return Err(EcommerceError::DuplicateRefund { existing_refund_id: existing.id });
            }
            if !order.status.is_pre_shipment() {
                return Err(EcommerceError::invalid_state("order", order.status, "cancel"));
            }
            let items = tx.order_items(order_id).await?;
            let usage = tx.refund_usage(order_id).await?;
            let remaining = remaining_refundable(&items, &usage);
            let lines: Vec<RequestedLine> = items
                .iter()
                .filter_map(|i| {
                    let quantity = remaining.get(&i.id).copied().unwrap_or(0);
                    (quantity > 0).then_some(RequestedLine { order_item_id: i.id, quantity })
                })
                .collect();
            let mut planned = plan_refund_items(&items, &usage, &lines)?;
            for item in &mut planned {
                item.qty_approved = item.qty_requested;
            }

            let now = Utc::now();
            let refund_id = tx
                .insert_refund(&NewRefund {
                    order_id,
                    user_id,
                    refund_type: RefundType::Cancellation,
                    reason: RefundReason::ChangedMind,
                    note: Some("Cancelled by customer before shipment".into()),
                    preferred_method: PreferredMethod::OriginalPayment,
                    status: RefundStatus::Approved,
                    admin_id: None,
                    approved_at: Some(now),
                    shipping_refund: round2(order.shipping_fee),
                })
                .await?;
            tx.insert_refund_items(refund_id, &planned).await?;
            let restock = planned
                .iter()
                .map(|i| StockLine { product_id: i.product_id, product_name: i.product_name.clone(), quantity: i.qty_approved })
                .collect();
            InventoryLedger::restock_in(tx.as_mut(), restock).await?;
            tx.update_order_status(order_id, OrderStatus::CancelledByUser).await?;
            tx.commit().await?;
            info!(order_id, refund_id, "Order cancelled by customer");
            refund_id
        };

        let settled = match self.process_refund(refund_id, None).await {
            Ok(_) => true,
            Err(EcommerceError::NonPositiveRefund) => false,
            Err(e) => {
                warn!(order_id, refund_id, error = %e, "Cancellation refund left for manual follow-up");
                false
            }
        };
        Ok(CancellationOutcome { refund_id, settled })
    }

    /// Starts an offline refund. Calling it again on an initiated refund is a no-op.
    /// Returns `false` when the refund was already initiated.
    #[instrument(skip(self))]
    pub async fn initiate_refund(&self, refund_id: i64, admin_id: i64) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let mut refund = tx.refund_for_update(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
        if refund.status == RefundStatus::Initiated {
            return Ok(false);
        }
        if !refund.status.can_transition_to(RefundStatus::Initiated) {
            return Err(EcommerceError::invalid_state("refund", refund.status, "initiate"));
        }
        let (order, amount) = self.checked_amount(tx.as_mut(), &refund).await?;
        refund.status = RefundStatus::Initiated;
        refund.processed_at = Some(Utc::now());
        refund.admin_id = Some(admin_id);
        tx.update_refund(&refund).await?;
        tx.upsert_refund_transaction(&self.transaction(refund_id, self.channel(&order), amount, TxnStatus::Pending))
            .await?;
        tx.commit().await?;
        info!(refund_id, admin_id, %amount, "Refund initiated");
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn complete_refund(&self, refund_id: i64, admin_id: i64, provider_ref: Option<String>) -> Result<RefundTransaction> {
        let mut tx = self.store.begin().await?;
        let mut refund = tx.refund_for_update(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
        if !refund.status.can_transition_to(RefundStatus::Completed) {
            return Err(EcommerceError::invalid_state("refund", refund.status, "complete"));
        }
        let (order, amount) = self.checked_amount(tx.as_mut(), &refund).await?;
        let txn = RefundTransaction {
            provider_ref,
            raw_response: Some(serde_json::json!({ "completed_by": admin_id })),
            ..self.transaction(refund_id, self.channel(&order), amount, TxnStatus::Completed)
        };
        tx.upsert_refund_transaction(&txn).await?;
        refund.status = RefundStatus::Completed;
        refund.refunded_at = Some(Utc::now());
        refund.admin_id = Some(admin_id);
        tx.update_refund(&refund).await?;
        Self::close_order(tx.as_mut(), order.id).await?;
        tx.commit().await?;
        self.events
            .publish(DomainEvent::RefundSettled { refund_id, order_id: order.id, provider: txn.provider.clone(), amount })
            .await;
        Ok(txn)
    }

    /// An initiated refund bounced; hand it to an operator.
    #[instrument(skip(self))]
    pub async fn fail_refund(&self, refund_id: i64, admin_id: i64, reason: &str) -> Result<Refund> {
        let mut tx = self.store.begin().await?;
        let mut refund = tx.refund_for_update(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
        if refund.status != RefundStatus::Initiated {
            return Err(EcommerceError::invalid_state("refund", refund.status, "fail"));
        }
        if let Some(mut txn) = tx.refund_transaction(refund_id).await? {
            txn.txn_status = TxnStatus::Failed;
            txn.raw_response = Some(serde_json::json!({ "error": reason }));
            tx.upsert_refund_transaction(&txn).await?;
        }
        refund.status = RefundStatus::ManualReview;
        refund.failed_reason = Some(reason.to_string());
        refund.admin_id = Some(admin_id);
        tx.update_refund(&refund).await?;
        tx.commit().await?;
        self.events
            .publish(DomainEvent::RefundFailed { refund_id, order_id: refund.order_id, reason: reason.to_string() })
            .await;
        Ok(refund)
    }

    /// Hands a failed refund, or one stranded in `processing`, to an operator.
    /// From there `process_refund` may retry; the provider call is keyed per refund.
    #[instrument(skip(self, note))]
    pub async fn mark_manual_review(&self, refund_id: i64, admin_id: i64, note: Option<String>) -> Result<Refund> {
        let mut tx = self.store.begin().await?;
        let mut refund = tx.refund_for_update(refund_id).await?.ok_or(EcommerceError::NotFound("refund"))?;
        if !matches!(refund.status, RefundStatus::Failed | RefundStatus::Processing) {
            return Err(EcommerceError::invalid_state("refund", refund.status, "mark for manual review"));
        }
        refund.status = RefundStatus::ManualReview;
        refund.admin_id = Some(admin_id);
        if note.is_some() {
            refund.admin_note = note;
        }
        tx.update_refund(&refund).await?;
        tx.commit().await?;
        Ok(refund)
    }

    /// Approved total for the refund, checked against what the order can still give back.
    async fn checked_amount(&self, tx: &mut dyn StoreTx, refund: &Refund) -> Result<(Order, Decimal)> {
        let amount = refund_amount(refund, &tx.refund_items(refund.id).await?);
        if amount <= Decimal::ZERO {
            return Err(EcommerceError::NonPositiveRefund);
        }
        let order = tx.order(refund.order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        let settled = tx.settled_refund_total(order.id, refund.id).await?;
        if settled + amount > order.total {
            warn!(refund_id = refund.id, order_id = order.id, %settled, %amount, total = %order.total, "Refund exceeds order total");
            return Err(EcommerceError::OverRefund);
        }
        Ok((order, amount))
    }

    /// Provider the refund goes back through. Orders without a settlement reference are refunded by hand.
    fn channel(&self, order: &Order) -> &'static str {
        match order.settlement_reference() {
            Some(_) => self.providers.for_method(order.payment_method).name(),
            None => MANUAL_PROVIDER,
        }
    }

    async fn dispatch(&self, order: &Order, refund_id: i64, amount: Decimal) -> std::result::Result<RefundReceipt, ProviderError> {
        let Some(settlement_ref) = order.settlement_reference() else {
            return Ok(RefundReceipt {
                provider_ref: format!("{MANUAL_PROVIDER}-{refund_id}"),
                raw: serde_json::json!({ "mode": MANUAL_PROVIDER, "payment_method": order.payment_method }),
            });
        };
        let request = RefundRequest {
            settlement_ref: settlement_ref.to_string(),
            amount_minor: to_minor_units(amount),
            currency: self.currency.clone(),
            idempotency_key: IdempotencyKey::for_refund(refund_id),
        };
        self.providers.for_method(order.payment_method).refund(&request).await
    }

    fn transaction(&self, refund_id: i64, provider: &str, amount: Decimal, status: TxnStatus) -> RefundTransaction {
        RefundTransaction {
            refund_id,
            provider: provider.to_string(),
            provider_ref: None,
            amount,
            currency: self.currency.clone(),
            txn_status: status,
            raw_response: None,
        }
    }

    async fn close_order(tx: &mut dyn StoreTx, order_id: i64) -> Result<()> {
        let order = tx.order_for_update(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if !order.status.is_cancelled() {
            tx.update_order_status(order_id, OrderStatus::Cancelled).await?;
        }
        Ok(())
    }
}
