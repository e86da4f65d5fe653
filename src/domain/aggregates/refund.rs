//! Refund Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::domain::aggregates::order::OrderItem;
use crate::domain::status::{normalize, RefundStatus};
use crate::domain::value_objects::round2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Refund {
    pub id: i64,
    pub order_id: i64,
    pub user_id: i64,
    pub refund_type: RefundType,
    pub reason: RefundReason,
    pub note: Option<String>,
    pub preferred_method: PreferredMethod,
    pub status: RefundStatus,
    pub admin_id: Option<i64>,
    pub admin_note: Option<String>,
    pub rejection_reason: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    /// Delivery fee returned on top of the item lines. Only cancellations carry one.
    pub shipping_refund: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewRefund {
    pub order_id: i64,
    pub user_id: i64,
    pub refund_type: RefundType,
    pub reason: RefundReason,
    pub note: Option<String>,
    pub preferred_method: PreferredMethod,
    pub status: RefundStatus,
    pub admin_id: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
    pub shipping_refund: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundItem {
    pub id: i64,
    pub refund_id: i64,
    pub order_item_id: i64,
    pub product_id: Option<i64>,
    pub product_name: String,
    pub qty_requested: i32,
    pub qty_approved: i32,
    pub unit_price: Decimal,
    pub line_refund_amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRefundItem {
    pub order_item_id: i64,
    pub product_id: Option<i64>,
    pub product_name: String,
    pub qty_requested: i32,
    pub qty_approved: i32,
    pub unit_price: Decimal,
}

impl NewRefundItem {
    pub fn line_refund_amount(&self) -> Decimal {
        round2(self.unit_price * Decimal::from(self.qty_approved))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnStatus { Pending, Completed, Failed }

impl TxnStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Completed => "completed", Self::Failed => "failed" }
    }
}

impl FromStr for TxnStatus {
    type Err = String;
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match normalize(raw).as_str() {
            "pending" => Ok(Self::Pending),
            "completed" | "succeeded" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transaction status {other:?}")),
        }
    }
}

/// Provider-side settlement record for a refund. One per refund, upserted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundTransaction {
    pub refund_id: i64,
    pub provider: String,
    pub provider_ref: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub txn_status: TxnStatus,
    pub raw_response: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundEvidence {
    pub file_ref: String,
    pub content_type: String,
}

impl RefundEvidence {
    pub const MAX_PER_REFUND: usize = 3;
    pub fn is_image(&self) -> bool { self.content_type.trim().to_ascii_lowercase().starts_with("image/") }
}

macro_rules! closed_set {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name { $($variant),+ }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self { $(Self::$variant => $text),+ }
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match normalize(raw).as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unsupported ", stringify!($name), " {:?}"), other)),
                }
            }
        }
    };
}

closed_set!(RefundType {
    Full => "full",
    Partial => "partial",
    PriceAdjustment => "price_adjustment",
    Cancellation => "cancellation",
    DeliveryFee => "delivery_fee",
    Substitution => "substitution",
});

closed_set!(RefundReason {
    Damaged => "damaged",
    WrongItem => "wrong_item",
    MissingItem => "missing_item",
    NotAsDescribed => "not_as_described",
    ChangedMind => "changed_mind",
    LateDelivery => "late_delivery",
    Other => "other",
});

closed_set!(PreferredMethod {
    OriginalPayment => "original_payment",
    StoreCredit => "store_credit",
    BankTransfer => "bank_transfer",
});

/// Quantity a refund holds against an order item, taken from every refund on the order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundUsage {
    pub refund_id: i64,
    pub status: RefundStatus,
    pub order_item_id: i64,
    pub qty_requested: i32,
    pub qty_approved: i32,
}

impl RefundUsage {
    /// Requested quantity while undecided, approved quantity afterwards, nothing once rejected.
    pub fn used_qty(&self) -> i32 {
        match self.status {
            RefundStatus::Rejected => 0,
            RefundStatus::Requested => self.qty_requested,
            _ => self.qty_approved,
        }
    }
}

/// Remaining refundable quantity per order item id.
pub fn remaining_refundable(items: &[OrderItem], usage: &[RefundUsage]) -> HashMap<i64, i32> {
    let mut used: HashMap<i64, i32> = HashMap::new();
    for u in usage {
        *used.entry(u.order_item_id).or_default() += u.used_qty();
    }
    items
        .iter()
        .map(|i| (i.id, (i.quantity - used.get(&i.id).copied().unwrap_or(0)).max(0)))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedLine {
    pub order_item_id: i64,
    pub quantity: i32,
}

/// Outcome of validating a whole refund request against the order before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineViolation {
    UnknownItem(i64),
    NonPositive(i64),
    Exceeds { order_item_id: i64, requested: i32, remaining: i32 },
}

/// Validates every requested line first, then builds the refund items. A single violation rejects the batch.
pub fn plan_refund_items(
    items: &[OrderItem],
    usage: &[RefundUsage],
    lines: &[RequestedLine],
) -> Result<Vec<NewRefundItem>, LineViolation> {
    let remaining = remaining_refundable(items, usage);
    let mut requested: HashMap<i64, i32> = HashMap::new();
    for line in lines {
        if line.quantity <= 0 { return Err(LineViolation::NonPositive(line.order_item_id)); }
        let total = requested.entry(line.order_item_id).or_default();
        *total = total.checked_add(line.quantity).ok_or_else(|| LineViolation::Exceeds {
            order_item_id: line.order_item_id,
            requested: i32::MAX,
            remaining: remaining.get(&line.order_item_id).copied().unwrap_or(0),
        })?;
    }

    let mut planned = Vec::with_capacity(requested.len());
    for item in items {
        let Some(&qty) = requested.get(&item.id) else { continue };
        let left = remaining.get(&item.id).copied().unwrap_or(0);
        if qty > left {
            return Err(LineViolation::Exceeds { order_item_id: item.id, requested: qty, remaining: left });
        }
        planned.push(NewRefundItem {
            order_item_id: item.id,
            product_id: item.product_id,
            product_name: item.product_name.clone(),
            qty_requested: qty,
            qty_approved: 0,
            unit_price: item.unit_price,
        });
    }
    if let Some(unknown) = requested.keys().find(|id| !items.iter().any(|i| i.id == **id)) {
        return Err(LineViolation::UnknownItem(*unknown));
    }
    Ok(planned)
}

/// Approved quantity for a line: the admin override clamped to `[0, requested]`, else the requested quantity.
pub fn approved_quantity(requested: i32, override_qty: Option<i32>) -> i32 {
    override_qty.map_or(requested, |q| q.clamp(0, requested))
}

pub fn approved_total(items: &[RefundItem]) -> Decimal {
    round2(items.iter().fold(Decimal::ZERO, |acc, i| acc + i.line_refund_amount))
}

/// What the refund pays out: approved lines plus any returned delivery fee.
pub fn refund_amount(refund: &Refund, items: &[RefundItem]) -> Decimal {
    round2(approved_total(items) + refund.shipping_refund)
}
