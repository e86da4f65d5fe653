//! Domain events
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::aggregates::PaymentMethod;
use crate::domain::status::RefundStatus;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderPaid { order_id: i64, user_id: i64, total: Decimal, method: PaymentMethod },
    OrderPaymentFailed { order_id: i64, reason: String },
    RefundRequested { refund_id: i64, order_id: i64 },
    RefundDecided { refund_id: i64, order_id: i64, status: RefundStatus },
    RefundSettled { refund_id: i64, order_id: i64, provider: String, amount: Decimal },
    RefundFailed { refund_id: i64, order_id: i64, reason: String },
    PickupRedeemed { order_id: i64, code: String },
}

impl DomainEvent {
    /// Subject suffix the event is published under.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderPaid { .. } => "order.paid",
            Self::OrderPaymentFailed { .. } => "order.payment_failed",
            Self::RefundRequested { .. } => "refund.requested",
            Self::RefundDecided { .. } => "refund.decided",
            Self::RefundSettled { .. } => "refund.settled",
            Self::RefundFailed { .. } => "refund.failed",
            Self::PickupRedeemed { .. } => "pickup.redeemed",
        }
    }
}
