//! Order and refund status vocabulary
//!
//! Stored statuses are free-form strings (legacy rows carry "Payment Successful",
//! "payment_successful" and friends). Every comparison goes through [`normalize`]
//! and the closed [`OrderStatus`] / [`RefundStatus`] sets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowercases, trims and collapses whitespace runs into a single underscore.
pub fn normalize(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

pub fn is_pending(key: &str) -> bool {
    key == "pending_payment" || key == "pending"
}

/// Paid covers the successful payment and every fulfilment state downstream of it.
pub fn is_paid(key: &str) -> bool {
    matches!(
        key,
        "payment_successful"
            | "packing"
            | "out_for_delivery"
            | "ready_for_pickup"
            | "pickup_pending"
            | "completed"
            | "refund_rejected"
            | "refunded"
            | "partially_refunded"
    )
}

pub fn is_cancelled(key: &str) -> bool {
    key.starts_with("cancelled")
}

pub fn is_failed(key: &str) -> bool {
    key == "payment_failed" || key == "failed"
}

/// States in which a late payment confirmation must not touch the order.
pub fn is_refund_terminal(key: &str) -> bool {
    matches!(key, "refund_requested" | "refund_completed" | "refunded")
}

pub fn can_invoice(key: &str) -> bool {
    is_paid(key) && !is_cancelled(key) && !matches!(key, "refund_requested" | "refund_completed")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    PaymentFailed,
    PaymentSuccessful,
    Packing,
    OutForDelivery,
    ReadyForPickup,
    PickupPending,
    Completed,
    RefundRequested,
    RefundRejected,
    RefundCompleted,
    Refunded,
    PartiallyRefunded,
    Cancelled,
    CancelledByUser,
    CancelledByAdmin,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentSuccessful => "payment_successful",
            Self::Packing => "packing",
            Self::OutForDelivery => "out_for_delivery",
            Self::ReadyForPickup => "ready_for_pickup",
            Self::PickupPending => "pickup_pending",
            Self::Completed => "completed",
            Self::RefundRequested => "refund_requested",
            Self::RefundRejected => "refund_rejected",
            Self::RefundCompleted => "refund_completed",
            Self::Refunded => "refunded",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Cancelled => "cancelled",
            Self::CancelledByUser => "cancelled_by_user",
            Self::CancelledByAdmin => "cancelled_by_admin",
        }
    }

    pub fn is_pending(&self) -> bool { is_pending(self.as_str()) }
    pub fn is_paid(&self) -> bool { is_paid(self.as_str()) }
    pub fn is_cancelled(&self) -> bool { is_cancelled(self.as_str()) }
    pub fn is_failed(&self) -> bool { is_failed(self.as_str()) }
    pub fn is_refund_terminal(&self) -> bool { is_refund_terminal(self.as_str()) }
    pub fn can_invoice(&self) -> bool { can_invoice(self.as_str()) }

    /// A confirmed payment may never resurrect an order in one of these states.
    pub fn blocks_payment(&self) -> bool {
        self.is_cancelled() || self.is_refund_terminal()
    }

    /// Orders the customer may still cancel for an automatic full refund.
    pub fn is_pre_shipment(&self) -> bool {
        matches!(
            self,
            Self::PaymentSuccessful | Self::Packing | Self::ReadyForPickup | Self::PickupPending
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "unknown status {:?}", self.0) }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let status = match normalize(raw).as_str() {
            "pending_payment" | "pending" => Self::PendingPayment,
            "payment_failed" | "failed" => Self::PaymentFailed,
            "payment_successful" | "paid" => Self::PaymentSuccessful,
            "packing" => Self::Packing,
            "out_for_delivery" => Self::OutForDelivery,
            "ready_for_pickup" => Self::ReadyForPickup,
            "pickup_pending" => Self::PickupPending,
            "completed" => Self::Completed,
            "refund_requested" => Self::RefundRequested,
            "refund_rejected" => Self::RefundRejected,
            "refund_completed" => Self::RefundCompleted,
            "refunded" => Self::Refunded,
            "partially_refunded" => Self::PartiallyRefunded,
            "cancelled" | "canceled" => Self::Cancelled,
            "cancelled_by_user" => Self::CancelledByUser,
            "cancelled_by_admin" => Self::CancelledByAdmin,
            _ => return Err(UnknownStatus(raw.to_string())),
        };
        Ok(status)
    }
}

/// Refund request lifecycle.
///
/// ```text
/// requested -> approved -> processing -> refunded
/// requested -> rejected
/// processing -> failed -> manual_review
/// processing -> manual_review
/// approved -> initiated -> completed | manual_review
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Requested,
    Approved,
    Rejected,
    Processing,
    Refunded,
    Failed,
    ManualReview,
    Initiated,
    Completed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Processing => "processing",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
            Self::ManualReview => "manual_review",
            Self::Initiated => "initiated",
            Self::Completed => "completed",
        }
    }

    pub fn is_active(&self) -> bool { *self != Self::Rejected }

    pub fn is_settled(&self) -> bool { matches!(self, Self::Refunded | Self::Completed) }

    /// Whether provider settlement may be (re)attempted from this state.
    pub fn can_process(&self) -> bool {
        matches!(self, Self::Approved | Self::Failed | Self::ManualReview)
    }

    pub fn can_transition_to(&self, next: RefundStatus) -> bool {
        use RefundStatus::*;
        matches!(
            (self, next),
            (Requested, Approved)
                | (Requested, Rejected)
                | (Approved, Processing)
                | (Failed, Processing)
                | (ManualReview, Processing)
                | (Processing, Refunded)
                | (Processing, Failed)
                | (Failed, ManualReview)
                | (Processing, ManualReview)
                | (Approved, Initiated)
                | (Initiated, Completed)
                | (Initiated, ManualReview)
        )
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for RefundStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let status = match normalize(raw).as_str() {
            "requested" | "pending" => Self::Requested,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "processing" => Self::Processing,
            "refunded" => Self::Refunded,
            "failed" => Self::Failed,
            "manual_review" => Self::ManualReview,
            "initiated" => Self::Initiated,
            "completed" => Self::Completed,
            _ => return Err(UnknownStatus(raw.to_string())),
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Payment   Successful "), "payment_successful");
        assert_eq!(normalize("Out For\tDelivery"), "out_for_delivery");
        assert_eq!(normalize("payment_successful"), "payment_successful");
    }

    #[test]
    fn test_legacy_strings_parse() {
        assert_eq!("Payment Successful".parse::<OrderStatus>().unwrap(), OrderStatus::PaymentSuccessful);
        assert_eq!("Cancelled By User".parse::<OrderStatus>().unwrap(), OrderStatus::CancelledByUser);
        assert!("shipped somewhere".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_predicates() {
        assert!(is_paid("refund_rejected"));
        assert!(!is_paid("refund_requested"));
        assert!(is_cancelled("cancelled_by_admin"));
        assert!(can_invoice("packing"));
        assert!(!can_invoice("refund_requested"));
        assert!(!can_invoice("pending_payment"));
        assert!(OrderStatus::Refunded.blocks_payment());
        assert!(!OrderStatus::PaymentFailed.blocks_payment());
    }

    #[test]
    fn test_refund_transitions_never_move_backward() {
        assert!(RefundStatus::Requested.can_transition_to(RefundStatus::Approved));
        assert!(!RefundStatus::Approved.can_transition_to(RefundStatus::Requested));
        assert!(!RefundStatus::Rejected.can_transition_to(RefundStatus::Approved));
        assert!(!RefundStatus::Refunded.can_transition_to(RefundStatus::Processing));
        assert!(RefundStatus::Failed.can_process());
        assert!(RefundStatus::Processing.can_transition_to(RefundStatus::ManualReview));
        assert!(!RefundStatus::Processing.can_process());
    }
}
