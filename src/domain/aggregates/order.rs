//! Order Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::status::{normalize, OrderStatus};
use crate::domain::value_objects::{round2, to_minor_units};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub total: Decimal,
    pub shipping_fee: Decimal,
    pub payment_method: PaymentMethod,
    pub delivery_type: DeliveryType,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub address: Option<String>,
    pub pickup_code: Option<String>,
    pub pickup_code_status: Option<PickupStatus>,
    pub pickup_code_redeemed_at: Option<DateTime<Utc>>,
    pub refs: ProviderRefs,
    pub status: OrderStatus,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn total_minor(&self) -> i64 { to_minor_units(self.total) }
    pub fn is_owned_by(&self, user_id: i64) -> bool { self.user_id == user_id }

    /// The reference a provider notification or confirmation for this order must carry.
    pub fn payment_reference(&self) -> Option<ProviderRef> {
        match self.payment_method {
            PaymentMethod::Card => self.refs.payment_intent_id.clone().map(ProviderRef::PaymentIntent),
            PaymentMethod::Wallet => self.refs.wallet_order_id.clone().map(ProviderRef::WalletOrder),
            PaymentMethod::QrPoll => self.refs.qr_retrieval_ref.clone().map(ProviderRef::QrRetrieval),
        }
    }

    /// The reference a provider refund is executed against, once the payment settled.
    pub fn settlement_reference(&self) -> Option<&str> {
        match self.payment_method {
            PaymentMethod::Card => self.refs.payment_intent_id.as_deref(),
            PaymentMethod::Wallet => self.refs.wallet_capture_id.as_deref(),
            PaymentMethod::QrPoll => None,
        }
    }
}

/// Provider correlation ids. Each is written at most once per provider flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRefs {
    pub payment_intent_id: Option<String>,
    pub wallet_order_id: Option<String>,
    pub wallet_capture_id: Option<String>,
    pub qr_retrieval_ref: Option<String>,
    pub qr_course_init_id: Option<String>,
}

impl ProviderRefs {
    pub fn get(&self, kind: ProviderRefKind) -> Option<&str> {
        match kind {
            ProviderRefKind::PaymentIntent => self.payment_intent_id.as_deref(),
            ProviderRefKind::WalletOrder => self.wallet_order_id.as_deref(),
            ProviderRefKind::WalletCapture => self.wallet_capture_id.as_deref(),
            ProviderRefKind::QrRetrieval => self.qr_retrieval_ref.as_deref(),
            ProviderRefKind::QrCourseInit => self.qr_course_init_id.as_deref(),
        }
    }

    pub fn slot(&mut self, kind: ProviderRefKind) -> &mut Option<String> {
        match kind {
            ProviderRefKind::PaymentIntent => &mut self.payment_intent_id,
            ProviderRefKind::WalletOrder => &mut self.wallet_order_id,
            ProviderRefKind::WalletCapture => &mut self.wallet_capture_id,
            ProviderRefKind::QrRetrieval => &mut self.qr_retrieval_ref,
            ProviderRefKind::QrCourseInit => &mut self.qr_course_init_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRefKind { PaymentIntent, WalletOrder, WalletCapture, QrRetrieval, QrCourseInit }

impl ProviderRefKind {
    pub fn column(&self) -> &'static str {
        match self {
            Self::PaymentIntent => "payment_intent_id",
            Self::WalletOrder => "wallet_order_id",
            Self::WalletCapture => "wallet_capture_id",
            Self::QrRetrieval => "qr_retrieval_ref",
            Self::QrCourseInit => "qr_course_init_id",
        }
    }
}

/// A provider-side identifier tagged with the column it correlates through.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProviderRef {
    PaymentIntent(String),
    WalletOrder(String),
    WalletCapture(String),
    QrRetrieval(String),
    QrCourseInit(String),
}

impl ProviderRef {
    pub fn kind(&self) -> ProviderRefKind {
        match self {
            Self::PaymentIntent(_) => ProviderRefKind::PaymentIntent,
            Self::WalletOrder(_) => ProviderRefKind::WalletOrder,
            Self::WalletCapture(_) => ProviderRefKind::WalletCapture,
            Self::QrRetrieval(_) => ProviderRefKind::QrRetrieval,
            Self::QrCourseInit(_) => ProviderRefKind::QrCourseInit,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::PaymentIntent(v) | Self::WalletOrder(v) | Self::WalletCapture(v) | Self::QrRetrieval(v) | Self::QrCourseInit(v) => v,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { Card, Wallet, QrPoll }

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Card => "card", Self::Wallet => "wallet", Self::QrPoll => "qr_poll" }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for PaymentMethod {
    type Err = String;

    /// Accepts the legacy aliases still present in sessions and stored rows.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match normalize(raw).as_str() {
            "card" | "stripe" | "credit_card" => Ok(Self::Card),
            "wallet" | "paypal" | "wallet_redirect" => Ok(Self::Wallet),
            "qr_poll" | "qr" | "paynow" | "nets" | "nets_qr" => Ok(Self::QrPoll),
            other => Err(format!("unsupported payment method {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType { #[default] Pickup, Delivery }

impl DeliveryType {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pickup => "pickup", Self::Delivery => "delivery" }
    }
}

impl FromStr for DeliveryType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match normalize(raw).as_str() {
            "pickup" | "self_pickup" | "collect" => Ok(Self::Pickup),
            "delivery" | "ship" | "shipping" => Ok(Self::Delivery),
            other => Err(format!("unsupported delivery type {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickupStatus { Active, Redeemed }

impl PickupStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Active => "active", Self::Redeemed => "redeemed" }
    }
}

impl FromStr for PickupStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match normalize(raw).as_str() {
            "active" => Ok(Self::Active),
            "redeemed" => Ok(Self::Redeemed),
            other => Err(format!("unknown pickup status {other:?}")),
        }
    }
}

/// Line item snapshot. `product_id` is cleared if the product is later deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: Option<i64>,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl OrderItem {
    pub fn line_total(&self) -> Decimal { round2(self.unit_price * Decimal::from(self.quantity)) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: Option<i64>,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Clone, Debug)]
pub struct NewOrder {
    pub user_id: i64,
    pub total: Decimal,
    pub shipping_fee: Decimal,
    pub payment_method: PaymentMethod,
    pub delivery_type: DeliveryType,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub address: Option<String>,
    pub pickup_code: Option<String>,
    pub status: OrderStatus,
}

/// Record of one attempt to collect payment from a provider for an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub order_id: i64,
    pub provider: PaymentMethod,
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_payment_aliases() {
        assert_eq!("PayNow".parse::<PaymentMethod>().unwrap(), PaymentMethod::QrPoll);
        assert_eq!("paypal".parse::<PaymentMethod>().unwrap(), PaymentMethod::Wallet);
        assert_eq!("Card".parse::<PaymentMethod>().unwrap(), PaymentMethod::Card);
        assert!("cash".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn test_line_total() {
        let item = OrderItem { id: 1, order_id: 1, product_id: Some(7), product_name: "Tea".into(), quantity: 3, unit_price: Decimal::new(400, 2) };
        assert_eq!(item.line_total(), Decimal::new(1200, 2));
    }

    #[test]
    fn test_provider_ref_slots() {
        let mut refs = ProviderRefs::default();
        *refs.slot(ProviderRefKind::WalletOrder) = Some("W-1".into());
        assert_eq!(refs.get(ProviderRefKind::WalletOrder), Some("W-1"));
        assert_eq!(ProviderRef::QrRetrieval("r".into()).kind().column(), "qr_retrieval_ref");
    }
}
