//! Cart Aggregate and checkout snapshot

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::aggregates::order::{DeliveryType, NewOrderItem, PaymentMethod};
use crate::domain::value_objects::round2;

/// One cart row joined with the product it points at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: i64,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl CartLine {
    pub fn line_total(&self) -> Decimal { round2(self.unit_price * Decimal::from(self.quantity)) }
}

/// Profile values checkout falls back to, plus the membership entitlement flag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub membership_active: bool,
}

/// Shipping preference carried across the checkout steps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingChoice {
    pub delivery_type: DeliveryType,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub address: Option<String>,
    pub payment_method: Option<String>,
}

/// Immutable view of what the customer is about to pay for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSnapshot {
    pub user_id: i64,
    pub items: Vec<CartLine>,
    pub delivery_type: DeliveryType,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub address: Option<String>,
    pub payment_method: PaymentMethod,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub total: Decimal,
}

impl CheckoutSnapshot {
    pub fn product_ids(&self) -> Vec<i64> { self.items.iter().map(|i| i.product_id).collect() }

    pub fn order_items(&self) -> Vec<NewOrderItem> {
        self.items
            .iter()
            .map(|i| NewOrderItem {
                product_id: Some(i.product_id),
                product_name: i.product_name.clone(),
                quantity: i.quantity,
                unit_price: i.unit_price,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError { EmptyCart, NoItemsSelected, InvalidPaymentMethod(String) }
impl std::error::Error for SnapshotError {}
impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCart => write!(f, "Your cart is empty"),
            Self::NoItemsSelected => write!(f, "No items selected for checkout"),
            Self::InvalidPaymentMethod(m) => write!(f, "{m}"),
        }
    }
}

/// Parses a session-held selection ("3", " 4 ", "x") into product ids, dropping non-numeric entries.
///
/// `None` when nothing was selected at all, which checks out the whole cart. A selection
/// whose entries are all unusable stays `Some(vec![])` and selects nothing.
pub fn parse_selection<S: AsRef<str>>(raw: &[S]) -> Option<Vec<i64>> {
    let entries: Vec<&str> = raw.iter().map(|s| s.as_ref().trim()).filter(|s| !s.is_empty()).collect();
    if entries.is_empty() {
        return None;
    }
    Some(entries.into_iter().filter_map(|s| s.parse::<i64>().ok()).collect())
}

/// Builds the checkout snapshot. No selection means "everything in the cart".
pub fn build_snapshot(
    profile: &UserProfile,
    cart: &[CartLine],
    selection: Option<&[i64]>,
    choice: &ShippingChoice,
    flat_shipping_fee: Decimal,
) -> Result<CheckoutSnapshot, SnapshotError> {
    if cart.is_empty() { return Err(SnapshotError::EmptyCart); }

    let items: Vec<CartLine> = match selection {
        None => cart.to_vec(),
        Some(ids) => {
            let wanted: HashSet<i64> = ids.iter().copied().collect();
            cart.iter().filter(|l| wanted.contains(&l.product_id)).cloned().collect()
        }
    };
    if items.is_empty() { return Err(SnapshotError::NoItemsSelected); }

    let payment_method = match choice.payment_method.as_deref() {
        Some(raw) => raw.parse::<PaymentMethod>().map_err(SnapshotError::InvalidPaymentMethod)?,
        None => PaymentMethod::Card,
    };

    let subtotal = items.iter().fold(Decimal::ZERO, |acc, l| acc + l.line_total());
    let shipping_fee = match choice.delivery_type {
        DeliveryType::Pickup => Decimal::ZERO,
        DeliveryType::Delivery if profile.membership_active => Decimal::ZERO,
        DeliveryType::Delivery => round2(flat_shipping_fee),
    };
    let address = match choice.delivery_type {
        DeliveryType::Delivery => non_blank(&choice.address).or_else(|| profile.address.clone()),
        DeliveryType::Pickup => None,
    };

    Ok(CheckoutSnapshot {
        user_id: profile.id,
        items,
        delivery_type: choice.delivery_type,
        contact_name: non_blank(&choice.contact_name).or_else(|| profile.name.clone()),
        contact_phone: non_blank(&choice.contact_phone).or_else(|| profile.phone.clone()),
        address,
        payment_method,
        subtotal: round2(subtotal),
        shipping_fee,
        total: round2(subtotal + shipping_fee),
    })
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart() -> Vec<CartLine> {
        vec![
            CartLine { product_id: 1, product_name: "Widget".into(), unit_price: Decimal::new(1000, 2), quantity: 1 },
            CartLine { product_id: 2, product_name: "Gadget".into(), unit_price: Decimal::new(500, 2), quantity: 2 },
        ]
    }

    fn profile(membership_active: bool) -> UserProfile {
        UserProfile { id: 9, name: Some("Ana".into()), phone: Some("5550100".into()), address: Some("1 Main St".into()), membership_active }
    }

    #[test]
    fn test_pickup_snapshot_has_no_shipping() {
        let choice = ShippingChoice { delivery_type: DeliveryType::Pickup, ..Default::default() };
        let snap = build_snapshot(&profile(false), &cart(), None, &choice, Decimal::new(200, 2)).unwrap();
        assert_eq!(snap.subtotal, Decimal::new(2000, 2));
        assert_eq!(snap.shipping_fee, Decimal::ZERO);
        assert_eq!(snap.total, Decimal::new(2000, 2));
        assert_eq!(snap.address, None);
    }

    #[test]
    fn test_delivery_snapshot_adds_flat_fee() {
        let choice = ShippingChoice { delivery_type: DeliveryType::Delivery, ..Default::default() };
        let snap = build_snapshot(&profile(false), &cart(), None, &choice, Decimal::new(200, 2)).unwrap();
        assert_eq!(snap.total, Decimal::new(2200, 2));
        assert_eq!(snap.address.as_deref(), Some("1 Main St"));
        assert_eq!(snap.contact_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn test_membership_waives_delivery_fee() {
        let choice = ShippingChoice { delivery_type: DeliveryType::Delivery, ..Default::default() };
        let snap = build_snapshot(&profile(true), &cart(), None, &choice, Decimal::new(200, 2)).unwrap();
        assert_eq!(snap.shipping_fee, Decimal::ZERO);
    }

    #[test]
    fn test_selection_filters_and_rejects_empty() {
        let choice = ShippingChoice::default();
        let picked = parse_selection(&["2", "x"]);
        let snap = build_snapshot(&profile(false), &cart(), picked.as_deref(), &choice, Decimal::ZERO).unwrap();
        assert_eq!(snap.product_ids(), vec![2]);
        let err = build_snapshot(&profile(false), &cart(), Some(&[42][..]), &choice, Decimal::ZERO).unwrap_err();
        assert_eq!(err, SnapshotError::NoItemsSelected);
    }

    #[test]
    fn test_unparseable_selection_selects_nothing() {
        let choice = ShippingChoice::default();
        let garbage = parse_selection(&["abc", " "]);
        assert_eq!(garbage, Some(vec![]));
        let err = build_snapshot(&profile(false), &cart(), garbage.as_deref(), &choice, Decimal::ZERO).unwrap_err();
        assert_eq!(err, SnapshotError::NoItemsSelected);

        assert_eq!(parse_selection(&["", "  "]), None);
        assert_eq!(parse_selection::<&str>(&[]), None);
    }

    #[test]
    fn test_legacy_paynow_maps_to_qr() {
        let choice = ShippingChoice { payment_method: Some("paynow".into()), ..Default::default() };
        let snap = build_snapshot(&profile(false), &cart(), None, &choice, Decimal::ZERO).unwrap();
        assert_eq!(snap.payment_method, PaymentMethod::QrPoll);
    }
}
