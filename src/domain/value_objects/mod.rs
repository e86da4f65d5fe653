//! Value Objects for checkout and settlement

use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An amount in a single currency, normalised to two decimal places.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    value: Decimal,
    currency: String,
}

impl Money {
    pub fn new(value: Decimal, currency: &str) -> Self {
        Money { value: round2(value), currency: currency.to_ascii_uppercase() }
    }

    /// Cents as reported by a provider.
    pub fn from_minor(cents: i64, currency: &str) -> Self {
        Money::new(Decimal::new(cents, 2), currency)
    }

    pub fn amount(&self) -> Decimal {
        self.value
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn minor_units(&self) -> i64 {
        to_minor_units(self.value)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.value, self.currency)
    }
}

pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Integer cents, the unit every provider reports amounts in.
pub fn to_minor_units(amount: Decimal) -> i64 {
    (round2(amount) * Decimal::ONE_HUNDRED).to_i64().unwrap_or(i64::MAX)
}

/// Pickup code handed to the customer for in-store collection, `ZP-######`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PickupCode(String);

impl PickupCode {
    pub const PREFIX: &'static str = "ZP-";

    /// Draws a code from the first `space` six-digit numbers. Production uses the full space.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, space: u32) -> Self {
        let n = rng.gen_range(0..space.clamp(1, 1_000_000));
        Self(format!("{}{:06}", Self::PREFIX, n))
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_uppercase();
        let digits = value.strip_prefix(Self::PREFIX)?;
        (digits.len() == 6 && digits.bytes().all(|b| b.is_ascii_digit())).then(|| Self(value))
    }

    pub fn as_str(&self) -> &str { &self.0 }
    pub fn into_inner(self) -> String { self.0 }
}

impl fmt::Display for PickupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Deterministic key passed to providers so a retried request maps to one charge.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_order(order_id: i64) -> Self { Self(format!("order-{order_id}")) }
    pub fn for_refund(refund_id: i64) -> Self { Self(format!("refund-{refund_id}")) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_normalises_scale_and_currency() {
        let m = Money::new(Decimal::new(12345, 3), "sgd");
        assert_eq!(m.amount(), Decimal::new(1235, 2));
        assert_eq!(m.currency(), "SGD");
        assert_eq!(m.minor_units(), 1235);
        assert_eq!(m.to_string(), "12.35 SGD");
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(Decimal::new(2200, 2)), 2200);
        assert_eq!(to_minor_units(Decimal::new(21, 0)), 2100);
        assert_eq!(Money::from_minor(2100, "SGD").amount(), Decimal::new(2100, 2));
    }

    #[test]
    fn test_pickup_code_format() {
        let code = PickupCode::random(&mut rand::thread_rng(), 1_000_000);
        assert!(code.as_str().starts_with("ZP-"));
        assert_eq!(code.as_str().len(), 9);
        assert_eq!(PickupCode::parse(" zp-004211 ").unwrap().as_str(), "ZP-004211");
        assert!(PickupCode::parse("ZP-12").is_none());
    }
}
