//! Persistent store contract
//!
//! Every state change goes through a [`StoreTx`]. Dropping a transaction without
//! calling [`StoreTx::commit`] rolls it back. The `*_for_update` lookups take a
//! row lock that is held until the transaction ends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::aggregates::{
    CartLine, NewOrder, NewOrderItem, NewRefund, NewRefundItem, Order, OrderItem, PaymentTransaction, ProviderRef,
    Refund, RefundEvidence, RefundItem, RefundTransaction, RefundUsage, UserProfile,
};
use crate::domain::status::OrderStatus;
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    // -- users, cart, inventory ------------------------------------------------

    async fn user_profile(&mut self, user_id: i64) -> Result<Option<UserProfile>>;
    async fn cart_lines(&mut self, user_id: i64) -> Result<Vec<CartLine>>;
    async fn clear_cart_products(&mut self, user_id: i64, product_ids: &[i64]) -> Result<u64>;
    /// `stock = GREATEST(stock - qty, 0)`; never fails on an empty shelf.
    async fn decrement_stock(&mut self, product_id: i64, qty: i32) -> Result<()>;
    async fn increment_stock(&mut self, product_id: i64, qty: i32) -> Result<()>;
    /// Lowest product id whose name matches, ignoring case. Used for lines whose product link was cleared.
    async fn product_id_by_name(&mut self, name: &str) -> Result<Option<i64>>;

    // -- orders ----------------------------------------------------------------

    async fn insert_order(&mut self, order: &NewOrder) -> Result<i64>;
    /// No-op on an empty slice.
    async fn insert_order_items(&mut self, order_id: i64, items: &[NewOrderItem]) -> Result<()>;
    async fn order(&mut self, order_id: i64) -> Result<Option<Order>>;
    async fn order_for_update(&mut self, order_id: i64) -> Result<Option<Order>>;
    async fn order_by_ref(&mut self, reference: &ProviderRef) -> Result<Option<Order>>;
    async fn order_by_pickup_code(&mut self, code: &str) -> Result<Option<Order>>;
    async fn order_items(&mut self, order_id: i64) -> Result<Vec<OrderItem>>;
    async fn pickup_code_exists(&mut self, code: &str) -> Result<bool>;
    /// Stamps `cancelled_at` when the new status is a cancelled one.
    async fn update_order_status(&mut self, order_id: i64, status: OrderStatus) -> Result<()>;
    /// Writes the reference only if the slot is empty or already holds the same value.
    /// Returns `false` when a different value is already stored.
    async fn set_provider_ref(&mut self, order_id: i64, reference: &ProviderRef) -> Result<bool>;
    async fn redeem_pickup(&mut self, order_id: i64, at: DateTime<Utc>) -> Result<()>;
    /// Removes the order together with its items and payment transaction rows.
    async fn delete_order(&mut self, order_id: i64) -> Result<()>;
    async fn insert_payment_transaction(&mut self, txn: &PaymentTransaction) -> Result<()>;
    async fn payment_transactions(&mut self, order_id: i64) -> Result<Vec<PaymentTransaction>>;

    // -- refunds ---------------------------------------------------------------

    async fn insert_refund(&mut self, refund: &NewRefund) -> Result<i64>;
    async fn insert_refund_items(&mut self, refund_id: i64, items: &[NewRefundItem]) -> Result<()>;
    async fn insert_refund_evidence(&mut self, refund_id: i64, evidence: &[RefundEvidence]) -> Result<()>;
    async fn refund(&mut self, refund_id: i64) -> Result<Option<Refund>>;
    async fn refund_for_update(&mut self, refund_id: i64) -> Result<Option<Refund>>;
    async fn refund_items(&mut self, refund_id: i64) -> Result<Vec<RefundItem>>;
    async fn refund_evidence(&mut self, refund_id: i64) -> Result<Vec<RefundEvidence>>;
    /// Persists every mutable column of the refund row.
    async fn update_refund(&mut self, refund: &Refund) -> Result<()>;
    async fn set_refund_item_approved(&mut self, refund_item_id: i64, qty_approved: i32, line_amount: Decimal) -> Result<()>;
    async fn refunds_for_order(&mut self, order_id: i64) -> Result<Vec<Refund>>;
    async fn refund_usage(&mut self, order_id: i64) -> Result<Vec<RefundUsage>>;
    async fn upsert_refund_transaction(&mut self, txn: &RefundTransaction) -> Result<()>;
    async fn refund_transaction(&mut self, refund_id: i64) -> Result<Option<RefundTransaction>>;
    /// Sum of completed refund transactions for the order, excluding one refund.
    async fn settled_refund_total(&mut self, order_id: i64, excluding_refund: i64) -> Result<Decimal>;

    // -- webhooks --------------------------------------------------------------

    async fn webhook_event_seen(&mut self, provider: &str, event_id: &str) -> Result<bool>;
    /// Returns `true` the first time an event id is seen for a provider.
    async fn record_webhook_event(&mut self, provider: &str, event_id: &str) -> Result<bool>;
}
