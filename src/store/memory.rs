//! In-memory store
//!
//! A transaction takes the state lock, works on a private copy and publishes it on
//! commit. Transactions are therefore fully serialized, which also satisfies every
//! row lock the Postgres backend takes. Used for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::aggregates::{
    CartLine, NewOrder, NewOrderItem, NewRefund, NewRefundItem, Order, OrderItem, PaymentTransaction, PickupStatus,
    ProviderRef, ProviderRefs, Refund, RefundEvidence, RefundItem, RefundTransaction, RefundUsage, TxnStatus,
    UserProfile,
};
use crate::domain::status::OrderStatus;
use crate::store::{Store, StoreTx};
use crate::{EcommerceError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ProductRow {
    pub id: i64,
    pub name: String,
    pub price: Decimal,
    pub stock: i32,
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    next_id: i64,
    users: HashMap<i64, UserProfile>,
    products: HashMap<i64, ProductRow>,
    cart: BTreeMap<(i64, i64), i32>,
    orders: BTreeMap<i64, Order>,
    order_items: Vec<OrderItem>,
    payment_txns: Vec<PaymentTransaction>,
    refunds: BTreeMap<i64, Refund>,
    refund_items: Vec<RefundItem>,
    refund_evidence: Vec<(i64, RefundEvidence)>,
    refund_txns: HashMap<i64, RefundTransaction>,
    webhook_events: HashSet<(String, String)>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn put_user(&self, profile: UserProfile) {
        self.state.lock().await.users.insert(profile.id, profile);
    }

    pub async fn put_product(&self, id: i64, name: &str, price: Decimal, stock: i32) {
        let row = ProductRow { id, name: name.to_string(), price, stock };
        self.state.lock().await.products.insert(id, row);
    }

    pub async fn put_cart_item(&self, user_id: i64, product_id: i64, quantity: i32) {
        self.state.lock().await.cart.insert((user_id, product_id), quantity);
    }

    pub async fn stock(&self, product_id: i64) -> Option<i32> {
        self.state.lock().await.products.get(&product_id).map(|p| p.stock)
    }

    /// Clears the product link on order lines, as deleting a product does.
    pub async fn unlink_product(&self, product_id: i64) {
        let mut s = self.state.lock().await;
        for item in s.order_items.iter_mut().filter(|i| i.product_id == Some(product_id)) {
            item.product_id = None;
        }
    }

    pub async fn cart_quantity(&self, user_id: i64, product_id: i64) -> Option<i32> {
        self.state.lock().await.cart.get(&(user_id, product_id)).copied()
    }

    /// Overwrites an order's status outside any workflow, e.g. to load legacy fixtures.
    pub async fn force_order_status(&self, order_id: i64, status: OrderStatus) {
        if let Some(order) = self.state.lock().await.orders.get_mut(&order_id) {
            order.status = status;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

impl MemoryTx {
    fn order_mut(&mut self, order_id: i64) -> Result<&mut Order> {
        self.staged.orders.get_mut(&order_id).ok_or(EcommerceError::NotFound("order"))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn user_profile(&mut self, user_id: i64) -> Result<Option<UserProfile>> {
        Ok(self.staged.users.get(&user_id).cloned())
    }

    async fn cart_lines(&mut self, user_id: i64) -> Result<Vec<CartLine>> {
        let s = &self.staged;
        Ok(s.cart
            .range((user_id, i64::MIN)..=(user_id, i64::MAX))
            .filter_map(|(&(_, product_id), &quantity)| {
                s.products.get(&product_id).map(|p| CartLine {
                    product_id,
                    product_name: p.name.clone(),
                    unit_price: p.price,
                    quantity,
                })
            })
            .collect())
    }

    async fn clear_cart_products(&mut self, user_id: i64, product_ids: &[i64]) -> Result<u64> {
        let before = self.staged.cart.len();
        self.staged.cart.retain(|(u, p), _| !(*u == user_id && product_ids.contains(p)));
        Ok((before - self.staged.cart.len()) as u64)
    }

    async fn decrement_stock(&mut self, product_id: i64, qty: i32) -> Result<()> {
        if let Some(p) = self.staged.products.get_mut(&product_id) {
            p.stock = (p.stock - qty).max(0);
        }
        Ok(())
    }

    async fn increment_stock(&mut self, product_id: i64, qty: i32) -> Result<()> {
        if let Some(p) = self.staged.products.get_mut(&product_id) {
            p.stock += qty;
        }
        Ok(())
    }

    async fn product_id_by_name(&mut self, name: &str) -> Result<Option<i64>> {
        let name = name.trim();
        Ok(self.staged.products.values().filter(|p| p.name.eq_ignore_ascii_case(name)).map(|p| p.id).min())
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<i64> {
        if let Some(code) = &order.pickup_code {
            if self.staged.orders.values().any(|o| o.pickup_code.as_ref() == Some(code)) {
                return Err(EcommerceError::Conflict(format!("pickup code {code} already issued")));
            }
        }
        let id = self.staged.next_id();
        let row = Order {
            id,
            user_id: order.user_id,
            total: order.total,
            shipping_fee: order.shipping_fee,
            payment_method: order.payment_method,
            delivery_type: order.delivery_type,
            contact_name: order.contact_name.clone(),
            contact_phone: order.contact_phone.clone(),
            address: order.address.clone(),
            pickup_code: order.pickup_code.clone(),
            pickup_code_status: order.pickup_code.as_ref().map(|_| PickupStatus::Active),
            pickup_code_redeemed_at: None,
            refs: ProviderRefs::default(),
            status: order.status,
            cancelled_at: None,
            created_at: Utc::now(),
        };
        self.staged.orders.insert(id, row);
        Ok(id)
    }

    async fn insert_order_items(&mut self, order_id: i64, items: &[NewOrderItem]) -> Result<()> {
        for item in items {
            let id = self.staged.next_id();
            self.staged.order_items.push(OrderItem {
                id,
                order_id,
                product_id: item.product_id,
                product_name: item.product_name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
            });
        }
        Ok(())
    }

    async fn order(&mut self, order_id: i64) -> Result<Option<Order>> {
        Ok(self.staged.orders.get(&order_id).cloned())
    }

    async fn order_for_update(&mut self, order_id: i64) -> Result<Option<Order>> {
        self.order(order_id).await
    }

    async fn order_by_ref(&mut self, reference: &ProviderRef) -> Result<Option<Order>> {
        Ok(self
            .staged
            .orders
            .values()
            .find(|o| o.refs.get(reference.kind()) == Some(reference.value()))
            .cloned())
    }

    async fn order_by_pickup_code(&mut self, code: &str) -> Result<Option<Order>> {
        Ok(self.staged.orders.values().find(|o| o.pickup_code.as_deref() == Some(code)).cloned())
    }

    async fn order_items(&mut self, order_id: i64) -> Result<Vec<OrderItem>> {
        Ok(self.staged.order_items.iter().filter(|i| i.order_id == order_id).cloned().collect())
    }

    async fn pickup_code_exists(&mut self, code: &str) -> Result<bool> {
        Ok(self.staged.orders.values().any(|o| o.pickup_code.as_deref() == Some(code)))
    }

    async fn update_order_status(&mut self, order_id: i64, status: OrderStatus) -> Result<()> {
        let order = self.order_mut(order_id)?;
        order.status = status;
        if status.is_cancelled() {
            order.cancelled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_provider_ref(&mut self, order_id: i64, reference: &ProviderRef) -> Result<bool> {
        let kind = reference.kind();
        let taken = self
            .staged
            .orders
            .values()
            .any(|o| o.id != order_id && o.refs.get(kind) == Some(reference.value()));
        if taken {
            return Err(EcommerceError::Conflict(format!("{} already linked to another order", kind.column())));
        }
        let slot = self.order_mut(order_id)?.refs.slot(kind);
        if slot.as_deref().is_some_and(|existing| existing != reference.value()) {
            return Ok(false);
        }
        *slot = Some(reference.value().to_string());
        Ok(true)
    }

    async fn redeem_pickup(&mut self, order_id: i64, at: DateTime<Utc>) -> Result<()> {
        let order = self.order_mut(order_id)?;
        order.pickup_code_status = Some(PickupStatus::Redeemed);
        order.pickup_code_redeemed_at = Some(at);
        order.status = OrderStatus::Completed;
        Ok(())
    }

    async fn delete_order(&mut self, order_id: i64) -> Result<()> {
        self.staged.orders.remove(&order_id);
        self.staged.order_items.retain(|i| i.order_id != order_id);
        self.staged.payment_txns.retain(|t| t.order_id != order_id);
        Ok(())
    }

    async fn insert_payment_transaction(&mut self, txn: &PaymentTransaction) -> Result<()> {
        self.staged.payment_txns.push(txn.clone());
        Ok(())
    }

    async fn payment_transactions(&mut self, order_id: i64) -> Result<Vec<PaymentTransaction>> {
        Ok(self.staged.payment_txns.iter().filter(|t| t.order_id == order_id).cloned().collect())
    }

    async fn insert_refund(&mut self, refund: &NewRefund) -> Result<i64> {
        let id = self.staged.next_id();
        self.staged.refunds.insert(
            id,
            Refund {
                id,
                order_id: refund.order_id,
                user_id: refund.user_id,
                refund_type: refund.refund_type,
                reason: refund.reason,
                note: refund.note.clone(),
                preferred_method: refund.preferred_method,
                status: refund.status,
                admin_id: refund.admin_id,
                admin_note: None,
                rejection_reason: None,
                approved_at: refund.approved_at,
                rejected_at: None,
                processed_at: None,
                refunded_at: None,
                failed_reason: None,
                shipping_refund: refund.shipping_refund,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn insert_refund_items(&mut self, refund_id: i64, items: &[NewRefundItem]) -> Result<()> {
        for item in items {
            let id = self.staged.next_id();
            self.staged.refund_items.push(RefundItem {
                id,
                refund_id,
                order_item_id: item.order_item_id,
                product_id: item.product_id,
                product_name: item.product_name.clone(),
                qty_requested: item.qty_requested,
                qty_approved: item.qty_approved,
                unit_price: item.unit_price,
                line_refund_amount: item.line_refund_amount(),
            });
        }
        Ok(())
    }

    async fn insert_refund_evidence(&mut self, refund_id: i64, evidence: &[RefundEvidence]) -> Result<()> {
        self.staged.refund_evidence.extend(evidence.iter().cloned().map(|e| (refund_id, e)));
        Ok(())
    }

    async fn refund(&mut self, refund_id: i64) -> Result<Option<Refund>> {
        Ok(self.staged.refunds.get(&refund_id).cloned())
    }

    async fn refund_for_update(&mut self, refund_id: i64) -> Result<Option<Refund>> {
        self.refund(refund_id).await
    }

    async fn refund_items(&mut self, refund_id: i64) -> Result<Vec<RefundItem>> {
        Ok(self.staged.refund_items.iter().filter(|i| i.refund_id == refund_id).cloned().collect())
    }

    async fn refund_evidence(&mut self, refund_id: i64) -> Result<Vec<RefundEvidence>> {
        Ok(self
            .staged
            .refund_evidence
            .iter()
            .filter(|(id, _)| *id == refund_id)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn update_refund(&mut self, refund: &Refund) -> Result<()> {
        let row = self.staged.refunds.get_mut(&refund.id).ok_or(EcommerceError::NotFound("refund"))?;
        *row = refund.clone();
        Ok(())
    }

    async fn set_refund_item_approved(&mut self, refund_item_id: i64, qty_approved: i32, line_amount: Decimal) -> Result<()> {
        let item = self
            .staged
            .refund_items
            .iter_mut()
            .find(|i| i.id == refund_item_id)
            .ok_or(EcommerceError::NotFound("refund item"))?;
        item.qty_approved = qty_approved;
        item.line_refund_amount = line_amount;
        Ok(())
    }

    async fn refunds_for_order(&mut self, order_id: i64) -> Result<Vec<Refund>> {
        Ok(self.staged.refunds.values().filter(|r| r.order_id == order_id).cloned().collect())
    }

    async fn refund_usage(&mut self, order_id: i64) -> Result<Vec<RefundUsage>> {
        let s = &self.staged;
        Ok(s.refund_items
            .iter()
            .filter_map(|i| {
                let refund = s.refunds.get(&i.refund_id).filter(|r| r.order_id == order_id)?;
                Some(RefundUsage {
                    refund_id: refund.id,
                    status: refund.status,
                    order_item_id: i.order_item_id,
                    qty_requested: i.qty_requested,
                    qty_approved: i.qty_approved,
                })
            })
            .collect())
    }

    async fn upsert_refund_transaction(&mut self, txn: &RefundTransaction) -> Result<()> {
        self.staged.refund_txns.insert(txn.refund_id, txn.clone());
        Ok(())
    }

    async fn refund_transaction(&mut self, refund_id: i64) -> Result<Option<RefundTransaction>> {
        Ok(self.staged.refund_txns.get(&refund_id).cloned())
    }

    async fn settled_refund_total(&mut self, order_id: i64, excluding_refund: i64) -> Result<Decimal> {
        let s = &self.staged;
        Ok(s.refund_txns
            .values()
            .filter(|t| t.refund_id != excluding_refund && t.txn_status == TxnStatus::Completed)
            .filter(|t| s.refunds.get(&t.refund_id).is_some_and(|r| r.order_id == order_id))
            .fold(Decimal::ZERO, |acc, t| acc + t.amount))
    }

    async fn webhook_event_seen(&mut self, provider: &str, event_id: &str) -> Result<bool> {
        Ok(self.staged.webhook_events.contains(&(provider.to_string(), event_id.to_string())))
    }

    async fn record_webhook_event(&mut self, provider: &str, event_id: &str) -> Result<bool> {
        Ok(self.staged.webhook_events.insert((provider.to_string(), event_id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{DeliveryType, PaymentMethod};

    fn new_order(code: Option<&str>) -> NewOrder {
        NewOrder {
            user_id: 1,
            total: Decimal::new(1000, 2),
            shipping_fee: Decimal::ZERO,
            payment_method: PaymentMethod::Card,
            delivery_type: DeliveryType::Pickup,
            contact_name: None,
            contact_phone: None,
            address: None,
            pickup_code: code.map(str::to_string),
            status: OrderStatus::PendingPayment,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_order(&new_order(None)).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.order(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stock_decrement_clamps_at_zero() {
        let store = MemoryStore::new();
        store.put_product(5, "Tea", Decimal::new(400, 2), 2).await;
        let mut tx = store.begin().await.unwrap();
        tx.decrement_stock(5, 3).await.unwrap();
        tx.decrement_stock(5, 1).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.stock(5).await, Some(0));
    }

    #[tokio::test]
    async fn test_provider_ref_written_once() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert_order(&new_order(Some("ZP-000001"))).await.unwrap();
        let b = tx.insert_order(&new_order(None)).await.unwrap();
        assert!(tx.set_provider_ref(a, &ProviderRef::PaymentIntent("pi_1".into())).await.unwrap());
        assert!(tx.set_provider_ref(a, &ProviderRef::PaymentIntent("pi_1".into())).await.unwrap());
        assert!(!tx.set_provider_ref(a, &ProviderRef::PaymentIntent("pi_2".into())).await.unwrap());
        assert!(tx.set_provider_ref(b, &ProviderRef::PaymentIntent("pi_1".into())).await.is_err());
        assert!(tx.insert_order(&new_order(Some("ZP-000001"))).await.is_err());
    }
}
