//! Checkout snapshots, checkout intents and pending order creation

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::domain::aggregates::{
    build_snapshot, parse_selection, CheckoutSnapshot, DeliveryType, NewOrder, PaymentMethod, ShippingChoice, SnapshotError,
};
use crate::domain::status::OrderStatus;
use crate::domain::value_objects::PickupCode;
use crate::store::{Store, StoreTx};
use crate::{EcommerceError, Result};

const ORDER_CREATE_ATTEMPTS: u32 = 3;
const PICKUP_CODE_ATTEMPTS: u32 = 25;
const PICKUP_CODE_SPACE: u32 = 1_000_000;

impl From<SnapshotError> for EcommerceError {
    fn from(e: SnapshotError) -> Self { EcommerceError::Validation(e.to_string()) }
}

/// Server-side checkout snapshots handed out between the review page and order creation.
pub struct CheckoutIntents {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, (Instant, CheckoutSnapshot)>>,
}

impl CheckoutIntents {
    pub fn new(ttl: Duration) -> Self { Self { ttl, entries: Mutex::new(HashMap::new()) } }

    pub fn put(&self, snapshot: CheckoutSnapshot) -> Uuid {
        let token = Uuid::now_v7();
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, (at, _)| at.elapsed() < ttl);
        entries.insert(token, (Instant::now(), snapshot));
        token
    }

    /// Removes and returns the snapshot if it exists, is fresh and belongs to `user_id`.
    pub fn take(&self, token: Uuid, user_id: i64) -> Option<CheckoutSnapshot> {
        let mut entries = self.entries.lock();
        match entries.get(&token) {
            Some((at, snap)) if at.elapsed() < self.ttl && snap.user_id == user_id => entries.remove(&token).map(|(_, s)| s),
            Some((at, _)) if at.elapsed() >= self.ttl => {
                entries.remove(&token);
                None
            }
            _ => None,
        }
    }

    /// Puts a snapshot back under its old token after a failed order attempt.
    pub fn restore(&self, token: Uuid, snapshot: CheckoutSnapshot) {
        self.entries.lock().insert(token, (Instant::now(), snapshot));
    }

    pub fn len(&self) -> usize { self.entries.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

pub struct CheckoutService {
    store: Arc<dyn Store>,
    intents: CheckoutIntents,
    shipping_fee: Decimal,
    code_space: u32,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn Store>, config: &AppConfig) -> Self {
        Self {
            store,
            intents: CheckoutIntents::new(config.checkout_intent_ttl),
            shipping_fee: config.shipping_fee,
            code_space: PICKUP_CODE_SPACE,
        }
    }

    /// Narrows the pickup code space. Only useful to force collisions.
    pub fn with_code_space(mut self, space: u32) -> Self {
        self.code_space = space.max(1);
        self
    }

    pub fn intents(&self) -> &CheckoutIntents { &self.intents }

    /// Prices the selected cart lines. `selection` holds raw product ids; an empty one selects the whole cart.
    #[instrument(skip(self, selection, choice))]
    pub async fn build_checkout_snapshot<S: AsRef<str> + Sync>(
        &self,
        user_id: i64,
        selection: &[S],
        choice: &ShippingChoice,
    ) -> Result<CheckoutSnapshot> {
        let (profile, cart) = {
            let mut tx = self.store.begin().await?;
            let profile = tx.user_profile(user_id).await?.ok_or(EcommerceError::NotFound("user"))?;
            (profile, tx.cart_lines(user_id).await?)
        };
        let selection = parse_selection(selection);
        Ok(build_snapshot(&profile, &cart, selection.as_deref(), choice, self.shipping_fee)?)
    }

    /// Builds a snapshot and parks it as a checkout intent, returning the token.
    pub async fn begin_checkout<S: AsRef<str> + Sync>(
        &self,
        user_id: i64,
        selection: &[S],
        choice: &ShippingChoice,
    ) -> Result<(Uuid, CheckoutSnapshot)> {
        let snapshot = self.build_checkout_snapshot(user_id, selection, choice).await?;
        Ok((self.intents.put(snapshot.clone()), snapshot))
    }

    /// Creates the pending order for a parked checkout intent. The intent is consumed on success.
    pub async fn place_order(&self, user_id: i64, token: Uuid, payment_method: Option<PaymentMethod>) -> Result<i64> {
        let snapshot = self
            .intents
            .take(token, user_id)
            .ok_or_else(|| EcommerceError::Validation("Checkout has expired, please review your cart again".into()))?;
        let method = payment_method.unwrap_or(snapshot.payment_method);
        match self.create_pending_order(user_id, &snapshot, method).await {
            Ok(order_id) => Ok(order_id),
            Err(e) => {
                self.intents.restore(token, snapshot);
                Err(e)
            }
        }
    }

    /// Persists the snapshot as a `pending_payment` order and removes its lines from the cart.
    /// A pickup code collision with a concurrent checkout retries the whole write.
    #[instrument(skip(self, snapshot), fields(items = snapshot.items.len()))]
    pub async fn create_pending_order(&self, user_id: i64, snapshot: &CheckoutSnapshot, payment_method: PaymentMethod) -> Result<i64> {
        if snapshot.user_id != user_id {
            return Err(EcommerceError::Forbidden);
        }
        if snapshot.items.is_empty() {
            return Err(SnapshotError::NoItemsSelected.into());
        }
        let mut attempt = 1;
        loop {
            match self.try_create(user_id, snapshot, payment_method).await {
                Err(EcommerceError::Conflict(what)) if attempt < ORDER_CREATE_ATTEMPTS => {
                    warn!(attempt, %what, "Order insert conflicted, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_create(&self, user_id: i64, snapshot: &CheckoutSnapshot, payment_method: PaymentMethod) -> Result<i64> {
        let mut tx = self.store.begin().await?;
        let pickup_code = match snapshot.delivery_type {
            DeliveryType::Pickup => Some(self.generate_pickup_code(tx.as_mut()).await?.into_inner()),
            DeliveryType::Delivery => None,
        };
        let order_id = tx
            .insert_order(&NewOrder {
                user_id,
                total: snapshot.total,
                shipping_fee: snapshot.shipping_fee,
                payment_method,
                delivery_type: snapshot.delivery_type,
                contact_name: snapshot.contact_name.clone(),
                contact_phone: snapshot.contact_phone.clone(),
                address: snapshot.address.clone(),
                pickup_code: pickup_code.clone(),
                status: OrderStatus::PendingPayment,
            })
            .await?;
        tx.insert_order_items(order_id, &snapshot.order_items()).await?;
        tx.clear_cart_products(user_id, &snapshot.product_ids()).await?;
        tx.commit().await?;
        info!(order_id, user_id, total = %snapshot.total, method = %payment_method, ?pickup_code, "Created pending order");
        Ok(order_id)
    }

    async fn generate_pickup_code(&self, tx: &mut dyn StoreTx) -> Result<PickupCode> {
        for _ in 0..PICKUP_CODE_ATTEMPTS {
            let code = PickupCode::random(&mut rand::thread_rng(), self.code_space);
            if !tx.pickup_code_exists(code.as_str()).await? {
                return Ok(code);
            }
        }
        Err(EcommerceError::Conflict("no free pickup code".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::UserProfile;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.put_user(UserProfile { id: 1, name: Some("Ana".into()), phone: Some("9000".into()), address: Some("1 Main St".into()), membership_active: false }).await;
        store.put_product(10, "Tea", Decimal::new(400, 2), 20).await;
        store.put_product(11, "Cup", Decimal::new(1000, 2), 5).await;
        store.put_cart_item(1, 10, 2).await;
        store.put_cart_item(1, 11, 1).await;
        store
    }

    fn service(store: &MemoryStore) -> CheckoutService {
        CheckoutService::new(Arc::new(store.clone()), &AppConfig::default())
    }

    #[tokio::test]
    async fn test_pending_order_clears_only_selected_lines() {
        let store = seeded().await;
        let checkout = service(&store);
        let choice = ShippingChoice { delivery_type: DeliveryType::Delivery, ..Default::default() };
        let snapshot = checkout.build_checkout_snapshot(1, &["10"], &choice).await.unwrap();
        assert_eq!(snapshot.total, Decimal::new(1000, 2));
        assert_eq!(snapshot.address.as_deref(), Some("1 Main St"));

        let order_id = checkout.create_pending_order(1, &snapshot, PaymentMethod::Card).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let order = tx.order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.pickup_code, None);
        assert_eq!(tx.order_items(order_id).await.unwrap().len(), 1);
        drop(tx);
        assert_eq!(store.cart_quantity(1, 10).await, None);
        assert_eq!(store.cart_quantity(1, 11).await, Some(1));
        // stock moves only when the payment is finalized
        assert_eq!(store.stock(10).await, Some(20));
    }

    #[tokio::test]
    async fn test_pickup_orders_get_distinct_codes() {
        let store = seeded().await;
        let checkout = Arc::new(service(&store).with_code_space(20));
        let snapshot = checkout.build_checkout_snapshot(1, &[] as &[&str], &ShippingChoice::default()).await.unwrap();
        assert_eq!(snapshot.shipping_fee, Decimal::ZERO);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let (checkout, snapshot) = (checkout.clone(), snapshot.clone());
            handles.push(tokio::spawn(async move { checkout.create_pending_order(1, &snapshot, PaymentMethod::QrPoll).await }));
        }
        let mut order_ids = Vec::new();
        for h in handles {
            order_ids.push(h.await.unwrap().unwrap());
        }
        let mut codes = HashSet::new();
        let mut tx = store.begin().await.unwrap();
        for order_id in order_ids {
            let code = tx.order(order_id).await.unwrap().unwrap().pickup_code.unwrap();
            assert!(PickupCode::parse(&code).is_some());
            codes.insert(code);
        }
        assert_eq!(codes.len(), 10);
    }

    #[tokio::test]
    async fn test_intent_is_single_use_and_owned() {
        let store = seeded().await;
        let checkout = service(&store);
        let (token, _) = checkout.begin_checkout(1, &[] as &[&str], &ShippingChoice::default()).await.unwrap();
        assert!(matches!(checkout.place_order(2, token, None).await, Err(EcommerceError::Validation(_))));
        let order_id = checkout.place_order(1, token, Some(PaymentMethod::Wallet)).await.unwrap();
        assert!(order_id > 0);
        assert!(checkout.place_order(1, token, None).await.is_err());
        assert!(checkout.intents().is_empty());
    }

    #[tokio::test]
    async fn test_empty_cart_is_rejected() {
        let store = MemoryStore::new();
        store.put_user(UserProfile { id: 5, ..Default::default() }).await;
        let err = service(&store).build_checkout_snapshot(5, &[] as &[&str], &ShippingChoice::default()).await.unwrap_err();
        assert!(matches!(err, EcommerceError::Validation(m) if m.contains("empty")));
    }

    #[test]
    fn test_expired_intent_is_dropped() {
        let intents = CheckoutIntents::new(Duration::ZERO);
        let snap = CheckoutSnapshot {
            user_id: 1,
            items: vec![],
            delivery_type: DeliveryType::Pickup,
            contact_name: None,
            contact_phone: None,
            address: None,
            payment_method: PaymentMethod::Card,
            subtotal: Decimal::ZERO,
            shipping_fee: Decimal::ZERO,
            total: Decimal::ZERO,
        };
        let token = intents.put(snap);
        assert!(intents.take(token, 1).is_none());
    }
}
