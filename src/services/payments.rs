//! Payment collection and order finalization
//!
//! Every success path (client confirmation, wallet capture, QR poll, webhook)
//! ends in [`PaymentService::finalize_order`], which is safe to call any number
//! of times for the same order.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::domain::aggregates::{Order, OrderItem, PaymentMethod, PaymentTransaction, ProviderRef};
use crate::domain::events::DomainEvent;
use crate::domain::status::OrderStatus;
use crate::domain::value_objects::{IdempotencyKey, Money};
use crate::providers::{Outcome, PaymentRequest, PaymentSession, ProviderEvent, Providers, Settlement};
use crate::services::events::EventBus;
use crate::services::inventory::{InventoryLedger, StockLine};
use crate::store::Store;
use crate::{EcommerceError, Result};

#[derive(Clone, Debug, Serialize)]
pub struct FinalizeOutcome {
    pub already_paid: bool,
    pub blocked: bool,
    pub order: Order,
}

/// Result of asking a provider where a payment stands.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Confirmation {
    Paid(FinalizeOutcome),
    Failed { reason: String },
    Pending,
}

impl Confirmation {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Paid(_) => Outcome::SUCCESS,
            Self::Failed { .. } => Outcome::FAIL,
            Self::Pending => Outcome::PENDING,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payments: Vec<PaymentTransaction>,
}

pub struct PaymentService {
    store: Arc<dyn Store>,
    providers: Providers,
    inventory: InventoryLedger,
    events: EventBus,
    currency: String,
    base_url: String,
}

impl PaymentService {
    pub fn new(store: Arc<dyn Store>, providers: Providers, inventory: InventoryLedger, events: EventBus, config: &AppConfig) -> Self {
        Self {
            store,
            providers,
            inventory,
            events,
            currency: config.currency.clone(),
            base_url: config.app_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn providers(&self) -> &Providers { &self.providers }

    async fn load_order(&self, order_id: i64) -> Result<(Order, Vec<OrderItem>)> {
        let mut tx = self.store.begin().await?;
        let order = tx.order(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        let items = tx.order_items(order_id).await?;
        Ok((order, items))
    }

    async fn owned_order(&self, order_id: i64, user_id: i64) -> Result<Order> {
        let (order, _) = self.load_order(order_id).await?;
        if !order.is_owned_by(user_id) {
            return Err(EcommerceError::Forbidden);
        }
        Ok(order)
    }

    /// Order with its lines and payment attempts, visible to its owner.
    pub async fn order_view(&self, order_id: i64, user_id: i64, privileged: bool) -> Result<OrderView> {
        let mut tx = self.store.begin().await?;
        let order = tx.order(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if !privileged && !order.is_owned_by(user_id) {
            return Err(EcommerceError::Forbidden);
        }
        let items = tx.order_items(order_id).await?;
        let payments = tx.payment_transactions(order_id).await?;
        Ok(OrderView { order, items, payments })
    }

    /// Moves an order to `payment_successful` exactly once.
    ///
    /// Cancelled and refund-terminal orders are left alone; already paid orders
    /// are reported as such without touching stock again. Stock and cart
    /// cleanup are best-effort; the status write comes last.
    #[instrument(skip(self))]
    pub async fn finalize_order(&self, order_id: i64) -> Result<FinalizeOutcome> {
        let (mut order, items) = self.load_order(order_id).await?;
        if order.status.blocks_payment() {
            warn!(order_id, status = %order.status, "Payment confirmed for a closed order, leaving it unchanged");
            return Ok(FinalizeOutcome { already_paid: false, blocked: true, order });
        }
        if order.status.is_paid() {
            return Ok(FinalizeOutcome { already_paid: true, blocked: false, order });
        }

        let mut product_ids = Vec::with_capacity(items.len());
        for item in &items {
            let line = StockLine { product_id: item.product_id, product_name: item.product_name.clone(), quantity: item.quantity };
            match self.inventory.decrement_line(line).await {
                Ok(Some(product_id)) => product_ids.push(product_id),
                Ok(None) => {}
                Err(e) => {
                    warn!(order_id, item_id = item.id, error = %e, "Stock decrement failed, continuing");
                    product_ids.extend(item.product_id);
                }
            }
        }

        if let Err(e) = self.clear_cart(order.user_id, &product_ids).await {
            warn!(order_id, error = %e, "Cart cleanup failed, continuing");
        }

        let mut tx = self.store.begin().await?;
        tx.update_order_status(order_id, OrderStatus::PaymentSuccessful).await?;
        tx.commit().await?;
        order.status = OrderStatus::PaymentSuccessful;

        info!(order_id, total = %order.total, method = %order.payment_method, "Order paid");
        self.events
            .publish(DomainEvent::OrderPaid { order_id, user_id: order.user_id, total: order.total, method: order.payment_method })
            .await;
        Ok(FinalizeOutcome { already_paid: false, blocked: false, order })
    }

    async fn clear_cart(&self, user_id: i64, product_ids: &[i64]) -> Result<()> {
        if product_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.store.begin().await?;
        tx.clear_cart_products(user_id, product_ids).await?;
        tx.commit().await
    }

    /// Marks the order behind a provider reference as `payment_failed`.
    /// Returns `false` if the order was already paid or closed and was left alone.
    #[instrument(skip(self))]
    pub async fn fail_order(&self, reference: &ProviderRef, reason: &str) -> Result<bool> {
        let order_id = {
            let mut tx = self.store.begin().await?;
            tx.order_by_ref(reference).await?.ok_or(EcommerceError::NotFound("order"))?.id
        };
        self.fail_order_by_id(order_id, reason).await
    }

    pub async fn fail_order_by_id(&self, order_id: i64, reason: &str) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let order = tx.order_for_update(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if order.status.is_paid() || order.status.blocks_payment() {
            return Ok(false);
        }
        if order.status != OrderStatus::PaymentFailed {
            tx.update_order_status(order_id, OrderStatus::PaymentFailed).await?;
            tx.commit().await?;
        }
        warn!(order_id, %reason, "Payment failed");
        self.events.publish(DomainEvent::OrderPaymentFailed { order_id, reason: reason.to_string() }).await;
        Ok(true)
    }

    /// Creates (or replays) the provider-side payment for a pending order and stores its references.
    #[instrument(skip(self))]
    pub async fn start_payment(&self, order_id: i64, user_id: i64) -> Result<PaymentSession> {
        let order = self.owned_order(order_id, user_id).await?;
        if order.status != OrderStatus::PendingPayment {
            return Err(EcommerceError::invalid_state("order", order.status, "start payment"));
        }
        let provider = self.providers.for_method(order.payment_method);
        let request = PaymentRequest {
            order_id,
            amount_minor: order.total_minor(),
            currency: self.currency.clone(),
            idempotency_key: IdempotencyKey::for_order(order_id),
            return_url: format!("{}/orders/{order_id}/payments/wallet/capture", self.base_url),
            cancel_url: format!("{}/orders/{order_id}/payments/wallet/cancel", self.base_url),
        };
        let session = provider.create_payment(&request).await?;

        let mut tx = self.store.begin().await?;
        let current = tx.order_for_update(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if current.status != OrderStatus::PendingPayment {
            return Err(EcommerceError::invalid_state("order", current.status, "start payment"));
        }
        for reference in std::iter::once(&session.reference).chain(session.secondary.as_ref()) {
            if !tx.set_provider_ref(order_id, reference).await? {
                warn!(order_id, kind = ?reference.kind(), "Order already carries a different provider reference");
                return Err(EcommerceError::ReferenceMismatch);
            }
        }
        tx.insert_payment_transaction(&PaymentTransaction {
            order_id,
            provider: order.payment_method,
            reference: session.reference.value().to_string(),
            amount: order.total,
            currency: self.currency.clone(),
            status: "created".into(),
            created_at: Utc::now(),
        })
        .await?;
        tx.commit().await?;
        info!(order_id, provider = provider.name(), reference = session.reference.value(), "Payment started");
        Ok(session)
    }

    /// Client-side card confirmation. The intent must be the one stored on the order.
    #[instrument(skip(self))]
    pub async fn confirm_card_payment(&self, order_id: i64, user_id: i64, intent_id: &str) -> Result<Confirmation> {
        let order = self.owned_order(order_id, user_id).await?;
        if order.payment_method != PaymentMethod::Card || order.refs.payment_intent_id.as_deref() != Some(intent_id) {
            return Err(EcommerceError::ReferenceMismatch);
        }
        let settlement = self.providers.card.settle(&order.refs).await?;
        self.apply_settlement(&order, settlement, true).await
    }

    /// Captures an approved wallet order. `token` is the wallet order id the customer returned with.
    #[instrument(skip(self))]
    pub async fn capture_wallet_payment(&self, order_id: i64, user_id: i64, token: &str) -> Result<Confirmation> {
        let order = self.owned_order(order_id, user_id).await?;
        if order.payment_method != PaymentMethod::Wallet || order.refs.wallet_order_id.as_deref() != Some(token) {
            return Err(EcommerceError::ReferenceMismatch);
        }
        if order.status.is_paid() {
            return Ok(Confirmation::Paid(FinalizeOutcome { already_paid: true, blocked: false, order }));
        }
        let settlement = self.providers.wallet.settle(&order.refs).await?;
        self.apply_settlement(&order, settlement, true).await
    }

    /// The customer abandoned the wallet approval page.
    pub async fn cancel_wallet_payment(&self, order_id: i64, user_id: i64) -> Result<bool> {
        let order = self.owned_order(order_id, user_id).await?;
        if order.payment_method != PaymentMethod::Wallet {
            return Err(EcommerceError::ReferenceMismatch);
        }
        self.fail_order_by_id(order_id, "customer cancelled wallet approval").await
    }

    /// One status query for a QR order. Resolved orders answer from the stored status.
    #[instrument(skip(self))]
    pub async fn poll_qr_payment(&self, order_id: i64) -> Result<Confirmation> {
        let (order, _) = self.load_order(order_id).await?;
        if order.payment_method != PaymentMethod::QrPoll {
            return Err(EcommerceError::ReferenceMismatch);
        }
        if order.status.is_paid() {
            return Ok(Confirmation::Paid(FinalizeOutcome { already_paid: true, blocked: false, order }));
        }
        if order.status.is_failed() || order.status.blocks_payment() {
            return Ok(Confirmation::Failed { reason: order.status.to_string() });
        }
        let settlement = self.providers.qr.settle(&order.refs).await?;
        self.apply_settlement(&order, settlement, false).await
    }

    /// Deletes a still-unpaid QR order the customer walked away from.
    #[instrument(skip(self))]
    pub async fn discard_abandoned_qr_order(&self, order_id: i64, user_id: i64) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let order = tx.order_for_update(order_id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if !order.is_owned_by(user_id) {
            return Err(EcommerceError::Forbidden);
        }
        if order.payment_method != PaymentMethod::QrPoll {
            return Err(EcommerceError::ReferenceMismatch);
        }
        if !matches!(order.status, OrderStatus::PendingPayment | OrderStatus::PaymentFailed) {
            return Err(EcommerceError::invalid_state("order", order.status, "discard"));
        }
        tx.delete_order(order_id).await?;
        tx.commit().await?;
        info!(order_id, "Discarded abandoned QR order");
        Ok(())
    }

    /// Applies an asynchronous provider notification. `None` when no order carries the reference.
    pub async fn apply_event(&self, event: &ProviderEvent) -> Result<Option<i64>> {
        let order = {
            let mut tx = self.store.begin().await?;
            tx.order_by_ref(&event.reference).await?
        };
        let Some(order) = order else {
            warn!(event_id = %event.id, reference = event.reference.value(), "Notification for unknown payment");
            return Ok(None);
        };
        let settlement = Settlement {
            outcome: event.outcome,
            amount_minor: event.amount_minor,
            capture: None,
            raw_status: event.event_type.clone(),
        };
        match self.apply_settlement(&order, settlement, false).await {
            Ok(_) | Err(EcommerceError::AmountMismatch { .. }) => Ok(Some(order.id)),
            Err(e) => Err(e),
        }
    }

    /// Folds a provider settlement into the order. When `require_amount` is set a
    /// success without a reported amount is treated as a mismatch.
    async fn apply_settlement(&self, order: &Order, settlement: Settlement, require_amount: bool) -> Result<Confirmation> {
        if settlement.outcome.fail {
            let reason = format!("provider reported {}", settlement.raw_status);
            self.fail_order_by_id(order.id, &reason).await?;
            return Ok(Confirmation::Failed { reason });
        }
        if !settlement.outcome.success {
            return Ok(Confirmation::Pending);
        }

        let expected = order.total_minor();
        match settlement.amount_minor {
            Some(received) if received != expected => return Err(self.amount_mismatch(order, expected, received).await),
            None if require_amount => return Err(self.amount_mismatch(order, expected, 0).await),
            _ => {}
        }

        if let Some(capture) = &settlement.capture {
            let mut tx = self.store.begin().await?;
            if tx.set_provider_ref(order.id, capture).await? {
                tx.commit().await?;
            } else {
                warn!(order_id = order.id, capture = capture.value(), "Order already holds a different capture");
            }
        }
        Ok(Confirmation::Paid(self.finalize_order(order.id).await?))
    }

    async fn amount_mismatch(&self, order: &Order, expected: i64, received: i64) -> EcommerceError {
        let reason = format!(
            "amount mismatch: expected {} received {}",
            Money::from_minor(expected, &self.currency),
            Money::from_minor(received, &self.currency)
        );
        if let Err(e) = self.fail_order_by_id(order.id, &reason).await {
            warn!(order_id = order.id, error = %e, "Could not mark mismatched payment as failed");
        }
        EcommerceError::AmountMismatch { expected_minor: expected, received_minor: received }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::aggregates::{CartLine, CheckoutSnapshot, DeliveryType, UserProfile};
    use crate::providers::{SandboxCardProvider, SandboxQrProvider, SandboxWalletProvider};
    use crate::services::checkout::CheckoutService;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    pub(crate) struct Harness {
        pub store: MemoryStore,
        pub card: Arc<SandboxCardProvider>,
        pub wallet: Arc<SandboxWalletProvider>,
        pub qr: Arc<SandboxQrProvider>,
        pub events: EventBus,
        pub payments: Arc<PaymentService>,
        pub checkout: CheckoutService,
    }

    impl Harness {
        pub(crate) async fn new() -> Self {
            let store = MemoryStore::new();
            store.put_user(UserProfile { id: 1, name: Some("Ana".into()), ..Default::default() }).await;
            store.put_user(UserProfile { id: 2, ..Default::default() }).await;
            store.put_product(10, "Tea", Decimal::new(400, 2), 10).await;
            store.put_product(11, "Cup", Decimal::new(1000, 2), 10).await;
            let card = Arc::new(SandboxCardProvider::new(false));
            let wallet = Arc::new(SandboxWalletProvider::new(false));
            let qr = Arc::new(SandboxQrProvider::new(false));
            let providers = Providers { card: card.clone(), wallet: wallet.clone(), qr: qr.clone() };
            let events = EventBus::recording();
            let config = AppConfig::default();
            let shared: Arc<dyn Store> = Arc::new(store.clone());
            let payments = Arc::new(PaymentService::new(
                shared.clone(),
                providers,
                InventoryLedger::new(shared.clone()),
                events.clone(),
                &config,
            ));
            let checkout = CheckoutService::new(shared, &config);
            Self { store, card, wallet, qr, events, payments, checkout }
        }

        pub(crate) fn providers(&self) -> Providers { self.payments.providers().clone() }

        /// Pending order for user 1 with `lines` of (product, qty, unit price in cents).
        pub(crate) async fn order(&self, method: PaymentMethod, delivery: DeliveryType, lines: &[(i64, i32, i64)], shipping_cents: i64) -> i64 {
            let items: Vec<CartLine> = lines
                .iter()
                .map(|&(product_id, quantity, cents)| CartLine {
                    product_id,
                    product_name: match product_id {
                        10 => "Tea".to_string(),
                        11 => "Cup".to_string(),
                        other => format!("product-{other}"),
                    },
                    unit_price: Decimal::new(cents, 2),
                    quantity,
                })
                .collect();
            for &(product_id, qty, _) in lines {
                self.store.put_cart_item(1, product_id, qty).await;
            }
            let subtotal = items.iter().fold(Decimal::ZERO, |acc, l| acc + l.line_total());
            let shipping_fee = Decimal::new(shipping_cents, 2);
            let snapshot = CheckoutSnapshot {
                user_id: 1,
                items,
                delivery_type: delivery,
                contact_name: None,
                contact_phone: None,
                address: None,
                payment_method: method,
                subtotal,
                shipping_fee,
                total: subtotal + shipping_fee,
            };
            self.checkout.create_pending_order(1, &snapshot, method).await.unwrap()
        }

        pub(crate) async fn status(&self, order_id: i64) -> OrderStatus {
            let mut tx = self.store.begin().await.unwrap();
            tx.order(order_id).await.unwrap().unwrap().status
        }

        /// Drives a card order all the way to `payment_successful`.
        pub(crate) async fn paid_card_order(&self, lines: &[(i64, i32, i64)]) -> i64 {
            let order_id = self.order(PaymentMethod::Card, DeliveryType::Pickup, lines, 0).await;
            let session = self.payments.start_payment(order_id, 1).await.unwrap();
            let total: i64 = lines.iter().map(|&(_, q, c)| i64::from(q) * c).sum();
            self.card.succeed(session.reference.value(), total);
            self.payments.confirm_card_payment(order_id, 1, session.reference.value()).await.unwrap();
            order_id
        }
    }

    #[tokio::test]
    async fn test_card_confirmation_finalizes_once() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Delivery, &[(10, 5, 400)], 200).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        assert!(session.client_secret.is_some());
        h.card.succeed(session.reference.value(), 2200);

        let first = h.payments.confirm_card_payment(order_id, 1, session.reference.value()).await.unwrap();
        assert!(matches!(first, Confirmation::Paid(FinalizeOutcome { already_paid: false, .. })));
        let again = h.payments.confirm_card_payment(order_id, 1, session.reference.value()).await.unwrap();
        assert!(matches!(again, Confirmation::Paid(FinalizeOutcome { already_paid: true, .. })));
        assert!(h.payments.finalize_order(order_id).await.unwrap().already_paid);

        assert_eq!(h.store.stock(10).await, Some(5));
        assert_eq!(h.status(order_id).await, OrderStatus::PaymentSuccessful);
        let paid = h.events.recorded().iter().filter(|e| matches!(e, DomainEvent::OrderPaid { .. })).count();
        assert_eq!(paid, 1);
    }

    #[tokio::test]
    async fn test_amount_mismatch_fails_order() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Delivery, &[(10, 5, 400)], 200).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        h.card.succeed(session.reference.value(), 2100);

        let err = h.payments.confirm_card_payment(order_id, 1, session.reference.value()).await.unwrap_err();
        assert!(matches!(err, EcommerceError::AmountMismatch { expected_minor: 2200, received_minor: 2100 }));
        assert_eq!(h.status(order_id).await, OrderStatus::PaymentFailed);
        assert_eq!(h.store.stock(10).await, Some(10));
    }

    #[tokio::test]
    async fn test_start_payment_is_idempotent_per_order() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(11, 1, 1000)], 0).await;
        let a = h.payments.start_payment(order_id, 1).await.unwrap();
        let b = h.payments.start_payment(order_id, 1).await.unwrap();
        assert_eq!(a.reference, b.reference);
        assert_eq!(h.card.intents_created(), 1);
        assert_eq!(h.card.create_calls(&IdempotencyKey::for_order(order_id)), 2);
        assert!(matches!(h.payments.start_payment(order_id, 2).await, Err(EcommerceError::Forbidden)));
    }

    #[tokio::test]
    async fn test_confirm_rejects_foreign_intent() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(11, 1, 1000)], 0).await;
        h.payments.start_payment(order_id, 1).await.unwrap();
        let err = h.payments.confirm_card_payment(order_id, 1, "pi_someone_else").await.unwrap_err();
        assert!(matches!(err, EcommerceError::ReferenceMismatch));
        assert_eq!(h.status(order_id).await, OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_cancelled_order_is_not_resurrected() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(10, 2, 400)], 0).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        h.store.force_order_status(order_id, OrderStatus::CancelledByAdmin).await;
        h.card.succeed(session.reference.value(), 800);

        let outcome = h.payments.confirm_card_payment(order_id, 1, session.reference.value()).await.unwrap();
        assert!(matches!(outcome, Confirmation::Paid(FinalizeOutcome { blocked: true, .. })));
        assert_eq!(h.status(order_id).await, OrderStatus::CancelledByAdmin);
        assert_eq!(h.store.stock(10).await, Some(10));
        assert!(!h.payments.fail_order(&session.reference, "late failure").await.unwrap());
    }

    #[tokio::test]
    async fn test_wallet_capture_and_cancel() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Wallet, DeliveryType::Pickup, &[(11, 2, 1000)], 0).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        let token = session.reference.value().to_string();
        assert!(session.approve_url.is_some());

        assert!(matches!(h.payments.capture_wallet_payment(order_id, 1, &token).await.unwrap(), Confirmation::Pending));
        h.wallet.approve(&token);
        assert!(matches!(h.payments.capture_wallet_payment(order_id, 1, &token).await.unwrap(), Confirmation::Paid(_)));
        let mut tx = h.store.begin().await.unwrap();
        let order = tx.order(order_id).await.unwrap().unwrap();
        drop(tx);
        assert!(order.refs.wallet_capture_id.is_some());
        assert_eq!(order.settlement_reference(), order.refs.wallet_capture_id.as_deref());

        let other = h.order(PaymentMethod::Wallet, DeliveryType::Pickup, &[(10, 1, 400)], 0).await;
        h.payments.start_payment(other, 1).await.unwrap();
        assert!(h.payments.cancel_wallet_payment(other, 1).await.unwrap());
        assert_eq!(h.status(other).await, OrderStatus::PaymentFailed);
    }

    #[tokio::test]
    async fn test_qr_poll_and_discard() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::QrPoll, DeliveryType::Pickup, &[(10, 1, 400)], 0).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        assert!(session.qr_image.is_some());
        assert_eq!(h.payments.poll_qr_payment(order_id).await.unwrap().outcome(), Outcome::PENDING);
        h.qr.set_status(session.reference.value(), "00");
        assert_eq!(h.payments.poll_qr_payment(order_id).await.unwrap().outcome(), Outcome::SUCCESS);
        let queries = h.qr.queries();
        assert_eq!(h.payments.poll_qr_payment(order_id).await.unwrap().outcome(), Outcome::SUCCESS);
        assert_eq!(h.qr.queries(), queries);
        assert!(h.payments.discard_abandoned_qr_order(order_id, 1).await.is_err());

        let abandoned = h.order(PaymentMethod::QrPoll, DeliveryType::Pickup, &[(10, 1, 400)], 0).await;
        h.payments.start_payment(abandoned, 1).await.unwrap();
        assert!(matches!(h.payments.discard_abandoned_qr_order(abandoned, 2).await, Err(EcommerceError::Forbidden)));
        h.payments.discard_abandoned_qr_order(abandoned, 1).await.unwrap();
        assert!(matches!(h.payments.order_view(abandoned, 1, false).await, Err(EcommerceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_declined_payment_marks_failed() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(10, 1, 400)], 0).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        h.card.decline(session.reference.value());
        let outcome = h.payments.confirm_card_payment(order_id, 1, session.reference.value()).await.unwrap();
        assert_eq!(outcome.outcome(), Outcome::FAIL);
        assert_eq!(h.status(order_id).await, OrderStatus::PaymentFailed);
        let view = h.payments.order_view(order_id, 1, false).await.unwrap();
        assert_eq!(view.payments.len(), 1);
    }

    #[tokio::test]
    async fn test_unlinked_line_is_decremented_by_name() {
        let h = Harness::new().await;
        let order_id = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(10, 2, 400)], 0).await;
        h.store.unlink_product(10).await;
        let session = h.payments.start_payment(order_id, 1).await.unwrap();
        h.card.succeed(session.reference.value(), 800);
        h.payments.confirm_card_payment(order_id, 1, session.reference.value()).await.unwrap();

        assert_eq!(h.store.stock(10).await, Some(8));
        assert_eq!(h.store.stock(11).await, Some(10));
    }
}
