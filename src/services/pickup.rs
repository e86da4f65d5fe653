//! In-store pickup code redemption

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::domain::aggregates::{Order, PickupStatus};
use crate::domain::events::DomainEvent;
use crate::domain::value_objects::PickupCode;
use crate::services::events::EventBus;
use crate::services::Actor;
use crate::store::Store;
use crate::{EcommerceError, Result};

pub struct PickupService {
    store: Arc<dyn Store>,
    events: EventBus,
}

impl PickupService {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self { Self { store, events } }

    /// Staff hand over a paid order. A code can be redeemed once.
    #[instrument(skip(self))]
    pub async fn redeem_pickup(&self, staff: Actor, raw_code: &str) -> Result<Order> {
        if !staff.is_staff() {
            return Err(EcommerceError::Forbidden);
        }
        let code = PickupCode::parse(raw_code)
            .ok_or_else(|| EcommerceError::Validation(format!("{raw_code:?} is not a pickup code")))?;

        let mut tx = self.store.begin().await?;
        let found = tx.order_by_pickup_code(code.as_str()).await?.ok_or(EcommerceError::NotFound("pickup code"))?;
        let order = tx.order_for_update(found.id).await?.ok_or(EcommerceError::NotFound("order"))?;
        if order.pickup_code_status != Some(PickupStatus::Active) {
            return Err(EcommerceError::invalid_state("pickup code", "redeemed", "redeem"));
        }
        if !order.status.is_paid() || order.status.is_cancelled() {
            return Err(EcommerceError::invalid_state("order", order.status, "hand over"));
        }
        let now = Utc::now();
        tx.redeem_pickup(order.id, now).await?;
        tx.commit().await?;

        info!(order_id = order.id, code = code.as_str(), staff_id = staff.user_id, "Pickup redeemed");
        self.events.publish(DomainEvent::PickupRedeemed { order_id: order.id, code: code.as_str().to_string() }).await;
        Ok(Order { pickup_code_status: Some(PickupStatus::Redeemed), pickup_code_redeemed_at: Some(now), ..order })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{DeliveryType, PaymentMethod};
    use crate::services::payments::tests::Harness;
    use crate::services::Role;

    #[tokio::test]
    async fn test_code_redeems_once_for_paid_orders() {
        let h = Harness::new().await;
        let pickup = PickupService::new(Arc::new(h.store.clone()), h.events.clone());
        let staff = Actor { user_id: 50, role: Role::Staff };

        let unpaid = h.order(PaymentMethod::Card, DeliveryType::Pickup, &[(10, 1, 400)], 0).await;
        let unpaid_code = h.payments.order_view(unpaid, 1, false).await.unwrap().order.pickup_code.unwrap();
        assert!(matches!(pickup.redeem_pickup(staff, &unpaid_code).await, Err(EcommerceError::InvalidState { .. })));

        let paid = h.paid_card_order(&[(10, 1, 400)]).await;
        let code = h.payments.order_view(paid, 1, false).await.unwrap().order.pickup_code.unwrap();
        assert!(matches!(pickup.redeem_pickup(Actor::customer(1), &code).await, Err(EcommerceError::Forbidden)));

        let order = pickup.redeem_pickup(staff, &code.to_lowercase()).await.unwrap();
        assert_eq!(order.pickup_code_status, Some(PickupStatus::Redeemed));
        assert!(matches!(pickup.redeem_pickup(Actor::admin(2), &code).await, Err(EcommerceError::InvalidState { .. })));
        assert!(matches!(pickup.redeem_pickup(staff, "hello").await, Err(EcommerceError::Validation(_))));
    }
}
