//! Application services
//!
//! Each service owns one workflow and talks to persistence only through
//! [`StoreTx`](crate::store::StoreTx). Transactions are never nested and provider
//! calls always happen outside of one.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::domain::status::normalize;
use crate::providers::Providers;
use crate::store::Store;

pub mod checkout;
pub mod events;
pub mod inventory;
pub mod payments;
pub mod pickup;
pub mod refunds;
pub mod webhooks;

pub use checkout::{CheckoutIntents, CheckoutService};
pub use events::EventBus;
pub use inventory::InventoryLedger;
pub use payments::{Confirmation, FinalizeOutcome, PaymentService};
pub use pickup::PickupService;
pub use refunds::RefundService;
pub use webhooks::{RecentEvents, WebhookOutcome, WebhookService};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role { #[default] Customer, Staff, Admin }

impl FromStr for Role {
    type Err = String;
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match normalize(raw).as_str() {
            "customer" | "user" => Ok(Self::Customer),
            "staff" => Ok(Self::Staff),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// The authenticated caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub role: Role,
}

impl Actor {
    pub fn customer(user_id: i64) -> Self { Self { user_id, role: Role::Customer } }
    pub fn admin(user_id: i64) -> Self { Self { user_id, role: Role::Admin } }
    pub fn is_staff(&self) -> bool { matches!(self.role, Role::Staff | Role::Admin) }
    pub fn is_admin(&self) -> bool { self.role == Role::Admin }
}

/// Every service wired against one store, provider set and event bus.
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub payments: Arc<PaymentService>,
    pub webhooks: Arc<WebhookService>,
    pub refunds: Arc<RefundService>,
    pub pickup: Arc<PickupService>,
}

impl AppServices {
    pub fn new(store: Arc<dyn Store>, providers: Providers, events: EventBus, config: &AppConfig) -> Self {
        let inventory = InventoryLedger::new(store.clone());
        let payments = Arc::new(PaymentService::new(store.clone(), providers.clone(), inventory, events.clone(), config));
        Self {
            checkout: Arc::new(CheckoutService::new(store.clone(), config)),
            webhooks: Arc::new(WebhookService::new(store.clone(), providers.clone(), payments.clone(), config.webhook_dedup_capacity)),
            refunds: Arc::new(RefundService::new(store.clone(), providers, events.clone(), &config.currency)),
            pickup: Arc::new(PickupService::new(store, events)),
            payments,
        }
    }
}
