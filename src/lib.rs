//! Storefront Payments
//!
//! Checkout, payment finalization and refund workflow for a single storefront.
//!
//! ## Features
//! - Checkout snapshots with server-side checkout intents
//! - Pending orders with pickup codes
//! - Card, wallet-redirect and QR-poll payment providers
//! - Idempotent order finalization with webhook replay protection
//! - Refund requests, admin decisions and provider settlement

use thiserror::Error;

pub mod config;
pub mod domain;
pub mod http;
pub mod providers;
pub mod services;
pub mod store;

pub use config::AppConfig;
pub use providers::ProviderError;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum EcommerceError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("{entity} is {current}, cannot {action}")]
    InvalidState {
        entity: &'static str,
        current: String,
        action: &'static str,
    },

    #[error("requested quantity exceeds refundable quantity")]
    QuantityExceeded {
        order_item_id: i64,
        requested: i32,
        remaining: i32,
    },

    #[error("a refund is already open for this order")]
    DuplicateRefund { existing_refund_id: i64 },

    #[error("payment amount does not match the order")]
    AmountMismatch { expected_minor: i64, received_minor: i64 },

    #[error("payment reference does not match the order")]
    ReferenceMismatch,

    #[error("refund would exceed the order total")]
    OverRefund,

    #[error("refund amount must be greater than zero")]
    NonPositiveRefund,

    #[error("not allowed")]
    Forbidden,

    #[error("payment provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl EcommerceError {
    pub(crate) fn invalid_state(entity: &'static str, current: impl ToString, action: &'static str) -> Self {
        Self::InvalidState { entity, current: current.to_string(), action }
    }
}

pub type Result<T> = std::result::Result<T, EcommerceError>;
