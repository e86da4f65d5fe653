//! Domain model: statuses, value objects, aggregates and events
pub mod aggregates;
pub mod events;
pub mod status;
pub mod value_objects;

pub use status::{OrderStatus, RefundStatus};
