//! Aggregates module
pub mod order;
pub mod cart;
pub mod refund;

pub use order::{DeliveryType, NewOrder, NewOrderItem, Order, OrderItem, PaymentMethod, PaymentTransaction, PickupStatus, ProviderRef, ProviderRefKind, ProviderRefs};
pub use cart::{build_snapshot, parse_selection, CartLine, CheckoutSnapshot, ShippingChoice, SnapshotError, UserProfile};
pub use refund::{NewRefund, NewRefundItem, PreferredMethod, Refund, RefundEvidence, RefundItem, RefundReason, RefundTransaction, RefundType, RefundUsage, RequestedLine, TxnStatus};
