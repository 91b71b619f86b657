//! Per-destination subscriptions over the shared broker connection

pub mod registry;

pub use registry::{MessageHandler, SubscriptionHandle, SubscriptionRegistry};
