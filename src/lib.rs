//! Notification core for edge-platform services: subscription lifecycle,
//! scheduled notifications and delivery over direct HTTP or a client-initiated
//! websocket tunnel.

pub mod app;
pub mod config;
pub mod errors;
pub mod persistence;
pub mod routes;
pub mod services;
pub mod state;
pub mod websocket;

pub use errors::{NotifyError, Result};
pub use services::subscription_mgr::{SubscriptionCallbacks, SubscriptionMgr};
pub use state::subscription::{Mode, Subscription, SubscriptionConfig, SubscriptionState};
