use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::errors::{NotifyError, Result};
use crate::services::subscription_mgr::{SubscriptionCallbacks, SubscriptionMgr};
use crate::state::subscription::Subscription;
use crate::state::tunnel::TunnelRegistry;

pub const EXPIRY_NOTIFICATION: &str = "ExpiryNotification";
pub const PERIODIC_NOTIFICATION: &str = "PeriodicNotification";
pub const TEST_NOTIFICATION: &str = "TestNotification";

/// Hooks wiring the manager to the HTTP front-end.
///
/// `ws_base` is the externally reachable websocket prefix tunnel URIs are built on.
pub fn callbacks(tunnels: TunnelRegistry, ws_base: impl Into<String>) -> SubscriptionCallbacks {
    let ws_base = ws_base.into();

    SubscriptionCallbacks::new()
        .on_expired(|mgr, sub| async move {
            let mut body = notification(EXPIRY_NOTIFICATION, &sub);
            body["expiryDeadline"] = json!(sub.cfg.expiry_time);
            if let Err(e) = send(&mgr, &sub, &body).await {
                warn!(id = %sub.cfg.id, "Expiry notification not delivered: {e}");
            }
        })
        .on_periodic(|mgr, sub| async move {
            let body = notification(PERIODIC_NOTIFICATION, &sub);
            if let Err(e) = send(&mgr, &sub, &body).await {
                warn!(id = %sub.cfg.id, "Periodic notification not delivered: {e}");
            }
        })
        .on_test_notification(|mgr, sub| async move {
            let body = notification(TEST_NOTIFICATION, &sub);
            send(&mgr, &sub, &body).await
        })
        .on_new_tunnel(move |sub| {
            let conn = sub.connection().ok_or_else(|| {
                NotifyError::Callback(format!("subscription {} has no tunnel", sub.cfg.id))
            })?;
            tunnels.register(conn);
            Ok(format!(
                "{}/{}",
                ws_base.trim_end_matches('/'),
                conn.endpoint()
            ))
        })
}

fn notification(notification_type: &str, sub: &Subscription) -> Value {
    json!({
        "notificationType": notification_type,
        "subscriptionId": sub.cfg.id,
        "subscriptionType": sub.cfg.sub_type,
        "timeStamp": {
            "seconds": Utc::now().timestamp(),
            "nanoSeconds": 0
        },
        "_links": {
            "subscription": { "href": format!("subscriptions/{}", sub.cfg.id) }
        }
    })
}

async fn send(mgr: &SubscriptionMgr, sub: &Subscription, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    mgr.send_notification(sub, &payload)
        .await
        .inspect_err(|e| error!(id = %sub.cfg.id, "Failed to send notification: {e}"))
}
