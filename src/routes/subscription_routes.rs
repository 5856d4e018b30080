use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{NotifyError, Result};
use crate::state::app::AppState;
use crate::state::subscription::{
    Mode, PeriodicCounter, Subscription, SubscriptionConfig, SubscriptionState,
};

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/",
            post(create_subscription)
                .get(list_subscriptions)
                .delete(delete_subscriptions),
        )
        .route(
            "/{id}",
            get(get_subscription)
                .put(update_subscription)
                .delete(delete_subscription),
        )
        .route("/{id}/notify", post(notify))
        .with_state(state)
}

/// Registrant-facing subscription body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionBody {
    pub app_instance_id: String,
    pub subscription_type: String,
    pub notification_type: String,
    pub callback_reference: Option<String>,
    pub expiry_deadline: Option<DateTime<Utc>>,
    pub periodic_interval: u32,
    pub request_test_notification: bool,
    pub websock_notif_config: Option<WebsockNotifConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebsockNotifConfig {
    pub request_websocket_uri: bool,
}

impl SubscriptionBody {
    fn into_config(self, id: String) -> SubscriptionConfig {
        SubscriptionConfig {
            id,
            app_id: self.app_instance_id,
            sub_type: self.subscription_type,
            notification_type: self.notification_type,
            notify_url: self.callback_reference.unwrap_or_default(),
            expiry_time: self.expiry_deadline,
            periodic_interval: self.periodic_interval,
            request_test_notif: self.request_test_notification,
            request_tunnel_uri: self
                .websock_notif_config
                .is_some_and(|c| c.request_websocket_uri),
        }
    }
}

fn parse_body(body: &Bytes) -> Result<(SubscriptionBody, String)> {
    let raw = std::str::from_utf8(body)
        .map_err(|e| NotifyError::InvalidConfig(e.to_string()))?
        .to_string();
    let parsed = serde_json::from_str(&raw)?;
    Ok((parsed, raw))
}

/// What the API hands back for one subscription.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub subscription_id: String,
    pub mode: Mode,
    pub state: SubscriptionState,
    pub periodic: PeriodicCounter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_uri: Option<String>,
    /// The registrant's body as submitted.
    pub body: Value,
}

impl From<&Subscription> for SubscriptionView {
    fn from(sub: &Subscription) -> Self {
        Self {
            subscription_id: sub.cfg.id.clone(),
            mode: sub.mode(),
            state: sub.state(),
            periodic: sub.periodic(),
            websocket_uri: sub.connection().and_then(|c| c.uri()),
            body: serde_json::from_str(&sub.raw_json).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterParams {
    pub app_id: String,
    pub subscription_type: String,
}

//
// POST /subscriptions
//
async fn create_subscription(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let (parsed, raw) = parse_body(&body)?;
    let cfg = parsed.into_config(state.mgr.generate_subscription_id());
    let sub = state.mgr.create_subscription(cfg, raw)?;
    Ok((StatusCode::CREATED, Json(SubscriptionView::from(&sub))))
}

//
// GET /subscriptions?appId=&subscriptionType=
//
async fn list_subscriptions(
    State(state): State<AppState>,
    Query(filter): Query<FilterParams>,
) -> Json<Vec<SubscriptionView>> {
    let subs = state
        .mgr
        .get_filtered_subscriptions(&filter.app_id, &filter.subscription_type);
    Json(subs.iter().map(SubscriptionView::from).collect())
}

//
// DELETE /subscriptions?appId=&subscriptionType=
//
async fn delete_subscriptions(
    State(state): State<AppState>,
    Query(filter): Query<FilterParams>,
) -> Result<StatusCode> {
    state
        .mgr
        .delete_filtered_subscriptions(&filter.app_id, &filter.subscription_type)?;
    Ok(StatusCode::NO_CONTENT)
}

//
// GET /subscriptions/{id}
//
async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionView>> {
    let sub = state.mgr.get_subscription(&id)?;
    Ok(Json(SubscriptionView::from(&sub)))
}

//
// PUT /subscriptions/{id}
//
async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SubscriptionView>> {
    let (parsed, raw) = parse_body(&body)?;
    let mut sub = state.mgr.get_subscription(&id)?;
    sub.cfg = parsed.into_config(id);
    sub.raw_json = raw;

    let updated = state.mgr.update_subscription(&sub)?;
    Ok(Json(SubscriptionView::from(&updated)))
}

//
// DELETE /subscriptions/{id}
//
async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.mgr.delete_subscription(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

//
// POST /subscriptions/{id}/notify
// Forward the body to the registrant.
//
async fn notify(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    let sub = state.mgr.get_subscription(&id)?;
    if !state.mgr.ready_to_send(&sub) {
        return Err(NotifyError::InvalidState);
    }
    state.mgr.send_notification(&sub, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}
