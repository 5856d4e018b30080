use std::time::Instant;

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Method, Request, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::{NotifyError, Result};
use crate::services::notifier::{NotificationRecord, Notifier};
use crate::websocket::{Tunnel, TunnelConfig, WsConnection};

/// What the registrant asked for. Supplied by the caller, never touched by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionConfig {
    /// Assigned by the manager when empty.
    pub id: String,
    pub app_id: String,
    #[serde(rename = "type")]
    pub sub_type: String,
    pub notification_type: String,
    pub notify_url: String,
    pub expiry_time: Option<DateTime<Utc>>,
    /// Seconds between periodic notifications; 0 disables them.
    pub periodic_interval: u32,
    pub request_test_notif: bool,
    pub request_tunnel_uri: bool,
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        if *self == Self::default() {
            return Err(NotifyError::MissingConfig);
        }
        if !self.request_tunnel_uri && self.notify_url.is_empty() {
            return Err(NotifyError::InvalidConfig(
                "notify URL is required unless a tunnel URI is requested".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Direct,
    Tunnel,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Direct => "Direct",
            Mode::Tunnel => "Tunnel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Init,
    Ready,
    TestNotif,
    Expired,
}

/// Countdown to the next periodic notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodicCounter {
    /// Due: fires on the next tick where the subscription is ready.
    #[default]
    Idle,
    CountingDown(u32),
    /// A periodic send was dispatched and has not been confirmed yet.
    Outstanding,
}

impl PeriodicCounter {
    pub fn restart(interval: u32) -> Self {
        match interval {
            0 => PeriodicCounter::Idle,
            n => PeriodicCounter::CountingDown(n),
        }
    }

    pub fn tick(&mut self) {
        if let PeriodicCounter::CountingDown(n) = *self {
            *self = Self::restart(n.saturating_sub(1));
        }
    }
}

/// One registrant's delivery contract.
///
/// Values handed out by the manager are snapshots of its cached entry. The
/// tunnel, when present, is shared between the snapshot and the cache.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub cfg: SubscriptionConfig,
    /// The caller's serialized representation, returned verbatim.
    pub raw_json: String,
    mode: Mode,
    state: SubscriptionState,
    periodic: PeriodicCounter,
    test_notif_sent: bool,
    tunnel_provisioned: bool,
    tunnel: Option<Tunnel>,
}

impl Subscription {
    pub(crate) fn new(cfg: SubscriptionConfig, raw_json: impl Into<String>) -> Self {
        Self {
            cfg,
            raw_json: raw_json.into(),
            mode: Mode::Direct,
            state: SubscriptionState::Init,
            periodic: PeriodicCounter::Idle,
            test_notif_sent: false,
            tunnel_provisioned: false,
            tunnel: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn periodic(&self) -> PeriodicCounter {
        self.periodic
    }

    pub fn test_notif_sent(&self) -> bool {
        self.test_notif_sent
    }

    pub fn tunnel_provisioned(&self) -> bool {
        self.tunnel_provisioned
    }

    pub fn tunnel(&self) -> Option<&Tunnel> {
        self.tunnel.as_ref()
    }

    pub fn connection(&self) -> Option<&std::sync::Arc<WsConnection>> {
        self.tunnel.as_ref().map(Tunnel::connection)
    }

    pub(crate) fn set_state(&mut self, state: SubscriptionState) {
        self.state = state;
    }

    pub(crate) fn set_test_notif_sent(&mut self, sent: bool) {
        self.test_notif_sent = sent;
    }

    pub(crate) fn set_tunnel_provisioned(&mut self, provisioned: bool) {
        self.tunnel_provisioned = provisioned;
    }

    pub(crate) fn periodic_mut(&mut self) -> &mut PeriodicCounter {
        &mut self.periodic
    }

    /// Re-derive mode and state from the config. Idempotent.
    pub(crate) fn refresh_state(&mut self, tunnel_cfg: &TunnelConfig) -> Result<()> {
        if self.cfg.request_tunnel_uri {
            match &self.tunnel {
                Some(tunnel) => tunnel.reopen(),
                None => self.tunnel = Some(Tunnel::new(tunnel_cfg)?),
            }
            self.mode = Mode::Tunnel;
            self.state = SubscriptionState::Ready;
            self.cfg.notify_url.clear();
            self.cfg.request_test_notif = false;
            self.test_notif_sent = false;
            return Ok(());
        }

        if self.mode != Mode::Direct {
            // The tunnel object is kept so a switch back reuses it.
            if let Some(tunnel) = &self.tunnel {
                tunnel.disconnect();
            }
            self.mode = Mode::Direct;
            self.state = SubscriptionState::Init;
            self.test_notif_sent = false;
            self.tunnel_provisioned = false;
        }

        if self.cfg.request_test_notif {
            if self.state != SubscriptionState::TestNotif {
                self.state = SubscriptionState::TestNotif;
                self.test_notif_sent = false;
            }
        } else {
            self.state = SubscriptionState::Ready;
            self.test_notif_sent = false;
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        if self.state != SubscriptionState::Ready {
            return false;
        }
        match self.mode {
            Mode::Direct => true,
            Mode::Tunnel => self.tunnel.as_ref().is_some_and(|t| t.connection().is_ready()),
        }
    }

    /// Deliver `payload` to the registrant. Only `204 No Content` counts as delivered.
    pub async fn send_notification(&self, notifier: &Notifier, payload: &[u8]) -> Result<()> {
        if !matches!(
            self.state,
            SubscriptionState::Ready | SubscriptionState::Expired | SubscriptionState::TestNotif
        ) {
            return Err(NotifyError::InvalidState);
        }

        let start = Instant::now();
        let (target, result) = match (self.mode, &self.tunnel) {
            (Mode::Direct, _) => (
                self.cfg.notify_url.clone(),
                notifier.post(&self.cfg.notify_url, payload).await,
            ),
            (Mode::Tunnel, Some(tunnel)) => (
                tunnel
                    .connection()
                    .uri()
                    .unwrap_or_else(|| tunnel.connection().endpoint().to_string()),
                send_over_tunnel(tunnel, payload).await,
            ),
            (Mode::Tunnel, None) => (String::new(), Err(NotifyError::NotReady)),
        };

        notifier.observe(&NotificationRecord {
            subscription_id: &self.cfg.id,
            notification_type: &self.cfg.notification_type,
            mode: self.mode,
            target: &target,
            status: result.as_ref().ok().copied(),
            duration: start.elapsed(),
        });

        let status = result.inspect_err(|e| error!(id = %self.cfg.id, "{e}"))?;
        if status != StatusCode::NO_CONTENT {
            error!(id = %self.cfg.id, %status, "Notification rejected");
            return Err(NotifyError::UnexpectedStatus(status));
        }
        Ok(())
    }

    pub(crate) fn close_tunnel(&self) {
        if let Some(tunnel) = &self.tunnel {
            tunnel.close();
        }
    }

    pub(crate) fn to_record(&self) -> SubscriptionRecord {
        SubscriptionRecord {
            cfg: self.cfg.clone(),
            raw_json: self.raw_json.clone(),
            mode: self.mode,
            state: self.state,
            periodic: self.periodic,
            test_notif_sent: self.test_notif_sent,
            tunnel_uri: self.connection().and_then(|c| c.uri()),
        }
    }

    /// Rebuild from a stored record. No tunnel is attached; a periodic send or
    /// test handshake that was in flight when the record was written is lost.
    pub(crate) fn from_record(record: SubscriptionRecord) -> Self {
        let periodic = match record.periodic {
            PeriodicCounter::Outstanding => PeriodicCounter::Idle,
            other => other,
        };
        let test_notif_sent =
            record.test_notif_sent && record.state != SubscriptionState::TestNotif;
        Self {
            cfg: record.cfg,
            raw_json: record.raw_json,
            mode: record.mode,
            state: record.state,
            periodic,
            test_notif_sent,
            tunnel_provisioned: false,
            tunnel: None,
        }
    }
}

async fn send_over_tunnel(tunnel: &Tunnel, payload: &[u8]) -> Result<StatusCode> {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(CONTENT_TYPE, "application/json")
        .header(CONTENT_LENGTH, payload.len())
        .body(payload.to_vec())?;
    let resp = tunnel.transport().send_request(req).await?;
    Ok(resp.status())
}

/// Persisted form of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub cfg: SubscriptionConfig,
    pub raw_json: String,
    pub mode: Mode,
    pub state: SubscriptionState,
    #[serde(default)]
    pub periodic: PeriodicCounter,
    #[serde(default)]
    pub test_notif_sent: bool,
    #[serde(default)]
    pub tunnel_uri: Option<String>,
}
