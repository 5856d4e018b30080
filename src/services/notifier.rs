use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use serde::Serialize;
use tracing::info;

use crate::errors::Result;
use crate::state::subscription::Mode;

/// Outcome of one notification attempt.
#[derive(Debug, Clone)]
pub struct NotificationRecord<'a> {
    pub subscription_id: &'a str,
    pub notification_type: &'a str,
    pub mode: Mode,
    /// Notify URL, or the tunnel endpoint in tunnel mode.
    pub target: &'a str,
    /// `None` when no response was received.
    pub status: Option<StatusCode>,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct NotificationMetrics {
    attempts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    latency_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub total_latency_us: u64,
}

/// Outbound HTTP client plus the observability sink for notification attempts.
pub struct Notifier {
    client: reqwest::Client,
    sandbox: String,
    service: String,
    metrics_enabled: bool,
    metrics: NotificationMetrics,
}

impl Notifier {
    pub fn new(
        timeout: Duration,
        sandbox: impl Into<String>,
        service: impl Into<String>,
        metrics_enabled: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            sandbox: sandbox.into(),
            service: service.into(),
            metrics_enabled,
            metrics: NotificationMetrics::default(),
        })
    }

    /// POST `payload` as JSON to `url` and return the response status.
    pub async fn post(&self, url: &str, payload: &[u8]) -> Result<StatusCode> {
        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await?;
        Ok(resp.status())
    }

    pub fn observe(&self, record: &NotificationRecord<'_>) {
        let status = record
            .status
            .map(|s| s.as_u16().to_string())
            .unwrap_or_else(|| "none".to_string());
        let duration_ms = record.duration.as_secs_f64() * 1000.0;

        info!(
            target: "notification",
            sandbox = %self.sandbox,
            service = %self.service,
            subscription = %record.subscription_id,
            notification_type = %record.notification_type,
            mode = record.mode.as_str(),
            url = %record.target,
            method = "POST",
            status = %status,
            duration_ms,
            "notification sent"
        );

        if !self.metrics_enabled {
            return;
        }
        let m = &self.metrics;
        m.attempts.fetch_add(1, Ordering::Relaxed);
        if record.status == Some(StatusCode::NO_CONTENT) {
            m.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            m.failed.fetch_add(1, Ordering::Relaxed);
        }
        m.latency_us
            .fetch_add(record.duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        MetricsSnapshot {
            attempts: m.attempts.load(Ordering::Relaxed),
            delivered: m.delivered.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            total_latency_us: m.latency_us.load(Ordering::Relaxed),
        }
    }
}
