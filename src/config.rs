use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::Path};

use crate::errors::{NotifyError, Result};
use crate::websocket::{TunnelConfig, WsConnectionConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// HTTP port to listen on.
    pub port: u16,

    /// Log level for tracing (e.g. "info", "debug").
    pub log_level: String,

    pub server_version: String,

    /// Path to the subscription snapshot JSON file.
    ///
    /// If `None`, subscriptions live in memory only.
    #[serde(default)]
    pub snapshot_path: Option<String>,

    /// Interval (seconds) between automatic snapshot saves.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Externally reachable websocket base, e.g. `ws://edge.example:8080`.
    /// Defaults to `ws://127.0.0.1:<port>`.
    #[serde(default)]
    pub public_ws_base: Option<String>,

    #[serde(default)]
    pub subscriptions: SubscriptionMgrConfig,
}

fn default_snapshot_interval() -> u64 {
    30
}

impl AppConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::read_to_string(path)
            .map_err(|e| NotifyError::Config(format!("{}: {e}", path.display())))?;

        serde_json::from_str::<AppConfig>(&file)
            .map_err(|e| NotifyError::Config(format!("{}: {e}", path.display())))
    }

    pub fn ws_base(&self) -> String {
        self.public_ws_base
            .clone()
            .unwrap_or_else(|| format!("ws://127.0.0.1:{}", self.port))
    }
}

/// Subscription manager settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SubscriptionMgrConfig {
    pub module: String,
    pub sandbox: String,
    pub mep: String,
    pub service: String,

    /// Store key prefix. Derived from sandbox/module/mep when absent.
    pub base_key: Option<String>,

    pub metrics_enabled: bool,

    pub http_timeout_ms: u64,
    pub tunnel_timeout_ms: u64,
    pub keepalive_secs: u64,
    pub close_grace_ms: u64,

    /// Delay before the test notification handshake starts, so the
    /// create/update call returns to its caller first.
    pub test_notif_delay_ms: u64,

    pub tick_ms: u64,
}

impl Default for SubscriptionMgrConfig {
    fn default() -> Self {
        Self {
            module: String::new(),
            sandbox: String::new(),
            mep: String::new(),
            service: String::new(),
            base_key: None,
            metrics_enabled: false,
            http_timeout_ms: 5_000,
            tunnel_timeout_ms: 5_000,
            keepalive_secs: 600,
            close_grace_ms: 1_000,
            test_notif_delay_ms: 100,
            tick_ms: 1_000,
        }
    }
}

impl SubscriptionMgrConfig {
    // data:sbox:<sandbox>:<module>:mep:<mep>:app:<app-id>:sub:<sub-type>:<sub-id>
    pub fn base_key(&self) -> String {
        match &self.base_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => format!("data:sbox:{}:{}:mep:{}:", self.sandbox, self.module, self.mep),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn test_notif_delay(&self) -> Duration {
        Duration::from_millis(self.test_notif_delay_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn tunnel(&self) -> TunnelConfig {
        TunnelConfig {
            connection: WsConnectionConfig {
                keepalive_period: Duration::from_secs(self.keepalive_secs),
                close_grace: Duration::from_millis(self.close_grace_ms),
            },
            request_timeout: Duration::from_millis(self.tunnel_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{ "port": 8080, "log_level": "info", "server_version": "1.0" }"#,
        )
        .unwrap();

        assert_eq!(cfg.snapshot_interval, 30);
        assert_eq!(cfg.ws_base(), "ws://127.0.0.1:8080");
        assert_eq!(cfg.subscriptions.tick(), Duration::from_secs(1));
        assert_eq!(
            cfg.subscriptions.tunnel().connection.keepalive_period,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn base_key_derivation() {
        let mut cfg = SubscriptionMgrConfig {
            module: "app-enablement".into(),
            sandbox: "sbx1".into(),
            mep: "mep1".into(),
            ..Default::default()
        };
        assert_eq!(cfg.base_key(), "data:sbox:sbx1:app-enablement:mep:mep1:");

        cfg.base_key = Some("custom:".into());
        assert_eq!(cfg.base_key(), "custom:");
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        assert!(matches!(
            AppConfig::load_from_file("/nonexistent/config.json"),
            Err(NotifyError::Config(_))
        ));
    }
}
