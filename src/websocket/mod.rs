//! Reverse-RPC tunnel: a client-initiated websocket carrying server-initiated
//! HTTP request/response exchanges.

pub mod codec;
pub mod connection;
pub mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use connection::{FrameSender, WsConnection, WsConnectionConfig, WsFrame, WsState};
pub use transport::NotifTransport;

use crate::errors::Result;

/// Consumer name the notification transport registers under.
pub const TRANSPORT_HANDLER: &str = "3gpp-ws-notif";

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub connection: WsConnectionConfig,
    /// How long a tunnelled request waits for its response.
    pub request_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connection: WsConnectionConfig::default(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// A websocket connection and the transport multiplexed over it.
#[derive(Clone)]
pub struct Tunnel {
    connection: Arc<WsConnection>,
    transport: Arc<NotifTransport>,
}

impl Tunnel {
    pub fn new(cfg: &TunnelConfig) -> Result<Self> {
        let connection = WsConnection::new(cfg.connection.clone());
        let transport = NotifTransport::new(
            TRANSPORT_HANDLER,
            connection.clone(),
            cfg.request_timeout,
        )?;
        Ok(Self {
            connection,
            transport: Arc::new(transport),
        })
    }

    pub fn connection(&self) -> &Arc<WsConnection> {
        &self.connection
    }

    pub fn transport(&self) -> &Arc<NotifTransport> {
        &self.transport
    }

    /// Close the peer connection and stop admitting peers until `reopen`.
    pub fn disconnect(&self) {
        self.connection.set_accepting(false);
        self.connection.close();
    }

    pub fn reopen(&self) {
        self.connection.set_accepting(true);
    }

    /// Tear down the transport and the connection for good.
    pub fn close(&self) {
        self.connection.set_accepting(false);
        self.transport.close();
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tunnel").field(&self.connection).finish()
    }
}
