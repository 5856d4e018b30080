use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{NotifyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsState {
    Init,
    Ready,
}

/// Inbound data frame handed to registered consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Binary(Vec<u8>),
    Text(String),
}

pub type FrameSender = mpsc::UnboundedSender<WsFrame>;

#[derive(Debug, Clone)]
pub struct WsConnectionConfig {
    /// Period between keepalive pings.
    pub keepalive_period: Duration,
    /// Delay between the close frame and the hard close.
    pub close_grace: Duration,
}

impl Default for WsConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_period: Duration::from_secs(600),
            close_grace: Duration::from_secs(1),
        }
    }
}

type Sink = Arc<AsyncMutex<SplitSink<WebSocket, Message>>>;

/// A live peer connection. Present only while the connection is `Ready`.
struct Link {
    session: u64,
    sink: Sink,
    reader: AbortHandle,
    keepalive: AbortHandle,
}

/// Server side of a client-initiated websocket, serving one peer at a time.
pub struct WsConnection {
    id: String,
    endpoint: String,
    cfg: WsConnectionConfig,
    uri: Mutex<Option<String>>,
    link: Mutex<Option<Link>>,
    accepting: AtomicBool,
    sessions: AtomicU64,
    handlers: Mutex<HashMap<String, FrameSender>>,
}

impl WsConnection {
    pub fn new(cfg: WsConnectionConfig) -> Arc<Self> {
        let id = format!("websocket-{}", uuid::Uuid::new_v4().simple());
        let endpoint = format!("ws/{id}");
        Arc::new(Self {
            id,
            endpoint,
            cfg,
            uri: Mutex::new(None),
            link: Mutex::new(None),
            accepting: AtomicBool::new(true),
            sessions: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Route path (relative, no leading slash) the upgrade handler is served on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn uri(&self) -> Option<String> {
        self.uri.lock().clone()
    }

    pub fn set_uri(&self, uri: impl Into<String>) {
        *self.uri.lock() = Some(uri.into());
    }

    pub fn state(&self) -> WsState {
        if self.link.lock().is_some() {
            WsState::Ready
        } else {
            WsState::Init
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WsState::Ready
    }

    /// Whether the upgrade handler admits new peers.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Upgrade handler. Rejects the upgrade while another peer is connected or
    /// while the connection is not accepting peers.
    pub fn connection_handler(self: &Arc<Self>, upgrade: WebSocketUpgrade) -> Response {
        if !self.is_accepting() {
            warn!(id = %self.id, "Websocket endpoint not accepting connections");
            return (StatusCode::NOT_FOUND, NotifyError::NotAccepting.to_string()).into_response();
        }
        if self.is_ready() {
            error!(id = %self.id, "Websocket connection already up");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                NotifyError::AlreadyConnected.to_string(),
            )
                .into_response();
        }

        let conn = Arc::clone(self);
        upgrade
            .on_failed_upgrade(|e| error!("Failed to upgrade websocket connection: {e}"))
            .on_upgrade(move |socket| async move { conn.attach(socket) })
    }

    fn attach(self: Arc<Self>, socket: WebSocket) {
        let (sink, stream) = socket.split();
        let sink: Sink = Arc::new(AsyncMutex::new(sink));

        let mut link = self.link.lock();
        if link.is_some() || !self.is_accepting() {
            // Lost a race against a concurrent upgrade or a disconnect.
            warn!(id = %self.id, "Dropping websocket peer");
            tokio::spawn(async move {
                let _ = sink.lock().await.close().await;
            });
            return;
        }

        let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let reader = tokio::spawn(read_loop(Arc::downgrade(&self), session, stream));
        let keepalive = tokio::spawn(keepalive_loop(sink.clone(), self.cfg.keepalive_period));

        *link = Some(Link {
            session,
            sink,
            reader: reader.abort_handle(),
            keepalive: keepalive.abort_handle(),
        });
        info!(id = %self.id, session, "Client connected to websocket");
    }

    /// Write one binary frame to the peer.
    pub async fn send_message(&self, msg: Vec<u8>) -> Result<()> {
        let sink = match self.link.lock().as_ref() {
            Some(link) => link.sink.clone(),
            None => {
                error!(id = %self.id, "Websocket connection not ready to send");
                return Err(NotifyError::NotReady);
            }
        };

        let mut sink = sink.lock().await;
        sink.send(Message::Binary(msg.into())).await.map_err(|e| {
            error!(id = %self.id, "Websocket write failed: {e}");
            NotifyError::Websocket(e.to_string())
        })
    }

    pub fn register_msg_handler(&self, name: &str, handler: FrameSender) -> Result<()> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(name) {
            return Err(NotifyError::HandlerExists(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn deregister_msg_handler(&self, name: &str) -> Result<()> {
        self.handlers
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| NotifyError::HandlerNotFound(name.to_string()))
    }

    /// Stop accepting sends immediately, then finish the close handshake in the background.
    pub fn close(&self) {
        let Some(link) = self.link.lock().take() else {
            return;
        };
        debug!(id = %self.id, session = link.session, "Closing websocket");

        let grace = self.cfg.close_grace;
        tokio::spawn(async move {
            let frame = CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static(""),
            };
            if let Err(e) = link.sink.lock().await.send(Message::Close(Some(frame))).await {
                error!("Failed to send websocket close frame: {e}");
            }
            tokio::time::sleep(grace).await;

            link.keepalive.abort();
            link.reader.abort();
            let _ = link.sink.lock().await.close().await;
        });
    }

    fn dispatch(&self, frame: WsFrame) {
        let handlers = self.handlers.lock();
        for (name, handler) in handlers.iter() {
            if handler.send(frame.clone()).is_err() {
                warn!(id = %self.id, handler = %name, "Message handler is gone");
            }
        }
    }

    /// Called by a reader loop on exit; ignored if a newer session took over.
    fn end_session(&self, session: u64) {
        let mut link = self.link.lock();
        if link.as_ref().map(|l| l.session) != Some(session) {
            return;
        }
        if let Some(old) = link.take() {
            old.keepalive.abort();
        }
        info!(id = %self.id, session, "Websocket connection lost");
    }
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(conn: Weak<WsConnection>, session: u64, mut stream: SplitStream<WebSocket>) {
    while let Some(msg) = stream.next().await {
        let frame = match msg {
            Ok(Message::Binary(data)) => WsFrame::Binary(data.to_vec()),
            Ok(Message::Text(text)) => WsFrame::Text(text.as_str().to_owned()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!(session, "Websocket read failed: {e}");
                break;
            }
        };
        match conn.upgrade() {
            Some(conn) => conn.dispatch(frame),
            None => return,
        }
    }

    if let Some(conn) = conn.upgrade() {
        conn.end_session(session);
    }
}

async fn keepalive_loop(sink: Sink, period: Duration) {
    loop {
        let ping = Message::Ping(Bytes::from_static(b"keepalive"));
        if sink.lock().await.send(ping).await.is_err() {
            debug!("Keepalive stopped");
            return;
        }
        tokio::time::sleep(period).await;
    }
}
