#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Response, StatusCode};
use axum::routing::post;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use edge_notify::config::SubscriptionMgrConfig;
use edge_notify::websocket::codec::{decode_request, encode_response};

pub type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve `app` on an ephemeral local port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub async fn wait_for<F, Fut>(cond: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Manager settings for tests: fast timeouts, no scheduler surprises.
pub fn mgr_config() -> SubscriptionMgrConfig {
    SubscriptionMgrConfig {
        module: "test-module".into(),
        sandbox: "test-sbox".into(),
        mep: "mep1".into(),
        service: "test-svc".into(),
        metrics_enabled: true,
        http_timeout_ms: 1_000,
        tunnel_timeout_ms: 1_000,
        close_grace_ms: 50,
        test_notif_delay_ms: 10,
        ..Default::default()
    }
}

pub async fn connect(url: &str) -> Peer {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Next request frame from the server, skipping control frames.
pub async fn next_request(peer: &mut Peer) -> Option<(u32, Vec<u8>)> {
    while let Some(msg) = peer.next().await {
        match msg.ok()? {
            Message::Binary(data) => {
                let (seq, req) = decode_request(&data).unwrap();
                return Some((seq, req.into_body()));
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

pub async fn respond(peer: &mut Peer, seq: u32, status: StatusCode, body: Vec<u8>) {
    let resp = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(CONTENT_LENGTH, body.len())
        .body(body)
        .unwrap();
    let frame = encode_response(&resp, seq).unwrap();
    peer.send(Message::binary(frame)).await.unwrap();
}

/// Answer every request with `status`, echoing the body. Returns the request
/// bodies once the server closes the connection.
pub fn spawn_responder(mut peer: Peer, status: StatusCode) -> tokio::task::JoinHandle<Vec<Vec<u8>>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some((seq, body)) = next_request(&mut peer).await {
            seen.push(body.clone());
            respond(&mut peer, seq, status, body).await;
        }
        seen
    })
}

/// HTTP endpoint standing in for a registrant's notify URL.
#[derive(Clone)]
pub struct Registrant {
    pub url: String,
    received: Arc<Mutex<Vec<Value>>>,
    status: Arc<Mutex<StatusCode>>,
}

impl Registrant {
    pub async fn start(status: StatusCode) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(Mutex::new(status));
        let app = Router::new()
            .route("/notify", post(accept))
            .with_state((received.clone(), status.clone()));
        let addr = serve(app).await;

        Self {
            url: format!("http://{addr}/notify"),
            received,
            status,
        }
    }

    pub fn set_status(&self, status: StatusCode) {
        *self.status.lock() = status;
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    pub fn count_of(&self, notification_type: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|n| n["notificationType"] == notification_type)
            .count()
    }
}

async fn accept(
    State((received, status)): State<(Arc<Mutex<Vec<Value>>>, Arc<Mutex<StatusCode>>)>,
    body: Bytes,
) -> StatusCode {
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    received.lock().push(value);
    let status = *status.lock();
    status
}

/// A URL nothing listens on.
pub async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/notify")
}
