use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, Response};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::errors::{NotifyError, Result};
use crate::websocket::codec::{decode_response, encode_request};
use crate::websocket::connection::{WsConnection, WsFrame};

type ResponseSlot = oneshot::Sender<Response<Vec<u8>>>;

#[derive(Default)]
struct Pending {
    seq: u32,
    slots: HashMap<u32, ResponseSlot>,
}

impl Pending {
    /// Next sequence number not held by an outstanding request.
    fn next_seq(&mut self) -> u32 {
        loop {
            self.seq = self.seq.wrapping_add(1);
            if !self.slots.contains_key(&self.seq) {
                return self.seq;
            }
        }
    }
}

/// Request/response exchange over a websocket, correlated by sequence number.
///
/// The server sends request frames and the peer answers with response
/// frames carrying the same sequence number, in any order.
pub struct NotifTransport {
    name: String,
    ws: Arc<WsConnection>,
    timeout: Duration,
    pending: Arc<Mutex<Pending>>,
}

impl NotifTransport {
    /// Register as consumer `name` on `ws` and start the inbound dispatch loop.
    pub fn new(name: impl Into<String>, ws: Arc<WsConnection>, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        ws.register_msg_handler(&name, tx)?;

        let pending = Arc::new(Mutex::new(Pending::default()));
        tokio::spawn(run_msg_handler(name.clone(), rx, pending.clone()));

        Ok(Self {
            name,
            ws,
            timeout,
            pending,
        })
    }

    pub fn connection(&self) -> &Arc<WsConnection> {
        &self.ws
    }

    /// Number of requests waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().slots.len()
    }

    pub async fn send_request(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let (seq, rx) = {
            let mut pending = self.pending.lock();
            let seq = pending.next_seq();
            let (tx, rx) = oneshot::channel();
            pending.slots.insert(seq, tx);
            (seq, rx)
        };
        let _slot = SlotGuard {
            pending: &self.pending,
            seq,
        };

        let frame = encode_request(&req, seq)?;
        self.ws.send_message(frame).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(NotifyError::NotReady),
            Err(_) => {
                error!(seq, ws = %self.ws.id(), "Request timed out");
                Err(NotifyError::Timeout)
            }
        }
    }

    /// Stop consuming frames and close the underlying connection.
    /// Requests still waiting fail with `NotReady`.
    pub fn close(&self) {
        if let Err(e) = self.ws.deregister_msg_handler(&self.name) {
            debug!("{e}");
        }
        self.pending.lock().slots.clear();
        self.ws.close();
    }
}

struct SlotGuard<'a> {
    pending: &'a Mutex<Pending>,
    seq: u32,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().slots.remove(&self.seq);
    }
}

async fn run_msg_handler(
    name: String,
    mut rx: mpsc::UnboundedReceiver<WsFrame>,
    pending: Arc<Mutex<Pending>>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            WsFrame::Binary(data) => {
                if let Err(e) = receive_response(&pending, &data) {
                    error!(handler = %name, "{e}");
                }
            }
            WsFrame::Text(_) => warn!(handler = %name, "Ignoring unexpected text message"),
        }
    }
    debug!(handler = %name, "Message handler stopped");
}

fn receive_response(pending: &Mutex<Pending>, data: &[u8]) -> Result<()> {
    let (seq, resp) = decode_response(data)?;
    let slot = pending
        .lock()
        .slots
        .remove(&seq)
        .ok_or(NotifyError::UnknownSequence(seq))?;

    // The waiter may have timed out in the meantime.
    let _ = slot.send(resp);
    Ok(())
}
