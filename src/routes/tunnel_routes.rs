use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::errors::NotifyError;
use crate::state::tunnel::TunnelRegistry;

pub fn routes(tunnels: TunnelRegistry) -> Router {
    Router::new()
        .route("/{id}", get(upgrade))
        .with_state(tunnels)
}

//
// GET /ws/{id}
// Websocket upgrade for a tunnel-mode subscription.
//
async fn upgrade(
    State(tunnels): State<TunnelRegistry>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let endpoint = format!("ws/{id}");
    match tunnels.get(&endpoint) {
        Some(conn) => conn.connection_handler(ws),
        None => NotifyError::NotFound(endpoint).into_response(),
    }
}
