use axum::Router;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::routes::{subscription_routes, system_routes, tunnel_routes};
use crate::state::app::AppState;

/// Build the complete Axum application:
/// - /subscriptions  (subscription CRUD + notify)
/// - /ws             (tunnel websocket upgrades)
/// - /system         (alive, version, metrics)
pub fn build_app(state: AppState) -> Router {
    Router::new()
        // /subscriptions/*
        .nest("/subscriptions", subscription_routes::routes(state.clone()))

        // /ws/*
        .nest("/ws", tunnel_routes::routes(state.tunnels.clone()))

        // /system/*
        .nest("/system", system_routes::routes(state))

        // Logging middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
