/*****************************************************************************************
 *
 *  edge-notify – Subscription & notification service for edge platforms
 *  ---------------------------------------------------------------------
 *
 *  Direct HTTP delivery + websocket tunnel delivery, JSON snapshot persistence
 *
 *****************************************************************************************/

use std::path::PathBuf;
use std::sync::Arc;

use axum::serve;
use tokio::net::TcpListener;
use tokio::task;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;

use edge_notify::app;
use edge_notify::config::AppConfig;
use edge_notify::persistence::{autosave_loop, JsonStore};
use edge_notify::services::notification_service;
use edge_notify::services::subscription_mgr::SubscriptionMgr;
use edge_notify::state::app::AppState;
use edge_notify::state::tunnel::TunnelRegistry;

#[tokio::main]
async fn main() {
    //
    // ────────────────────────────────────────────────────────
    //  Locate config.json (EXE folder or project root)
    // ────────────────────────────────────────────────────────
    //
    let exe_path = std::env::current_exe().expect("Cannot get executable path");
    let exe_dir = exe_path.parent().expect("Cannot get executable directory");

    let mut config_path: PathBuf = exe_dir.join("config.json");

    if !config_path.exists() {
        let fallback = exe_dir.join("..").join("config.json");
        if fallback.exists() {
            config_path = fallback;
        } else {
            panic!(
                "config.json not found in:\n  {}\n  {}\nCopy config.json to one of these paths.",
                exe_dir.join("config.json").display(),
                fallback.display()
            );
        }
    }

    //
    // ────────────────────────────────────────────────────────
    //  Load configuration
    // ────────────────────────────────────────────────────────
    //
    let cfg = AppConfig::load_from_file(&config_path).expect("Failed to load config.json");

    //
    // ────────────────────────────────────────────────────────
    //  Configure logging
    // ────────────────────────────────────────────────────────
    //
    let level = match cfg.log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info"  => LevelFilter::INFO,
        "warn"  => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    tracing::info!("Loaded config.json from {}", config_path.display());
    tracing::info!("Starting edge-notify…");
    tracing::info!("Loaded configuration: {:?}", cfg);

    //
    // ────────────────────────────────────────────────────────
    //  Open subscription store (snapshot file or memory)
    // ────────────────────────────────────────────────────────
    //
    let store = Arc::new(match &cfg.snapshot_path {
        Some(path) => JsonStore::open(path).expect("Failed to load snapshot"),
        None => JsonStore::in_memory(),
    });

    //
    // ────────────────────────────────────────────────────────
    //  Create Subscription Manager and start its scheduler
    // ────────────────────────────────────────────────────────
    //
    let tunnels = TunnelRegistry::new();
    let callbacks = notification_service::callbacks(tunnels.clone(), cfg.ws_base());
    let mgr = SubscriptionMgr::new(cfg.subscriptions.clone(), store.clone(), callbacks)
        .expect("Failed to create Subscription Manager");
    mgr.start();

    //
    // ────────────────────────────────────────────────────────
    //  Start autosave loop
    // ────────────────────────────────────────────────────────
    //
    if cfg.snapshot_path.is_some() {
        let store_clone = store.clone();
        let interval = cfg.snapshot_interval;

        task::spawn(async move {
            autosave_loop(store_clone, interval).await;
        });
    }

    //
    // ────────────────────────────────────────────────────────
    //  Build Axum app (Subscriptions + Tunnels + System routes)
    // ────────────────────────────────────────────────────────
    //
    let app = app::build_app(AppState::new(mgr.clone(), tunnels, cfg.clone()));

    //
    // ────────────────────────────────────────────────────────
    //  Bind server and start listening
    // ────────────────────────────────────────────────────────
    //
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    tracing::info!("Listening on http://{}", addr);

    serve(listener, app)
        .with_graceful_shutdown(shutdown(mgr, store))
        .await
        .expect("Server error");
}

//
// ─────────────────────────────────────────────────────────────
//  Graceful shutdown handler
// ─────────────────────────────────────────────────────────────
//
async fn shutdown(mgr: SubscriptionMgr, store: Arc<JsonStore>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");

    tracing::warn!("CTRL+C received, saving snapshot…");
    mgr.shutdown();
    if let Err(e) = store.save_snapshot().await {
        tracing::error!("Failed to save snapshot: {e}");
        return;
    }
    tracing::info!("Snapshot saved. Goodbye.");
}
