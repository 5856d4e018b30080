mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use edge_notify::app::build_app;
use edge_notify::config::AppConfig;
use edge_notify::persistence::JsonStore;
use edge_notify::services::notification_service;
use edge_notify::services::subscription_mgr::SubscriptionMgr;
use edge_notify::state::app::AppState;
use edge_notify::state::tunnel::TunnelRegistry;

use common::{connect, mgr_config, spawn_responder, wait_until, Registrant};

struct TestServer {
    base: String,
    mgr: SubscriptionMgr,
    client: reqwest::Client,
}

async fn start() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = AppConfig {
        port: addr.port(),
        log_level: "debug".into(),
        server_version: "9.9.9".into(),
        snapshot_path: None,
        snapshot_interval: 30,
        public_ws_base: Some(format!("ws://{addr}")),
        subscriptions: mgr_config(),
    };
    let tunnels = TunnelRegistry::new();
    let callbacks = notification_service::callbacks(tunnels.clone(), config.ws_base());
    let mgr = SubscriptionMgr::new(
        config.subscriptions.clone(),
        Arc::new(JsonStore::in_memory()),
        callbacks,
    )
    .unwrap();

    let app = build_app(AppState::new(mgr.clone(), tunnels, config));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        mgr,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

#[tokio::test]
async fn system_routes() {
    let server = start().await;

    let alive = server.client.get(server.url("/system/alive")).send().await.unwrap();
    assert_eq!(alive.status(), StatusCode::OK);
    assert_eq!(alive.text().await.unwrap(), "OK");

    let version: Value = server
        .client
        .get(server.url("/system/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["version"], "9.9.9");

    let metrics: Value = server
        .client
        .get(server.url("/system/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["attempts"], 0);
}

#[tokio::test]
async fn subscription_crud_and_notify() {
    let server = start().await;
    let registrant = Registrant::start(StatusCode::NO_CONTENT).await;

    let body = json!({
        "appInstanceId": "app1",
        "subscriptionType": "ZoneStatus",
        "notificationType": "ZoneStatusNotification",
        "callbackReference": registrant.url,
    });
    let resp = server
        .client
        .post(server.url("/subscriptions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    let id = created["subscriptionId"].as_str().unwrap().to_string();
    assert_eq!(created["mode"], "Direct");
    assert_eq!(created["state"], "Ready");
    assert_eq!(created["body"], body);

    let listed: Vec<Value> = server
        .client
        .get(server.url("/subscriptions?appId=app1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let none: Vec<Value> = server
        .client
        .get(server.url("/subscriptions?appId=other"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(none.is_empty());

    let notify = server
        .client
        .post(server.url(&format!("/subscriptions/{id}/notify")))
        .body(r#"{"notificationType":"ZoneStatusNotification"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(notify.status(), StatusCode::NO_CONTENT);
    assert_eq!(registrant.count_of("ZoneStatusNotification"), 1);

    let updated = json!({
        "appInstanceId": "app1",
        "subscriptionType": "ZoneStatus",
        "callbackReference": registrant.url,
        "periodicInterval": 30,
    });
    let resp = server
        .client
        .put(server.url(&format!("/subscriptions/{id}")))
        .json(&updated)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(server.mgr.get_subscription(&id).unwrap().cfg.periodic_interval, 30);

    let resp = server
        .client
        .delete(server.url(&format!("/subscriptions/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = server
        .client
        .get(server.url(&format!("/subscriptions/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_requests_and_pending_handshake() {
    let server = start().await;

    let resp = server
        .client
        .post(server.url("/subscriptions"))
        .body("{broken")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .client
        .post(server.url("/subscriptions"))
        .json(&json!({ "appInstanceId": "app1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // The test notification cannot be delivered, so the subscription never readies.
    let created: Value = server
        .client
        .post(server.url("/subscriptions"))
        .json(&json!({
            "appInstanceId": "app1",
            "subscriptionType": "ZoneStatus",
            "callbackReference": common::unused_url().await,
            "requestTestNotification": true,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["state"], "TestNotif");
    let id = created["subscriptionId"].as_str().unwrap();

    let notify = server
        .client
        .post(server.url(&format!("/subscriptions/{id}/notify")))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(notify.status(), StatusCode::CONFLICT);

    let resp = server
        .client
        .delete(server.url("/subscriptions?subscriptionType=ZoneStatus"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(server.mgr.get_all_subscriptions().is_empty());
}

#[tokio::test]
async fn tunnel_subscription_over_http() {
    let server = start().await;

    let created: Value = server
        .client
        .post(server.url("/subscriptions"))
        .json(&json!({
            "appInstanceId": "app1",
            "subscriptionType": "ZoneStatus",
            "websockNotifConfig": { "requestWebsocketUri": true },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["mode"], "Tunnel");
    let id = created["subscriptionId"].as_str().unwrap().to_string();
    let ws_uri = created["websocketUri"].as_str().unwrap().to_string();
    assert!(ws_uri.starts_with("ws://127.0.0.1:"));

    let peer = connect(&ws_uri).await;
    let responder = spawn_responder(peer, StatusCode::NO_CONTENT);
    let sub = server.mgr.get_subscription(&id).unwrap();
    assert!(wait_until(|| server.mgr.ready_to_send(&sub)).await);

    let notify = server
        .client
        .post(server.url(&format!("/subscriptions/{id}/notify")))
        .body(r#"{"over":"tunnel"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(notify.status(), StatusCode::NO_CONTENT);

    server.mgr.delete_subscription(&id).unwrap();
    let seen = responder.await.unwrap();
    assert_eq!(seen, vec![br#"{"over":"tunnel"}"#.to_vec()]);
}
