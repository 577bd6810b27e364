use std::time::Duration;

use cachelink_server::config::{BasicAuthConfig, RedisMode};
use cachelink_server::{AppConfig, AppState, ServerBuilder};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    state: AppState,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
        self.state.coordinator.shutdown();
    }
}

fn local_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.mode = RedisMode::Local;
    cfg.coordinator.cron_enabled = false;
    cfg
}

async fn start_server(cfg: AppConfig) -> TestServer {
    let server = ServerBuilder::new()
        .with_config(cfg)
        .build()
        .await
        .expect("build server");
    server.start_background().await.expect("background tasks");
    let state = server.state().clone();
    let app = server.router();

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        state,
        shutdown: tx,
        handle,
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_health() {
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    server.stop().await;
}

#[tokio::test]
async fn test_set_get_and_cascading_clear() {
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();
    let base = &server.base;

    let resp = client
        .put(format!("{base}/foo?millis=10000"))
        .json(&json!({"data": {"a": 1}, "assoc": ["bar"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["broadcastResult"], Value::Null);

    let body: Value = client
        .get(format!("{base}/foo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"a": 1}));

    let body: Value = client
        .get(format!("{base}/?k=foo&k=missing"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"foo": {"a": 1}, "missing": null}));

    let resp = client
        .delete(format!("{base}/bar"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["allKeysCleared"], json!(["bar", "foo"]));
    assert_eq!(body["broadcastResult"], Value::Null);

    let body: Value = client
        .get(format!("{base}/foo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, Value::Null);

    server.stop().await;
}

#[tokio::test]
async fn test_ttl_from_seconds_and_form_body() {
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();
    let base = &server.base;

    let resp = client
        .put(format!("{base}/"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("key=greeting&data=hello&seconds=30")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = client
        .get(format!("{base}/greeting"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!("hello"));

    server.stop().await;
}

#[tokio::test]
async fn test_validation_errors_are_bad_requests() {
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();
    let base = &server.base;

    // No TTL
    let resp = client
        .put(format!("{base}/k"))
        .json(&json!({"data": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // No data
    let resp = client
        .put(format!("{base}/foo?millis=10000"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp.text().await.unwrap().contains("\"data\""));
    let value: serde_json::Value = client
        .get(format!("{base}/foo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(value.is_null());

    // TTL beyond what the backend accepts
    let resp = client
        .put(format!("{base}/foo?millis=18446744073709551615"))
        .json(&json!({"data": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .get(format!("{base}/clear?k=a&levels=deep"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client.get(format!("{base}/clear")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client
        .put(format!("{base}/k?millis=10"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn test_clear_later_then_clear_now() {
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();
    let base = server.base.clone();

    for key in ["a", "b"] {
        let resp = client
            .put(format!("{base}/{key}?millis=60000&data=v"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let body: Value = client
        .get(format!("{base}/clear-later?k=a&k=b"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body,
        json!({"success": true, "added": 2, "broadcastResult": null})
    );

    let body: Value = client
        .get(format!("{base}/clear-counts"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"clearLaterCount": 2, "clearNowCount": 0}));

    let body: Value = client
        .get(format!("{base}/clear-now"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["started"], 2);
    assert_eq!(body["broadcastResult"], Value::Null);

    let client = &client;
    let base = base.as_str();
    eventually(move || async move {
        let counts: Value = client
            .get(format!("{base}/clear-counts"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let a: Value = client
            .get(format!("{base}/a"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        counts == json!({"clearLaterCount": 0, "clearNowCount": 0}) && a.is_null()
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn test_background_set() {
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();
    let base = server.base.clone();

    let body: Value = client
        .put(format!("{base}/bg?millis=60000&data=later&background=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"background": true}));

    let client = &client;
    let base = base.as_str();
    eventually(move || async move {
        let value: Value = client
            .get(format!("{base}/bg"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        value == json!("later")
    })
    .await;

    server.stop().await;
}

#[tokio::test]
async fn test_receive_broadcast() {
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();
    let base = &server.base;
    let own_id = server
        .state
        .engine
        .cluster_id()
        .await
        .unwrap()
        .expect("cluster id");

    let resp = client
        .post(format!("{base}/broadcast/set"))
        .header("x-postable-cluster", "other-cluster")
        .json(&json!({"key": "remote", "data": [1, 2], "millis": 60000}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);

    let body: Value = client
        .get(format!("{base}/remote"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!([1, 2]));

    let resp = client
        .post(format!("{base}/broadcast/clear"))
        .header("x-postable-cluster", own_id.as_str())
        .json(&json!({"keys": ["remote"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.text().await.unwrap(), "broadcast_error_same_cluster");

    let resp = client
        .post(format!("{base}/broadcast/explode"))
        .header("x-postable-cluster", "other-cluster")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.text().await.unwrap(), "broadcast_error_no_such_operation");

    let resp = client
        .post(format!("{base}/broadcast/clear"))
        .header("x-postable-cluster", "other-cluster")
        .json(&json!({"keys": ["remote"], "levels": "none"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["allKeysCleared"], json!(["remote"]));
    assert!(body.get("broadcastResult").is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_basic_auth() {
    let mut cfg = local_config();
    cfg.server.basic_auth = Some(BasicAuthConfig {
        user: "ops".into(),
        pass: "secret".into(),
    });
    let server = start_server(cfg).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/clear-counts", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers()["www-authenticate"],
        "Basic realm=Authorization Required"
    );

    let resp = client
        .get(format!("{}/clear-counts", server.base))
        .basic_auth("ops", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("{}/clear-counts", server.base))
        .basic_auth("ops", Some("secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    server.stop().await;
}

#[tokio::test]
async fn test_metrics_endpoint() {
    cachelink_server::metrics::init_metrics();
    let server = start_server(local_config()).await;
    let client = reqwest::Client::new();

    client
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .unwrap();
    let resp = client
        .get(format!("{}/metrics", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp.text().await.unwrap();
    assert!(text.contains("http_requests_total"));

    server.stop().await;
}
