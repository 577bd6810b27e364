use std::time::Duration;

use cachelink_server::broadcast::{BroadcastStatus, Broadcaster, CLUSTER_HEADER};
use cachelink_server::config::{BasicAuthConfig, RedisMode};
use cachelink_server::{AppConfig, ServerBuilder};
use serde_json::{Value, json};
use wiremock::matchers::{basic_auth, body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_posts_to_every_target() {
    let ok = MockServer::start().await;
    let failing = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/broadcast/clear"))
        .and(header(CLUSTER_HEADER, "cluster-a"))
        .and(body_json(json!({"keys": ["k"], "levels": "all"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&ok)
        .await;
    Mock::given(method("POST"))
        .and(path("/broadcast/clear"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&failing)
        .await;

    let broadcaster = Broadcaster::new(
        &[ok.uri(), format!("{}/", failing.uri())],
        Duration::from_secs(2),
        None,
    )
    .unwrap();
    let result = broadcaster
        .broadcast(
            "cluster-a",
            "clear",
            &json!({"keys": ["k"], "levels": "all"}),
        )
        .await
        .expect("targets configured");

    assert_eq!(result.operation, "clear");
    assert_eq!(result.failed_count, 1);
    let ok_response = &result.responses[&format!("{}/broadcast/clear", ok.uri())];
    assert_eq!(ok_response.status, BroadcastStatus::Code(200));
    assert_eq!(ok_response.body, Some(json!({"success": true})));
    let failed_response = &result.responses[&format!("{}/broadcast/clear", failing.uri())];
    assert_eq!(failed_response.status, BroadcastStatus::Code(500));
    assert_eq!(failed_response.body, Some(json!("boom")));
}

#[tokio::test]
async fn test_unreachable_target_is_counted() {
    // Reserve a port, then release it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let broadcaster =
        Broadcaster::new(&[format!("http://{addr}")], Duration::from_secs(1), None).unwrap();
    let result = broadcaster
        .broadcast("cluster-a", "clear-now", &Value::Null)
        .await
        .unwrap();
    assert_eq!(result.failed_count, 1);
    let response = result.responses.values().next().unwrap();
    assert_eq!(response.status, BroadcastStatus::Failed("broadcast_failed"));
    assert_eq!(
        serde_json::to_value(response).unwrap(),
        json!({"status": "broadcast_failed"})
    );
}

#[tokio::test]
async fn test_sends_basic_auth() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broadcast/clear-later"))
        .and(basic_auth("ops", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&target)
        .await;

    let broadcaster = Broadcaster::new(
        &[target.uri()],
        Duration::from_secs(2),
        Some(BasicAuthConfig {
            user: "ops".into(),
            pass: "secret".into(),
        }),
    )
    .unwrap();
    let result = broadcaster
        .broadcast("cluster-a", "clear-later", &json!({"keys": ["k"]}))
        .await
        .unwrap();
    assert_eq!(result.failed_count, 0);
}

#[tokio::test]
async fn test_routes_attach_broadcast_result() {
    let sibling = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broadcast/clear"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&sibling)
        .await;

    let mut cfg = AppConfig::default();
    cfg.redis.mode = RedisMode::Local;
    cfg.broadcast.targets = vec![sibling.uri()];
    let server = ServerBuilder::new().with_config(cfg).build().await.unwrap();
    let app = server.router();

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let client = reqwest::Client::new();

    let body: Value = client
        .delete(format!("{base}/k"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let broadcast = &body["broadcastResult"];
    assert_eq!(broadcast["operation"], "clear");
    assert_eq!(broadcast["data"], json!({"keys": ["k"], "levels": "all"}));
    assert_eq!(broadcast["failedCount"], 0);
    assert_eq!(
        broadcast["responses"][format!("{}/broadcast/clear", sibling.uri())]["status"],
        200
    );

    // Local clears and sets without the flag stay on this cluster.
    let body: Value = client
        .delete(format!("{base}/k?local=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["broadcastResult"], Value::Null);
    let body: Value = client
        .put(format!("{base}/k?millis=1000&data=v"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["broadcastResult"], Value::Null);

    handle.abort();
    server.state().coordinator.shutdown();
}
