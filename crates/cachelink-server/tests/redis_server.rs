//! Two instances of one cluster sharing a real Redis node.
//!
//! Needs a Docker daemon: `cargo test -p cachelink-server -- --ignored`

use std::time::Duration;

use cachelink_server::config::RedisMode;
use cachelink_server::{AppConfig, CachelinkServer, ServerBuilder};
use serde_json::{Value, json};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;

async fn serve(server: &CachelinkServer) -> String {
    server.start_background().await.expect("background tasks");
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = server.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    base
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_clear_now_reaches_every_instance() {
    let container = Redis::default().start().await.expect("start redis");
    let port = container.get_host_port_ipv4(6379).await.expect("port");

    let mut cfg = AppConfig::default();
    cfg.redis.mode = RedisMode::Single;
    cfg.redis.nodes = vec![format!("redis://127.0.0.1:{port}")];
    cfg.redis.prefix = "it:".into();
    cfg.coordinator.cron_enabled = false;

    let a = ServerBuilder::new().with_config(cfg.clone()).build().await.unwrap();
    let b = ServerBuilder::new().with_config(cfg).build().await.unwrap();
    let (base_a, base_b) = (serve(&a).await, serve(&b).await);
    let client = reqwest::Client::new();

    let resp = client
        .put(format!("{base_a}/report?minutes=5"))
        .json(&json!({"data": {"rows": 3}, "assoc": ["customer:1"]}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let body: Value = client
        .get(format!("{base_b}/clear-later/customer:1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["added"], 1);

    let body: Value = client
        .get(format!("{base_a}/clear-now"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["started"], 1);

    let mut cleared = false;
    for _ in 0..50 {
        let value: Value = client
            .get(format!("{base_b}/report"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if value.is_null() {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cleared, "report should be cleared through its association");

    a.state().coordinator.shutdown();
    b.state().coordinator.shutdown();
}
