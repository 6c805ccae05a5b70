//! End-to-end tests for routing, rewriting, and rate limiting through a real
//! listener.

mod common;

use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use common::{spawn_backend, spawn_proxy, test_chain};
use serde_json::json;
use std::time::Duration;
use vprox::limit::{AutoRule, RateSpec};

fn json_backend() -> Router {
    Router::new().route(
        "/status",
        get(|headers: HeaderMap| async move {
            Json(json!({
                "result": "ok",
                "x_forwarded_host": headers
                    .get("x-forwarded-host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default(),
                "x_request_id": headers
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default(),
            }))
        }),
    )
}

#[tokio::test]
async fn path_rpc_happy_path() {
    let backend = spawn_backend(json_backend()).await;
    let proxy = spawn_proxy(vec![test_chain("127.0.0.1", backend)], |_| {}).await;

    let resp = reqwest::get(proxy.url("/rpc/status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-ratelimit-status"], "ok");
    let request_id = resp.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(request_id.starts_with("req-"));

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["result"], "ok");
    // forwarding headers reached the backend, same correlation id included
    assert_eq!(body["x_forwarded_host"], "127.0.0.1");
    assert_eq!(body["x_request_id"], request_id);
}

#[tokio::test]
async fn inbound_request_id_is_echoed_verbatim() {
    let backend = spawn_backend(json_backend()).await;
    let proxy = spawn_proxy(vec![test_chain("127.0.0.1", backend)], |_| {}).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(proxy.url("/rpc/status"))
        .header("x-request-id", "trace-42.a:b/c")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "trace-42.a:b/c");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["x_request_id"], "trace-42.a:b/c");
}

#[tokio::test]
async fn unknown_host_is_bad_request() {
    let backend = spawn_backend(json_backend()).await;
    let mut chain = test_chain("chain.example", backend);
    chain.ip = backend.ip().to_string();
    let proxy = spawn_proxy(vec![chain], |_| {}).await;

    // Host header is 127.0.0.1, which no chain claims
    let resp = reqwest::get(proxy.url("/rpc/status")).await.unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn disabled_service_is_not_found() {
    let backend = spawn_backend(json_backend()).await;
    let mut chain = test_chain("127.0.0.1", backend);
    chain.services.grpc = false;
    let proxy = spawn_proxy(vec![chain], |_| {}).await;

    let resp = reqwest::get(proxy.url("/grpc/anything")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
    let backend = spawn_backend(json_backend()).await;
    let mut chain = test_chain("127.0.0.1", backend);
    // a port nothing listens on
    chain.ports.rpc = 1;
    let proxy = spawn_proxy(vec![chain], |_| {}).await;

    let resp = reqwest::get(proxy.url("/rpc/status")).await.unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn vhost_rpc_index_is_rewritten_with_banner() {
    let html_backend = Router::new().route(
        "/",
        get(|| async {
            (
                [("content-type", "text/html")],
                "<html><body><a href=\"/rpc/status\">status</a></body></html>",
            )
                .into_response()
        }),
    );
    let backend = spawn_backend(html_backend).await;

    let mut chain = test_chain("chain.example", backend);
    chain.features.inject_rpc_index = true;
    chain.message.rpc_msg = "scheduled maintenance".into();
    chain.validate().unwrap();
    let proxy = spawn_proxy(vec![chain], |_| {}).await;

    // reach the proxy through the rpc vhost name
    let client = reqwest::Client::builder()
        .resolve("rpc.chain.example", proxy.addr)
        .build()
        .unwrap();
    let resp = client
        .get(format!("http://rpc.chain.example:{}/", proxy.addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-ratelimit-status"], "ok");
    assert!(!resp.headers().contains_key("content-encoding"));

    let body = resp.text().await.unwrap();
    assert!(body.contains("<a href=\"/status\">"), "body: {body}");
    assert!(!body.contains("/rpc/status"));
    assert!(body.contains("<div class=\"banner\">\nscheduled maintenance\n</div>"));
}

#[tokio::test]
async fn default_mode_drop_limits_to_burst() {
    let backend = spawn_backend(json_backend()).await;
    let proxy = spawn_proxy(vec![test_chain("127.0.0.1", backend)], |s| {
        s.defaults = RateSpec {
            rps: 1.0,
            burst: 1,
        };
    })
    .await;

    let client = reqwest::Client::new();
    let mut statuses = Vec::new();
    let mut limited_headers = Vec::new();
    for _ in 0..3 {
        let resp = client.get(proxy.url("/rpc/status")).send().await.unwrap();
        statuses.push(resp.status().as_u16());
        if resp.status() == 429 {
            limited_headers.push((
                resp.headers()["retry-after"].to_str().unwrap().to_string(),
                resp.headers()["x-ratelimit-status"]
                    .to_str()
                    .unwrap()
                    .to_string(),
            ));
        } else {
            assert_eq!(resp.headers()["x-ratelimit-status"], "ok");
        }
    }
    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == 429).count(), 2);
    for (retry_after, status) in limited_headers {
        assert_eq!(retry_after, "1");
        assert_eq!(status, "blocked");
    }

    let audit = proxy.audit_lines();
    assert_eq!(audit.len(), 2);
    for line in audit {
        assert_eq!(line["event"], "429");
        assert_eq!(line["reason"], "429");
        assert_eq!(line["ip"], "127.0.0.1");
    }
}

#[tokio::test]
async fn manual_override_enforces_strictly() {
    let backend = spawn_backend(json_backend()).await;
    let proxy = spawn_proxy(vec![test_chain("127.0.0.1", backend)], |_| {}).await;

    proxy
        .limiter
        .set_override("127.0.0.1", RateSpec { rps: 1.0, burst: 1 })
        .unwrap();

    let client = reqwest::Client::new();
    let first = client.get(proxy.url("/rpc/status")).send().await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers()["x-ratelimit-status"], "limited");

    let second = client.get(proxy.url("/rpc/status")).send().await.unwrap();
    assert_eq!(second.status(), 429);
    assert_eq!(
        second.headers()["x-ratelimit-policy"],
        "ip=127.0.0.1; rps=1; burst=1"
    );

    proxy.limiter.delete_override("127.0.0.1");
    let third = client.get(proxy.url("/rpc/status")).send().await.unwrap();
    assert_eq!(third.status(), 200);
    assert_eq!(third.headers()["x-ratelimit-status"], "ok");
}

#[tokio::test]
async fn auto_quarantine_trips_and_expires() {
    let backend = spawn_backend(json_backend()).await;
    let proxy = spawn_proxy(vec![test_chain("127.0.0.1", backend)], |s| {
        s.auto_rule = Some(AutoRule {
            threshold: 3,
            window: Duration::from_secs(10),
            penalty: RateSpec { rps: 1.0, burst: 1 },
            ttl: Duration::from_millis(300),
        });
    })
    .await;

    let client = reqwest::Client::new();
    // the third request trips the quarantine before enforcement and consumes
    // the penalty bucket's only token
    for expected in ["ok", "ok", "limited"] {
        let resp = client.get(proxy.url("/rpc/status")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-ratelimit-status"], expected);
    }

    let blocked = client.get(proxy.url("/rpc/status")).send().await.unwrap();
    assert_eq!(blocked.status(), 429);
    assert_eq!(
        blocked.headers()["x-ratelimit-policy"],
        "ip=127.0.0.1; rps=1; burst=1"
    );

    // past the TTL the override is lifted before enforcement
    tokio::time::sleep(Duration::from_millis(400)).await;
    let probe = client.get(proxy.url("/rpc/status")).send().await.unwrap();
    assert_eq!(probe.status(), 200);
    assert_eq!(probe.headers()["x-ratelimit-status"], "ok");

    let events: Vec<String> = proxy
        .audit_lines()
        .iter()
        .map(|l| l["event"].as_str().unwrap().to_string())
        .collect();
    assert!(events.contains(&"auto-override-add".to_string()));
    assert!(events.contains(&"auto-override-expire".to_string()));
}

#[tokio::test]
async fn access_log_and_counters_are_written() {
    let backend = spawn_backend(json_backend()).await;
    let proxy = spawn_proxy(vec![test_chain("127.0.0.1", backend)], |_| {}).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        client
            .get(proxy.url("/rpc/status"))
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap();
    }
    // access records flush synchronously before the response is returned
    let log = std::fs::read_to_string(proxy.dir.path().join("main.log")).unwrap();
    let access_lines: Vec<_> = log.lines().filter(|l| l.contains("module=access")).collect();
    assert_eq!(access_lines.len(), 2);
    assert!(access_lines[0].contains("route=rpc"));
    assert!(access_lines[0].contains("proxied=true"));
    assert!(access_lines[0].contains("status=ok"));
    assert!(access_lines[1].contains("src_count=2"));

    let counts: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(proxy.dir.path().join("access-counts.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(counts["127.0.0.1"], 2);
}
