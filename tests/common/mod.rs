//! Shared fixtures for integration tests: an in-process vProx instance plus
//! mock backends on ephemeral ports.

use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

use vprox::config::{ChainConfig, Ports};
use vprox::geo::GeoDb;
use vprox::limit::{self, IpLimiter, LimiterSettings, RateSpec};
use vprox::observability::{AccessCounters, Logger};
use vprox::proxy::{build_client, proxy_handler, ws_handler, AppState};
use vprox::registry::HostRegistry;

pub struct TestProxy {
    pub addr: SocketAddr,
    pub limiter: Arc<IpLimiter>,
    pub dir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn audit_lines(&self) -> Vec<serde_json::Value> {
        let path = self.dir.path().join("rate-limit.jsonl");
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .lines()
            .map(|l| serde_json::from_str(l).expect("audit line is JSON"))
            .collect()
    }
}

pub fn default_ports() -> Ports {
    Ports {
        rpc: 26657,
        rest: 1317,
        grpc: 9090,
        grpc_web: 9091,
        api: 1317,
    }
}

/// A path+vhost chain pointing every service at `backend`.
pub fn test_chain(host: &str, backend: SocketAddr) -> ChainConfig {
    let mut c = ChainConfig {
        chain_name: "testchain".into(),
        host: host.into(),
        ip: backend.ip().to_string(),
        ..Default::default()
    };
    c.services.rpc = true;
    c.services.rest = true;
    c.expose.path = true;
    c.expose.vhost = true;
    c.ports.rpc = backend.port();
    c.ports.rest = backend.port();
    c.validate().expect("test chain config is valid");
    c
}

/// Spin up a vProx instance wired exactly like the binary.
pub async fn spawn_proxy(
    chains: Vec<ChainConfig>,
    tweak: impl FnOnce(&mut LimiterSettings),
) -> TestProxy {
    let dir = tempfile::tempdir().unwrap();
    let logger = Arc::new(
        Logger::open(
            dir.path().join("main.log"),
            false,
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        )
        .unwrap(),
    );
    let geo = Arc::new(GeoDb::open());

    let mut settings = LimiterSettings {
        defaults: RateSpec {
            rps: 1000.0,
            burst: 1000,
        },
        trust_proxy: true,
        ip_header: None,
        enforce_defaults: true,
        auto_rule: None,
        allow_log_every: None,
        important_only: true,
        mirror_main: false,
        audit_path: dir.path().join("rate-limit.jsonl"),
    };
    tweak(&mut settings);
    let limiter = Arc::new(IpLimiter::new(settings, logger.clone(), geo.clone()));

    let registry = Arc::new(HostRegistry::build(chains, default_ports()).unwrap());
    let state = AppState {
        registry,
        limiter: limiter.clone(),
        logger,
        counters: Arc::new(AccessCounters::load(dir.path().join("access-counts.json"))),
        geo,
        client: build_client().unwrap(),
        config_dir: dir.path().join("config"),
    };

    let app = Router::new()
        .route("/websocket", any(ws_handler))
        .fallback(any(proxy_handler))
        .layer(axum::middleware::from_fn_with_state(
            limiter.clone(),
            limit::middleware,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    // the listener is bound before spawn, so requests can go out immediately
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestProxy { addr, limiter, dir }
}

/// Serve an axum router as a mock backend on an ephemeral port.
#[allow(dead_code)]
pub async fn spawn_backend(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
