//! The HTTP proxy core: route the request, forward it upstream, and either
//! stream the response through untouched or buffer-modify HTML bodies.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ChainConfig;
use crate::error::VproxError;
use crate::geo::GeoDb;
use crate::limit::{self, IpLimiter, LimitStatus};
use crate::observability::request_id::REQUEST_ID_HEADER;
use crate::observability::{AccessCounters, AccessRecord, Logger};
use crate::registry::{normalize_host, HostRegistry, RewriteScope};

use super::rewrite;

/// Shared state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<HostRegistry>,
    pub limiter: Arc<IpLimiter>,
    pub logger: Arc<Logger>,
    pub counters: Arc<AccessCounters>,
    pub geo: Arc<GeoDb>,
    pub client: reqwest::Client,
    pub config_dir: PathBuf,
}

/// Upstream HTTP client: one pool for every backend.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
}

/// Request fields captured on entry, consumed by the access log after the
/// response is written.
#[derive(Debug, Clone)]
pub(crate) struct AccessMeta {
    pub request_id: String,
    pub host: String,
    pub method: String,
    pub request: String,
    pub ip: String,
    pub ua: String,
    pub cf_country: Option<String>,
    pub status: LimitStatus,
}

impl AccessMeta {
    pub(crate) fn capture(state: &AppState, remote: SocketAddr, req: &Request<Body>) -> Self {
        let headers = req.headers();
        let request = req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        Self {
            request_id: crate::observability::request_id::ensure(headers),
            host: normalize_host(
                headers
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default(),
            ),
            method: req.method().to_string(),
            request,
            ip: state.limiter.client_ip(headers, remote),
            ua: headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            cf_country: headers
                .get("cf-ipcountry")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from),
            status: limit::status_of(req.extensions()),
        }
    }
}

/// Emit the single per-request access record (and the chain's copy).
pub(crate) fn log_access(
    state: &AppState,
    meta: &AccessMeta,
    chain: Option<&ChainConfig>,
    event: &'static str,
    route: &'static str,
    proxied: bool,
    start: Instant,
) {
    let src_count = state.counters.record(&meta.ip);
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mut country = meta
        .cf_country
        .clone()
        .unwrap_or_else(|| state.geo.country(&meta.ip));
    if country.is_empty() {
        country = "--".to_string();
    }
    let chain_log = chain
        .map(|c| c.logging.file.trim())
        .filter(|f| !f.is_empty());
    state.logger.access(
        &AccessRecord {
            event,
            request_id: meta.request_id.clone(),
            host: meta.host.clone(),
            route,
            proxied,
            request: meta.request.clone(),
            method: meta.method.clone(),
            ip: meta.ip.clone(),
            src_count,
            latency_ms,
            ua: meta.ua.clone(),
            country,
            status: meta.status.as_str(),
        },
        chain_log,
    );
}

pub(crate) fn error_response(err: VproxError, request_id: &str) -> Response {
    let mut resp = err.into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

/// Headers that must not be forwarded verbatim in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Catch-all proxy handler for every non-WebSocket route.
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let start = Instant::now();
    let meta = AccessMeta::capture(&state, remote, &req);

    let Some(chain) = state.registry.resolve(&meta.host) else {
        let resp = error_response(VproxError::UnknownHost, &meta.request_id);
        log_access(&state, &meta, None, "request", "direct", false, start);
        return resp;
    };

    let path = req.uri().path().to_string();
    let Some(plan) = state.registry.plan_route(&chain, &meta.host, &path) else {
        let resp = error_response(VproxError::ServiceDisabled, &meta.request_id);
        log_access(&state, &meta, Some(&chain), "request", "direct", false, start);
        return resp;
    };

    let mut target = plan.target.clone();
    if let Some(query) = req.uri().query() {
        target.push('?');
        target.push_str(query);
    }

    debug!(request_id = %meta.request_id, target = %target, "forwarding request");

    // absolute-link inputs must outlive the request we are about to consume
    let x_forwarded_host = header_value(&req, "x-forwarded-host");
    let referer = header_value(&req, "referer");

    let Some(upstream) = build_upstream(&state, &meta, req, &target) else {
        let resp = error_response(VproxError::RequestBuild, &meta.request_id);
        log_access(&state, &meta, Some(&chain), "request", plan.route, false, start);
        return resp;
    };

    let upstream_resp = match upstream.send().await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(request_id = %meta.request_id, error = %e, "upstream request failed");
            let resp = error_response(VproxError::Upstream(e), &meta.request_id);
            log_access(&state, &meta, Some(&chain), "request", plan.route, false, start);
            return resp;
        }
    };

    let status = upstream_resp.status();
    let ctype = upstream_resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let will_modify = plan.inject && ctype.starts_with("text/html");

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in upstream_resp.headers() {
        let lname = name.as_str();
        // framing is regenerated by the proxy
        if lname == "content-length" || is_hop_by_hop(lname) {
            continue;
        }
        // a modified body is re-serialized as plain HTML
        if will_modify && lname == "content-encoding" {
            continue;
        }
        builder = builder.header(lname, value.as_bytes());
    }
    builder = builder.header(REQUEST_ID_HEADER, &meta.request_id);

    if !will_modify {
        let body = Body::from_stream(upstream_resp.bytes_stream());
        let resp = builder
            .body(body)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        log_access(&state, &meta, Some(&chain), "request", plan.route, true, start);
        return resp;
    }

    // Buffered modification path: decompress if needed, rewrite, inject.
    let gzipped = upstream_resp
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);

    let raw = match upstream_resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            debug!(request_id = %meta.request_id, error = %e, "upstream body read failed");
            let resp = error_response(VproxError::Upstream(e), &meta.request_id);
            log_access(&state, &meta, Some(&chain), "request", plan.route, false, start);
            return resp;
        }
    };

    let decoded = if gzipped {
        match rewrite::decode_gzip(&raw) {
            Ok(d) => d,
            Err(e) => {
                let resp = error_response(VproxError::Gzip(e), &meta.request_id);
                log_access(&state, &meta, Some(&chain), "request", plan.route, false, start);
                return resp;
            }
        }
    } else {
        raw.to_vec()
    };

    let scope = plan.scope.unwrap_or(RewriteScope::Rest);
    let abs_host = rewrite::absolute_host(
        &chain.features.absolute_links,
        &meta.host,
        &x_forwarded_host,
        &referer,
    )
    .map(String::from);

    let mut html = String::from_utf8_lossy(&decoded).into_owned();
    html = rewrite::rewrite_links(
        &html,
        scope,
        &chain.ip,
        &chain.host,
        abs_host.as_deref(),
        plan.rpc_vhost,
    );
    html = apply_banner(&state, &chain, scope, html);

    let resp = builder
        .body(Body::from(html))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    log_access(&state, &meta, Some(&chain), "request", plan.route, true, start);
    resp
}

/// Inline banner from config wins; the disk file is the fallback.
fn apply_banner(state: &AppState, chain: &ChainConfig, scope: RewriteScope, html: String) -> String {
    let inline = match scope {
        RewriteScope::Rpc => chain.message.rpc_msg.as_str(),
        RewriteScope::Rest | RewriteScope::Api => chain.message.api_msg.as_str(),
    };
    if !inline.trim().is_empty() {
        return rewrite::inject_banner(&html, inline);
    }
    let path = rewrite::banner_path(&state.config_dir, &chain.chain_name, scope);
    match std::fs::read_to_string(&path) {
        Ok(banner) => rewrite::inject_banner(&html, &banner),
        Err(_) => html,
    }
}

fn header_value(req: &Request<Body>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Build the upstream request: method/body/query preserved, headers cloned
/// with hop-by-hop and framing headers dropped, forwarding headers set.
fn build_upstream(
    state: &AppState,
    meta: &AccessMeta,
    req: Request<Body>,
    target: &str,
) -> Option<reqwest::RequestBuilder> {
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes()).ok()?;

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        let lname = name.as_str();
        if lname == "host" || lname == "content-length" || is_hop_by_hop(lname) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(lname.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(n, v);
        }
    }
    headers.insert(
        "x-forwarded-host",
        reqwest::header::HeaderValue::from_str(&meta.host).ok()?,
    );
    if !headers.contains_key("x-forwarded-for") {
        if let Ok(v) = reqwest::header::HeaderValue::from_str(&meta.ip) {
            headers.insert("x-forwarded-for", v);
        }
    }
    headers.insert(
        REQUEST_ID_HEADER,
        reqwest::header::HeaderValue::from_str(&meta.request_id).ok()?,
    );

    let has_body = match req.headers().get("content-length") {
        Some(v) => v.to_str().ok().and_then(|s| s.parse::<u64>().ok()) != Some(0),
        None => req.headers().contains_key("transfer-encoding"),
    };

    let mut builder = state.client.request(method, target).headers(headers);
    if has_body {
        let stream = req.into_body().into_data_stream();
        builder = builder.body(reqwest::Body::wrap_stream(stream));
    }
    Some(builder)
}
