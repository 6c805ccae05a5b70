//! IP-aware rate limiting middleware with per-IP overrides.
//!
//! Every source IP gets a lazily created token bucket sized by the defaults
//! or by its active override. IPs under an override are enforced strictly
//! (non-blocking check, 429 on deny); defaults either drop the same way or
//! smooth by waiting for a token. An optional auto-quarantine rule counts
//! strikes in a sliding window and installs a TTL-bounded penalty override
//! when the threshold is crossed.

pub mod audit;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::geo::GeoDb;
use crate::observability::request_id::{self, REQUEST_ID_HEADER};
use crate::observability::{f, Logger};
use audit::{is_important, AuditRecord, AuditSink};

/// A requests-per-second budget and a burst size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSpec {
    pub rps: f64,
    pub burst: u32,
}

/// Automatic IP quarantine: `threshold` strikes within `window` installs
/// `penalty` as an override for `ttl`.
#[derive(Debug, Clone, Copy)]
pub struct AutoRule {
    pub threshold: u32,
    pub window: Duration,
    pub penalty: RateSpec,
    pub ttl: Duration,
}

/// The limiter's verdict, carried through request extensions for the access
/// log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStatus {
    Ok,
    Limited,
    Blocked,
}

impl LimitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitStatus::Ok => "ok",
            LimitStatus::Limited => "limited",
            LimitStatus::Blocked => "blocked",
        }
    }
}

/// Read the limiter verdict off a request; defaults to `ok`.
pub fn status_of(extensions: &axum::http::Extensions) -> LimitStatus {
    extensions
        .get::<LimitStatus>()
        .copied()
        .unwrap_or(LimitStatus::Ok)
}

/// Construction-time knobs for [`IpLimiter`].
pub struct LimiterSettings {
    pub defaults: RateSpec,
    /// Prefer CF-Connecting-IP / Forwarded / X-Forwarded-For.
    pub trust_proxy: bool,
    /// Explicit client-IP header (e.g. "X-Real-IP"), checked before the
    /// generic proxy headers.
    pub ip_header: Option<String>,
    /// Defaults enforce 429 on overflow instead of smoothing.
    pub enforce_defaults: bool,
    pub auto_rule: Option<AutoRule>,
    /// Sampled "allow" audit events, at most one per IP per interval.
    pub allow_log_every: Option<Duration>,
    /// Keep only 429/auto-add/auto-expire/wait-canceled in the JSONL sink.
    pub important_only: bool,
    /// Mirror important events into the main log.
    pub mirror_main: bool,
    pub audit_path: PathBuf,
}

#[derive(Default)]
struct StrikeState {
    count: u32,
    window_end: Option<Instant>,
}

/// Request fields captured before the request is handed downstream, for
/// audit records emitted at any later point.
#[derive(Debug, Clone)]
struct RequestMeta {
    method: String,
    path: String,
    host: String,
    ua: String,
    request_id: String,
    cf_country: Option<String>,
}

impl RequestMeta {
    fn capture(req: &Request<Body>, request_id: &str) -> Self {
        let headers = req.headers();
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            host: header_str(headers, "host").unwrap_or_default().to_string(),
            ua: header_str(headers, "user-agent")
                .unwrap_or_default()
                .to_string(),
            request_id: request_id.to_string(),
            cf_country: header_str(headers, "cf-ipcountry")
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim().to_string()),
        }
    }
}

pub struct IpLimiter {
    defaults: RateSpec,
    overrides: DashMap<String, RateSpec>,
    pool: DashMap<String, Arc<DefaultDirectRateLimiter>>,

    auto_rule: Option<AutoRule>,
    strikes: DashMap<String, StrikeState>,
    auto_expiry: DashMap<String, Instant>,

    allow_log_every: Option<Duration>,
    last_allow_log: DashMap<String, Instant>,

    trust_proxy: bool,
    ip_header: Option<String>,
    enforce_defaults: bool,
    mirror_main: bool,

    audit: AuditSink,
    logger: Arc<Logger>,
    geo: Arc<GeoDb>,
}

impl IpLimiter {
    pub fn new(settings: LimiterSettings, logger: Arc<Logger>, geo: Arc<GeoDb>) -> Self {
        let audit = AuditSink::open(&settings.audit_path, settings.important_only);
        Self {
            defaults: settings.defaults,
            overrides: DashMap::new(),
            pool: DashMap::new(),
            auto_rule: settings.auto_rule,
            strikes: DashMap::new(),
            auto_expiry: DashMap::new(),
            allow_log_every: settings.allow_log_every,
            last_allow_log: DashMap::new(),
            trust_proxy: settings.trust_proxy,
            ip_header: settings.ip_header,
            enforce_defaults: settings.enforce_defaults,
            mirror_main: settings.mirror_main,
            audit,
            logger,
            geo,
        }
    }

    /// Install or replace a per-IP override; the cached bucket is rebuilt on
    /// next use.
    pub fn set_override(&self, ip: &str, spec: RateSpec) -> anyhow::Result<()> {
        if ip.parse::<IpAddr>().is_err() {
            anyhow::bail!("invalid ip: {ip:?}");
        }
        self.overrides.insert(ip.to_string(), spec);
        self.pool.remove(ip);
        Ok(())
    }

    /// Remove a per-IP override; the IP falls back to the defaults.
    pub fn delete_override(&self, ip: &str) {
        self.overrides.remove(ip);
        self.pool.remove(ip);
    }

    pub fn has_override(&self, ip: &str) -> bool {
        self.overrides.contains_key(ip)
    }

    pub fn close(&self) {
        self.audit.close();
    }

    fn active_spec(&self, ip: &str) -> RateSpec {
        self.overrides
            .get(ip)
            .map(|s| *s)
            .unwrap_or(self.defaults)
    }

    fn bucket_for(&self, ip: &str) -> Arc<DefaultDirectRateLimiter> {
        if let Some(lim) = self.pool.get(ip) {
            return lim.clone();
        }
        let spec = self.active_spec(ip);
        let lim = Arc::new(RateLimiter::direct(quota_for(&spec)));
        self.pool.entry(ip.to_string()).or_insert(lim).clone()
    }

    /// Resolve the client IP per the configured trust policy.
    pub fn client_ip(&self, headers: &HeaderMap, remote: SocketAddr) -> String {
        if self.trust_proxy {
            if let Some(v) = header_str(headers, "cf-connecting-ip") {
                if let Some(ip) = parse_first_ip(v) {
                    return ip;
                }
            }
        }
        if let Some(name) = &self.ip_header {
            if let Some(v) = header_str(headers, name) {
                if let Some(ip) = parse_first_ip(v) {
                    return ip;
                }
            }
        }
        if self.trust_proxy {
            if let Some(v) = header_str(headers, "forwarded") {
                if let Some(ip) = forwarded_for_ip(v) {
                    return ip;
                }
            }
            if let Some(v) = header_str(headers, "x-forwarded-for") {
                if let Some(first) = v.split(',').next() {
                    if let Some(ip) = parse_first_ip(first) {
                        return ip;
                    }
                }
            }
        }
        remote.ip().to_string()
    }

    fn policy_string(&self, ip: &str) -> String {
        let spec = self.active_spec(ip);
        format!(
            "ip={ip}; rps={}; burst={}",
            format_rps(spec.rps),
            spec.burst
        )
    }

    fn too_many_requests(&self, ip: &str, body: &'static str) -> Response {
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        let headers = resp.headers_mut();
        headers.insert("retry-after", HeaderValue::from_static("1"));
        if let Ok(policy) = HeaderValue::from_str(&self.policy_string(ip)) {
            headers.insert("x-ratelimit-policy", policy);
        }
        headers.insert("x-ratelimit-status", HeaderValue::from_static("blocked"));
        resp
    }

    // --- auto-quarantine ---

    fn auto_maybe_flag(&self, ip: &str, meta: &RequestMeta) {
        let Some(rule) = self.auto_rule else {
            return;
        };
        if ip.is_empty() {
            return;
        }
        let now = Instant::now();
        let tripped = {
            let mut entry = self.strikes.entry(ip.to_string()).or_default();
            let state = entry.value_mut();
            let window_open = matches!(state.window_end, Some(end) if now <= end);
            if !window_open {
                state.window_end = Some(now + rule.window);
                state.count = 0;
            }
            state.count += 1;
            if state.count >= rule.threshold {
                // fresh window after quarantine
                state.count = 0;
                state.window_end = Some(now + rule.window);
                true
            } else {
                false
            }
        };
        if tripped {
            let _ = self.set_override(ip, rule.penalty);
            self.auto_expiry.insert(ip.to_string(), now + rule.ttl);
            self.log_event(ip, meta, "auto-override-add");
        }
    }

    fn auto_maybe_expire(&self, ip: &str, meta: &RequestMeta) {
        if self.auto_rule.is_none() || ip.is_empty() {
            return;
        }
        let expired = self
            .auto_expiry
            .get(ip)
            .map(|exp| Instant::now() > *exp)
            .unwrap_or(false);
        if expired {
            self.delete_override(ip);
            self.auto_expiry.remove(ip);
            self.log_event(ip, meta, "auto-override-expire");
        }
    }

    // --- audit ---

    fn maybe_log_allow(&self, ip: &str, meta: &RequestMeta) {
        let Some(every) = self.allow_log_every else {
            return;
        };
        let now = Instant::now();
        if let Some(last) = self.last_allow_log.get(ip) {
            if now.duration_since(*last) < every {
                return;
            }
        }
        self.last_allow_log.insert(ip.to_string(), now);
        self.log_event(ip, meta, "allow-sample");
    }

    fn log_event(&self, ip: &str, meta: &RequestMeta, event: &str) {
        if !self.audit.should_log(event) {
            return;
        }
        let country = meta
            .cf_country
            .clone()
            .unwrap_or_else(|| self.geo.country(ip));
        let asn = self.geo.asn(ip);
        let spec = self.active_spec(ip);

        self.audit.record(&AuditRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            ip: ip.to_string(),
            country: country.clone(),
            asn: asn.clone(),
            method: meta.method.clone(),
            path: meta.path.clone(),
            host: meta.host.clone(),
            user_agent: meta.ua.clone(),
            ua: meta.ua.clone(),
            event: event.to_string(),
            reason: event.to_string(),
            rps: spec.rps,
            burst: spec.burst,
            request_id: meta.request_id.clone(),
        });

        if self.mirror_main && is_important(event) {
            self.logger.print(
                "WARN",
                "rate",
                event,
                &[
                    f("ip", ip),
                    f("country", &country),
                    f("asn", &asn),
                    f("rps", spec.rps),
                    f("burst", spec.burst),
                    f("path", &meta.path),
                    f("host", &meta.host),
                    f("ua", &meta.ua),
                    f("request_id", &meta.request_id),
                ],
            );
        }
    }
}

/// Records a `wait-canceled` audit event when the smoothing wait is dropped
/// before a token arrived (the client went away mid-wait).
struct WaitCancelGuard<'a> {
    limiter: &'a IpLimiter,
    ip: String,
    meta: RequestMeta,
    armed: bool,
}

impl Drop for WaitCancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter
                .log_event(&self.ip, &self.meta, "wait-canceled");
        }
    }
}

/// Axum middleware wrapping every route with IP rate limiting and
/// auto-quarantine. Also pins the request id so downstream handlers and the
/// audit sink agree on it.
pub async fn middleware(
    State(limiter): State<Arc<IpLimiter>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id::ensure(req.headers());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let ip = limiter.client_ip(req.headers(), remote);
    let meta = RequestMeta::capture(&req, &request_id);

    limiter.auto_maybe_expire(&ip, &meta);
    limiter.auto_maybe_flag(&ip, &meta);

    let bucket = limiter.bucket_for(&ip);

    // Strict mode for overrides (manual or auto): non-blocking check, 429 on
    // deny.
    if limiter.has_override(&ip) {
        if bucket.check().is_err() {
            limiter.log_event(&ip, &meta, "429");
            return limiter.too_many_requests(&ip, "rate limit exceeded\n");
        }
        req.extensions_mut().insert(LimitStatus::Limited);
        let mut resp = next.run(req).await;
        resp.headers_mut()
            .insert("x-ratelimit-status", HeaderValue::from_static("limited"));
        limiter.maybe_log_allow(&ip, &meta);
        return resp;
    }

    if limiter.enforce_defaults {
        if bucket.check().is_err() {
            limiter.log_event(&ip, &meta, "429");
            return limiter.too_many_requests(&ip, "rate limit exceeded\n");
        }
        req.extensions_mut().insert(LimitStatus::Ok);
        let mut resp = next.run(req).await;
        resp.headers_mut()
            .insert("x-ratelimit-status", HeaderValue::from_static("ok"));
        limiter.maybe_log_allow(&ip, &meta);
        return resp;
    }

    // Smoothing mode: wait for a token, bounded by the client's patience.
    {
        let mut guard = WaitCancelGuard {
            limiter: limiter.as_ref(),
            ip: ip.clone(),
            meta: meta.clone(),
            armed: true,
        };
        bucket.until_ready().await;
        guard.armed = false;
    }
    req.extensions_mut().insert(LimitStatus::Ok);
    let mut resp = next.run(req).await;
    resp.headers_mut()
        .insert("x-ratelimit-status", HeaderValue::from_static("ok"));
    limiter.maybe_log_allow(&ip, &meta);
    resp
}

fn quota_for(spec: &RateSpec) -> Quota {
    let burst = NonZeroU32::new(spec.burst.max(1)).expect("burst clamped to >= 1");
    let quota = if spec.rps > 0.0 {
        Quota::with_period(Duration::from_secs_f64(1.0 / spec.rps))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(u32::MAX).expect("nonzero")))
    } else {
        // zero rps: the bucket never refills within any realistic session
        Quota::with_period(Duration::from_secs(u64::from(u32::MAX))).expect("nonzero period")
    };
    quota.allow_burst(burst)
}

fn format_rps(rps: f64) -> String {
    let s = format!("{rps:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_first_ip(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Some(sa.ip().to_string());
    }
    None
}

fn forwarded_for_ip(header: &str) -> Option<String> {
    for seg in header.split([';', ',']) {
        let Some((key, value)) = seg.trim().split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("for") {
            continue;
        }
        let value = value.trim().trim_matches('"');
        if let Some(ip) = parse_first_ip(value) {
            return Some(ip);
        }
        let stripped = value.trim_start_matches('[').trim_end_matches(']');
        if let Some(ip) = parse_first_ip(stripped) {
            return Some(ip);
        }
    }
    None
}
