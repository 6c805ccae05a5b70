//! The `/websocket` bridge: upgrade the client, dial the chain's RPC
//! websocket endpoint, and pump frames both ways until one side gives up.
//!
//! Each direction refreshes its idle deadline on every frame (pongs
//! included). An optional hard lifetime closes both peers with a normal
//! close. The first pump to finish decides the session's close cause.

use axum::{
    body::Body,
    extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TgCloseFrame;
use tokio_tungstenite::tungstenite::Message as TgMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::ChainConfig;
use crate::error::VproxError;
use crate::observability::f;
use crate::observability::request_id::REQUEST_ID_HEADER;

use super::engine::{error_response, log_access, AccessMeta, AppState};

const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
const CLOSE_NORMAL: u16 = 1000;
/// How long a surviving pump gets to observe the close after its peer ends.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<WebSocket, Message>;
type BackendSink = SplitSink<BackendStream, TgMessage>;

enum PumpEnd {
    IdleTimeout,
    Closed,
    Error,
}

impl PumpEnd {
    fn cause(&self) -> &'static str {
        match self {
            PumpEnd::IdleTimeout => "idle_timeout",
            PumpEnd::Closed => "closed",
            PumpEnd::Error => "error",
        }
    }
}

/// Handler for `/websocket`.
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
    req: Request<Body>,
) -> Response {
    let start = Instant::now();
    let meta = AccessMeta::capture(&state, remote, &req);

    let chain = state.registry.resolve(&meta.host);
    let enabled = chain
        .as_ref()
        .map(|c| c.services.websocket && c.services.rpc)
        .unwrap_or(false);
    if !enabled {
        let resp = error_response(VproxError::WebSocketDisabled, &meta.request_id);
        log_access(&state, &meta, chain.as_deref(), "ws", "ws-deny", false, start);
        return resp;
    }
    let chain = chain.expect("checked above");

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            log_access(&state, &meta, Some(&chain), "ws", "ws-upgrade-fail", false, start);
            return axum::response::IntoResponse::into_response(rejection);
        }
    };

    let eff = state.registry.effective_ports(&chain);
    let backend_url = format!("ws://{}:{}/websocket", chain.ip, eff.rpc);
    let idle = chain.ws.idle_timeout();
    let hard = chain.ws.max_lifetime();

    ws.on_upgrade(move |socket| bridge(state, socket, backend_url, idle, hard, meta, chain, start))
}

#[allow(clippy::too_many_arguments)]
async fn bridge(
    state: AppState,
    mut socket: WebSocket,
    backend_url: String,
    idle: Duration,
    hard: Option<Duration>,
    meta: AccessMeta,
    chain: Arc<ChainConfig>,
    start: Instant,
) {
    let backend = dial_backend(&backend_url, &meta).await;
    let backend = match backend {
        Ok(stream) => stream,
        Err(e) => {
            debug!(backend = %backend_url, error = %e, "websocket backend dial failed");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: Utf8Bytes::from_static("backend unreachable"),
                })))
                .await;
            log_access(
                &state,
                &meta,
                Some(&chain),
                "ws",
                "ws-backend-fail",
                false,
                start,
            );
            return;
        }
    };

    let (c_sink, c_stream) = socket.split();
    let (b_sink, b_stream) = backend.split();
    let c_sink = Arc::new(Mutex::new(c_sink));
    let b_sink = Arc::new(Mutex::new(b_sink));
    let up_bytes = Arc::new(AtomicU64::new(0));
    let down_bytes = Arc::new(AtomicU64::new(0));

    let mut c2b = Box::pin(pump_client_to_backend(
        c_stream,
        b_sink.clone(),
        idle,
        up_bytes.clone(),
    ));
    let mut b2c = Box::pin(pump_backend_to_client(
        b_stream,
        c_sink.clone(),
        idle,
        down_bytes.clone(),
    ));

    let lifetime = async {
        match hard {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(lifetime);

    // First pump to finish decides the cause; the other side is closed and
    // given a moment to drain before everything is dropped.
    let cause: &'static str;
    tokio::select! {
        end = &mut c2b => {
            cause = end.cause();
            close_both(&c_sink, &b_sink).await;
            let _ = timeout(CLOSE_GRACE, &mut b2c).await;
        }
        end = &mut b2c => {
            cause = end.cause();
            close_both(&c_sink, &b_sink).await;
            let _ = timeout(CLOSE_GRACE, &mut c2b).await;
        }
        _ = &mut lifetime => {
            cause = "hard_timeout";
            send_lifetime_close(&c_sink, &b_sink).await;
            let _ = timeout(
                CLOSE_GRACE,
                futures_util::future::join(&mut c2b, &mut b2c),
            )
            .await;
        }
    }

    log_access(&state, &meta, Some(&chain), "ws", "ws", true, start);

    let dur = start.elapsed();
    let up = up_bytes.load(Ordering::Relaxed);
    let down = down_bytes.load(Ordering::Relaxed);
    let total = up + down;
    state.logger.print(
        "INFO",
        "ws",
        "session_closed",
        &[
            f("request_id", &meta.request_id),
            f("backend", &backend_url),
            f("idle_sec", idle.as_secs()),
            f("max_sec", hard.map(|d| d.as_secs()).unwrap_or(0)),
            f("duration", format_duration(dur)),
            f("up_bytes", human_bytes(up)),
            f("down_bytes", human_bytes(down)),
            f("total_bytes", human_bytes(total)),
            f("avg_rate", human_rate(total, dur)),
            f("cause", cause),
        ],
    );
}

async fn dial_backend(
    backend_url: &str,
    meta: &AccessMeta,
) -> Result<BackendStream, tokio_tungstenite::tungstenite::Error> {
    let mut request = backend_url.into_client_request()?;
    let headers = request.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&meta.ip) {
        headers.insert("x-forwarded-for", v);
    }
    if let Ok(v) = HeaderValue::from_str(&meta.host) {
        headers.insert("x-forwarded-host", v);
    }
    if let Ok(v) = HeaderValue::from_str(&meta.request_id) {
        headers.insert(REQUEST_ID_HEADER, v);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

async fn pump_client_to_backend(
    mut stream: SplitStream<WebSocket>,
    sink: Arc<Mutex<BackendSink>>,
    idle: Duration,
    bytes_up: Arc<AtomicU64>,
) -> PumpEnd {
    loop {
        let msg = match timeout(idle, stream.next()).await {
            Err(_) => return PumpEnd::IdleTimeout,
            Ok(None) => return PumpEnd::Closed,
            Ok(Some(Err(_))) => return PumpEnd::Error,
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            Message::Close(frame) => {
                let code = frame.as_ref().map(|f| f.code);
                let _ = sink
                    .lock()
                    .await
                    .send(TgMessage::Close(frame.map(close_to_backend)))
                    .await;
                return classify_close(code);
            }
            // control frames are answered by the stack; any read refreshes
            // the idle deadline
            Message::Ping(_) | Message::Pong(_) => continue,
            data => {
                let n = client_payload_len(&data);
                let send = async { sink.lock().await.send(msg_to_backend(data)).await };
                match timeout(idle, send).await {
                    Err(_) => return PumpEnd::IdleTimeout,
                    Ok(Err(_)) => return PumpEnd::Error,
                    Ok(Ok(())) => {
                        bytes_up.fetch_add(n, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

async fn pump_backend_to_client(
    mut stream: SplitStream<BackendStream>,
    sink: Arc<Mutex<ClientSink>>,
    idle: Duration,
    bytes_down: Arc<AtomicU64>,
) -> PumpEnd {
    use tokio_tungstenite::tungstenite::Error as TgError;
    loop {
        let msg = match timeout(idle, stream.next()).await {
            Err(_) => return PumpEnd::IdleTimeout,
            Ok(None) => return PumpEnd::Closed,
            Ok(Some(Err(TgError::ConnectionClosed | TgError::AlreadyClosed))) => {
                return PumpEnd::Closed
            }
            Ok(Some(Err(_))) => return PumpEnd::Error,
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            TgMessage::Close(frame) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                let _ = sink
                    .lock()
                    .await
                    .send(Message::Close(frame.map(close_to_client)))
                    .await;
                return classify_close(code);
            }
            TgMessage::Ping(_) | TgMessage::Pong(_) | TgMessage::Frame(_) => continue,
            data => {
                let n = backend_payload_len(&data);
                let Some(converted) = msg_to_client(data) else {
                    continue;
                };
                let send = async { sink.lock().await.send(converted).await };
                match timeout(idle, send).await {
                    Err(_) => return PumpEnd::IdleTimeout,
                    Ok(Err(_)) => return PumpEnd::Error,
                    Ok(Ok(())) => {
                        bytes_down.fetch_add(n, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

async fn close_both(c_sink: &Arc<Mutex<ClientSink>>, b_sink: &Arc<Mutex<BackendSink>>) {
    let _ = c_sink.lock().await.close().await;
    let _ = b_sink.lock().await.close().await;
}

async fn send_lifetime_close(c_sink: &Arc<Mutex<ClientSink>>, b_sink: &Arc<Mutex<BackendSink>>) {
    let _ = c_sink
        .lock()
        .await
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: Utf8Bytes::from_static("max lifetime reached"),
        })))
        .await;
    let _ = b_sink
        .lock()
        .await
        .send(TgMessage::Close(Some(TgCloseFrame {
            code: CLOSE_NORMAL.into(),
            reason: "max lifetime reached".into(),
        })))
        .await;
    close_both(c_sink, b_sink).await;
}

fn classify_close(code: Option<u16>) -> PumpEnd {
    match code {
        // normal / going away / no status / abnormal
        None | Some(1000) | Some(1001) | Some(1005) | Some(1006) => PumpEnd::Closed,
        Some(_) => PumpEnd::Error,
    }
}

fn msg_to_backend(msg: Message) -> TgMessage {
    match msg {
        Message::Text(t) => TgMessage::Text(t.as_str().into()),
        Message::Binary(b) => TgMessage::Binary(b),
        Message::Ping(p) => TgMessage::Ping(p),
        Message::Pong(p) => TgMessage::Pong(p),
        Message::Close(c) => TgMessage::Close(c.map(close_to_backend)),
    }
}

fn msg_to_client(msg: TgMessage) -> Option<Message> {
    match msg {
        TgMessage::Text(t) => Some(Message::Text(t.as_str().into())),
        TgMessage::Binary(b) => Some(Message::Binary(b)),
        TgMessage::Ping(p) => Some(Message::Ping(p)),
        TgMessage::Pong(p) => Some(Message::Pong(p)),
        TgMessage::Close(c) => Some(Message::Close(c.map(close_to_client))),
        TgMessage::Frame(_) => None,
    }
}

fn close_to_backend(frame: CloseFrame) -> TgCloseFrame {
    TgCloseFrame {
        code: frame.code.into(),
        reason: frame.reason.as_str().into(),
    }
}

fn close_to_client(frame: TgCloseFrame) -> CloseFrame {
    CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.as_str().into(),
    }
}

fn client_payload_len(msg: &Message) -> u64 {
    match msg {
        Message::Text(t) => t.as_str().len() as u64,
        Message::Binary(b) => b.len() as u64,
        _ => 0,
    }
}

fn backend_payload_len(msg: &TgMessage) -> u64 {
    match msg {
        TgMessage::Text(t) => t.as_str().len() as u64,
        TgMessage::Binary(b) => b.len() as u64,
        _ => 0,
    }
}

fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

fn human_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * KB;
    const GB: f64 = 1024.0 * MB;
    const TB: f64 = 1024.0 * GB;
    let v = n as f64;
    if v >= TB {
        format!("{:.2}TiB", v / TB)
    } else if v >= GB {
        format!("{:.2}GiB", v / GB)
    } else if v >= MB {
        format!("{:.2}MiB", v / MB)
    } else if v >= KB {
        format!("{:.2}KiB", v / KB)
    } else {
        format!("{n}B")
    }
}

fn human_rate(bytes: u64, d: Duration) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * KB;
    const GB: f64 = 1024.0 * MB;
    if d.is_zero() {
        return "0B/s".to_string();
    }
    let bps = bytes as f64 / d.as_secs_f64();
    if bps >= GB {
        format!("{:.2}GiB/s", bps / GB)
    } else if bps >= MB {
        format!("{:.2}MiB/s", bps / MB)
    } else if bps >= KB {
        format!("{:.2}KiB/s", bps / KB)
    } else {
        format!("{bps:.2}B/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_classification() {
        assert_eq!(classify_close(None).cause(), "closed");
        assert_eq!(classify_close(Some(1000)).cause(), "closed");
        assert_eq!(classify_close(Some(1001)).cause(), "closed");
        assert_eq!(classify_close(Some(1005)).cause(), "closed");
        assert_eq!(classify_close(Some(1006)).cause(), "closed");
        assert_eq!(classify_close(Some(1011)).cause(), "error");
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.00KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00MiB");
    }

    #[test]
    fn human_rate_units() {
        assert_eq!(human_rate(0, Duration::ZERO), "0B/s");
        assert_eq!(human_rate(1024, Duration::from_secs(1)), "1.00KiB/s");
        assert_eq!(human_rate(100, Duration::from_secs(2)), "50.00B/s");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
    }
}
