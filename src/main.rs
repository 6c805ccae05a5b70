use anyhow::{bail, Context, Result};
use axum::routing::any;
use axum::Router;
use clap::Parser;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::{Service, ServiceExt};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vprox::backup::{self, BackupOptions};
use vprox::config;
use vprox::geo::GeoDb;
use vprox::limit::{self, AutoRule, IpLimiter, LimiterSettings, RateSpec};
use vprox::observability::{f, AccessCounters, Logger};
use vprox::proxy::{build_client, proxy_handler, ws_handler, AppState};
use vprox::registry::HostRegistry;

/// Connection hygiene: a stalled client cannot hold a slot forever.
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
/// Whole-exchange deadline for one request (read + handle + respond).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// How long in-flight work gets to drain after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "vprox")]
#[command(about = "Host-routed reverse proxy for Cosmos node services")]
#[command(version)]
struct Args {
    /// "start" runs in the foreground and mirrors logs to stdout
    /// (journalctl friendly); "backup" is shorthand for --backup.
    #[arg(value_parser = ["start", "backup"])]
    command: Option<String>,

    /// Run one backup cycle and exit.
    #[arg(long)]
    backup: bool,

    /// Reset persisted access counters (backup mode).
    #[arg(long, visible_alias = "reset_count")]
    reset_count: bool,

    /// Override VPROX_HOME.
    #[arg(long)]
    home: Option<PathBuf>,

    /// Override the config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the chains directory.
    #[arg(long)]
    chains: Option<PathBuf>,

    /// Listen address (default :3000).
    #[arg(long)]
    addr: Option<String>,

    /// Override the main log file path.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Validate configs and exit.
    #[arg(long)]
    validate: bool,

    /// Load everything but don't start the server.
    #[arg(long)]
    dry_run: bool,

    /// Show the loaded config summary and exit.
    #[arg(long)]
    info: bool,

    /// Verbose logging output.
    #[arg(long)]
    verbose: bool,

    /// Suppress stdout mirroring in start mode.
    #[arg(long)]
    quiet: bool,

    /// Override the default RPS (env: VPROX_RPS).
    #[arg(long)]
    rps: Option<f64>,

    /// Override the default burst (env: VPROX_BURST).
    #[arg(long)]
    burst: Option<u32>,

    /// Override the auto-quarantine penalty RPS (env: VPROX_AUTO_RPS).
    #[arg(long)]
    auto_rps: Option<f64>,

    /// Override the auto-quarantine penalty burst (env: VPROX_AUTO_BURST).
    #[arg(long)]
    auto_burst: Option<u32>,

    /// Disable auto-quarantine.
    #[arg(long)]
    disable_auto: bool,

    /// Disable the automatic backup loop.
    #[arg(long)]
    disable_backup: bool,
}

/// Filesystem layout under the vProx home directory.
struct Dirs {
    home: PathBuf,
    config_dir: PathBuf,
    chains_dir: PathBuf,
    data_dir: PathBuf,
    logs_dir: PathBuf,
    archive_dir: PathBuf,
    counts_path: PathBuf,
}

impl Dirs {
    fn resolve(args: &Args) -> Self {
        let home = resolve_home(args.home.clone());
        let config_dir = resolve_under(&home, args.config.clone(), "config");
        let chains_dir = resolve_under(&home, args.chains.clone(), "chains");
        let data_dir = home.join("data");
        let logs_dir = data_dir.join("logs");
        let archive_dir = logs_dir.join("archives");
        let counts_path = data_dir.join("access-counts.json");
        Self {
            home,
            config_dir,
            chains_dir,
            data_dir,
            logs_dir,
            archive_dir,
            counts_path,
        }
    }

    fn create(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.chains_dir,
            &self.data_dir,
            &self.logs_dir,
            &self.archive_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn resolve_home(flag: Option<PathBuf>) -> PathBuf {
    if let Some(home) = flag {
        return home;
    }
    if let Ok(v) = std::env::var("VPROX_HOME") {
        if !v.trim().is_empty() {
            return PathBuf::from(v.trim());
        }
    }
    if let Ok(h) = std::env::var("HOME") {
        if !h.trim().is_empty() {
            return PathBuf::from(h).join(".vProx");
        }
    }
    PathBuf::from(".vProx")
}

fn resolve_under(home: &PathBuf, flag: Option<PathBuf>, default: &str) -> PathBuf {
    match flag {
        Some(p) if p.is_absolute() => p,
        Some(p) => home.join(p),
        None => home.join(default),
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool_default(key: &str, default: bool) -> bool {
    match env_str(key) {
        None => default,
        Some(v) => v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"),
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_str(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_str(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_str(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bytes(key: &str) -> u64 {
    env_str(key).map(|v| parse_bytes(&v)).unwrap_or(0)
}

/// Parse "512", "512MB", "2GB" style sizes.
fn parse_bytes(raw: &str) -> u64 {
    let s = raw.trim().to_ascii_uppercase();
    if s.is_empty() {
        return 0;
    }
    for (suffix, mult) in [
        ("KB", 1u64 << 10),
        ("MB", 1 << 20),
        ("GB", 1 << 30),
        ("TB", 1 << 40),
        ("B", 1),
    ] {
        if let Some(num) = s.strip_suffix(suffix) {
            return num
                .trim()
                .parse::<u64>()
                .map(|n| n.saturating_mul(mult))
                .unwrap_or(0);
        }
    }
    s.parse().unwrap_or(0)
}

fn listen_addr(args: &Args) -> String {
    let addr = args
        .addr
        .clone()
        .or_else(|| env_str("VPROX_ADDR"))
        .unwrap_or_else(|| ":3000".to_string());
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "vprox=debug" } else { "vprox=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let start_mode = args.command.as_deref() == Some("start");
    let backup_mode = args.backup || args.command.as_deref() == Some("backup");

    let dirs = Dirs::resolve(&args);
    dirs.create()?;

    let main_log = match &args.log_file {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => dirs.logs_dir.join(p),
        None => dirs.logs_dir.join("main.log"),
    };
    let logger = Arc::new(
        Logger::open(
            main_log.clone(),
            start_mode && !args.quiet,
            dirs.home.clone(),
            dirs.logs_dir.clone(),
        )
        .with_context(|| format!("could not open {}", main_log.display()))?,
    );

    let backup_opts = BackupOptions {
        log_path: main_log.clone(),
        archive_dir: dirs.archive_dir.clone(),
        state_path: dirs.data_dir.join("backup.last"),
        interval_days: env_u64("VPROX_BACKUP_INTERVAL_DAYS", 0),
        max_bytes: env_bytes("VPROX_BACKUP_MAX_BYTES"),
        check_interval: Duration::from_secs(env_u64("VPROX_BACKUP_CHECK_MINUTES", 10) * 60),
    };

    if backup_mode {
        if args.reset_count {
            AccessCounters::load(dirs.counts_path.clone())
                .reset()
                .context("failed to reset access counters")?;
            logger.print(
                "INFO",
                "access",
                "counter_reset",
                &[f("path", dirs.counts_path.display().to_string())],
            );
        }
        backup::run_once(&backup_opts, &logger).context("backup failed")?;
        return Ok(());
    }

    let geo = Arc::new(GeoDb::open());
    logger.print("INFO", "geo", "status", &[f("message", geo.info())]);

    let counters = Arc::new(AccessCounters::load(dirs.counts_path.clone()));

    // Load configs (TOML only)
    let ports_path = dirs.config_dir.join("ports.toml");
    if !ports_path.exists() {
        bail!("ports config missing: {}", ports_path.display());
    }
    let default_ports =
        config::load_ports(&ports_path).context("could not load default ports")?;

    // chains/ is preferred; config/ is kept for backward compatibility
    let mut chains = Vec::new();
    let mut found = false;
    for dir in [&dirs.chains_dir, &dirs.config_dir] {
        if config::has_chain_configs(dir) {
            chains.extend(
                config::load_chains(dir)
                    .with_context(|| format!("could not load chain configs from {}", dir.display()))?,
            );
            found = true;
            logger.print(
                "INFO",
                "config",
                "chains_loaded",
                &[f("dir", dir.display().to_string())],
            );
        }
    }
    if !found {
        bail!(
            "no chain configs found in {} or {}",
            dirs.chains_dir.display(),
            dirs.config_dir.display()
        );
    }

    let registry = Arc::new(
        HostRegistry::build(chains, default_ports).context("invalid chain configuration")?,
    );

    if args.validate {
        logger.print(
            "INFO",
            "config",
            "validation_ok",
            &[f("hosts", registry.len())],
        );
        for (host, _) in registry.hosts() {
            println!("  {host}");
        }
        println!(
            "Default ports: RPC={}, REST={}, gRPC={}, gRPC-Web={}, API={}",
            default_ports.rpc,
            default_ports.rest,
            default_ports.grpc,
            default_ports.grpc_web,
            default_ports.api
        );
        println!("All configs OK ({} hosts)", registry.len());
        return Ok(());
    }

    if args.info {
        println!("VPROX_HOME:        {}", dirs.home.display());
        println!("Config directory:  {}", dirs.config_dir.display());
        println!("Chains directory:  {}", dirs.chains_dir.display());
        println!("Data directory:    {}", dirs.data_dir.display());
        println!("Logs directory:    {}", dirs.logs_dir.display());
        println!("Main log file:     {}", main_log.display());
        println!();
        println!("Registered hosts: {}", registry.len());
        for (host, chain) in registry.hosts() {
            println!("  {} ({}) @ {}", host, chain.chain_name, chain.ip);
            if args.verbose {
                println!(
                    "    services: rpc={} rest={} websocket={} grpc={} grpc-web={}",
                    chain.services.rpc,
                    chain.services.rest,
                    chain.services.websocket,
                    chain.services.grpc,
                    chain.services.grpc_web
                );
            }
        }
        return Ok(());
    }

    // Limiter: defaults ok, overrides limited, 429 blocked
    let default_rps = args
        .rps
        .filter(|v| *v > 0.0)
        .unwrap_or_else(|| env_f64("VPROX_RPS", 25.0));
    let default_burst = args
        .burst
        .filter(|v| *v > 0)
        .unwrap_or_else(|| env_u32("VPROX_BURST", 100));
    let auto_enabled = !args.disable_auto && env_bool_default("VPROX_AUTO_ENABLED", true);
    let auto_rule = auto_enabled.then(|| AutoRule {
        threshold: env_u32("VPROX_AUTO_THRESHOLD", 120).max(1),
        window: Duration::from_secs(env_u64("VPROX_AUTO_WINDOW_SEC", 10).max(1)),
        penalty: RateSpec {
            rps: args
                .auto_rps
                .filter(|v| *v > 0.0)
                .unwrap_or_else(|| env_f64("VPROX_AUTO_RPS", 1.0)),
            burst: args
                .auto_burst
                .filter(|v| *v > 0)
                .unwrap_or_else(|| env_u32("VPROX_AUTO_BURST", 1)),
        },
        ttl: Duration::from_secs(env_u64("VPROX_AUTO_TTL_SEC", 900).max(1)),
    });

    let limiter = Arc::new(IpLimiter::new(
        LimiterSettings {
            defaults: RateSpec {
                rps: default_rps,
                burst: default_burst,
            },
            trust_proxy: true,
            ip_header: None,
            enforce_defaults: true,
            auto_rule,
            allow_log_every: None,
            important_only: true,
            mirror_main: true,
            audit_path: dirs.logs_dir.join("rate-limit.jsonl"),
        },
        logger.clone(),
        geo.clone(),
    ));

    let backup_enabled = env_bool_default("VPROX_BACKUP_ENABLED", false) && !args.disable_backup;

    if args.dry_run {
        println!("Would listen on: {}", listen_addr(&args));
        println!("Registered hosts: {}", registry.len());
        println!("Rate limit: {default_rps} RPS, burst {default_burst}");
        println!(
            "Auto-quarantine: {}",
            if auto_enabled { "enabled" } else { "disabled" }
        );
        println!(
            "Backup: {}",
            if backup_enabled { "enabled" } else { "disabled" }
        );
        println!("All systems ready (not starting server)");
        return Ok(());
    }

    let auto_backup = if backup_enabled {
        backup::start_auto(backup_opts, logger.clone())
    } else {
        None
    };

    let state = AppState {
        registry: registry.clone(),
        limiter: limiter.clone(),
        logger: logger.clone(),
        counters: counters.clone(),
        geo,
        client: build_client().context("could not build upstream client")?,
        config_dir: dirs.config_dir.clone(),
    };

    let app = Router::new()
        .route("/websocket", any(ws_handler))
        .fallback(any(proxy_handler))
        .layer(axum::middleware::from_fn_with_state(
            limiter.clone(),
            limit::middleware,
        ))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state);

    let addr = listen_addr(&args);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    logger.print("INFO", "server", "started", &[f("addr", addr.as_str())]);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Each connection is served directly so the header-read deadline also
    // covers idle keep-alive waits.
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let mut conns = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let tower_service = match make_service.call(remote).await {
                    Ok(service) => service,
                    Err(infallible) => match infallible {},
                };
                conns.spawn(async move {
                    let hyper_service =
                        hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                            tower_service.clone().oneshot(request)
                        });
                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(READ_HEADER_TIMEOUT)
                        .serve_connection(TokioIo::new(socket), hyper_service)
                        .with_upgrades();
                    if let Err(e) = conn.await {
                        debug!(error = %e, "connection error");
                    }
                });
            }
        }
    }

    logger.print("INFO", "server", "shutdown_requested", &[]);
    let drain = async {
        while conns.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        warn!("shutdown drain timed out, closing");
        conns.shutdown().await;
    }
    if let Err(e) = counters.persist() {
        logger.print(
            "WARN",
            "access",
            "counter_save_failed",
            &[f("error", e.to_string())],
        );
    }
    if let Some(auto) = auto_backup {
        auto.stop().await;
    }
    limiter.close();
    logger.close_chain_logs();
    logger.print("INFO", "server", "shutdown_complete", &[]);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bytes_suffixes() {
        assert_eq!(parse_bytes("512"), 512);
        assert_eq!(parse_bytes("1KB"), 1024);
        assert_eq!(parse_bytes("2MB"), 2 << 20);
        assert_eq!(parse_bytes("1GB"), 1 << 30);
        assert_eq!(parse_bytes("3 MB"), 3 << 20);
        assert_eq!(parse_bytes("100B"), 100);
        assert_eq!(parse_bytes("garbage"), 0);
        assert_eq!(parse_bytes(""), 0);
    }

    #[test]
    fn listen_addr_normalizes_bare_port() {
        let mut args = Args::parse_from(["vprox"]);
        args.addr = Some(":4000".into());
        assert_eq!(listen_addr(&args), "0.0.0.0:4000");
        args.addr = Some("127.0.0.1:4000".into());
        assert_eq!(listen_addr(&args), "127.0.0.1:4000");
    }

    #[test]
    fn resolve_under_prefers_absolute_overrides() {
        let home = PathBuf::from("/srv/vprox");
        assert_eq!(
            resolve_under(&home, Some(PathBuf::from("/etc/vprox")), "config"),
            PathBuf::from("/etc/vprox")
        );
        assert_eq!(
            resolve_under(&home, Some(PathBuf::from("alt")), "config"),
            PathBuf::from("/srv/vprox/alt")
        );
        assert_eq!(
            resolve_under(&home, None, "config"),
            PathBuf::from("/srv/vprox/config")
        );
    }
}
