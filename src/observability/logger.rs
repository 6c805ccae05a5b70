//! Structured single-line logging with a dual sink.
//!
//! Every record is one `<time> <LVL> <message> key=value ... module=<m>` line.
//! The file branch receives plain text; the stdout branch (foreground mode)
//! gets the same line with ANSI color. The log file is opened in append mode
//! so the rotator can truncate it in place without writers reopening.

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_BOLD: &str = "\x1b[1m";
const ANSI_DIM: &str = "\x1b[2m";
const ANSI_BLUE: &str = "\x1b[34m";
const ANSI_CYAN: &str = "\x1b[36m";
const ANSI_GREEN: &str = "\x1b[32m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_MAGENTA: &str = "\x1b[35m";
const ANSI_RED: &str = "\x1b[31m";

static BARE_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:/@+\-]+$").unwrap());
static LOG_KV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_]*)=("([^"\\]|\\.)*"|[^ ]+)"#).unwrap());

/// A pre-encoded key/value pair for one log line.
#[derive(Debug, Clone)]
pub struct Field {
    pub key: String,
    pub value: String,
}

/// Create a structured key/value log field.
pub fn f(key: &str, value: impl FieldValue) -> Field {
    Field {
        key: key.trim().to_string(),
        value: value.encode(),
    }
}

pub trait FieldValue {
    fn encode(&self) -> String;
}

fn encode_str(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return "\"\"".to_string();
    }
    if BARE_VALUE_RE.is_match(s) {
        s.to_string()
    } else {
        format!("{s:?}")
    }
}

impl FieldValue for &str {
    fn encode(&self) -> String {
        encode_str(self)
    }
}

impl FieldValue for String {
    fn encode(&self) -> String {
        encode_str(self)
    }
}

impl FieldValue for &String {
    fn encode(&self) -> String {
        encode_str(self)
    }
}

impl FieldValue for bool {
    fn encode(&self) -> String {
        self.to_string()
    }
}

impl FieldValue for f64 {
    fn encode(&self) -> String {
        format!("{self}")
    }
}

macro_rules! int_field_value {
    ($($t:ty),*) => {
        $(impl FieldValue for $t {
            fn encode(&self) -> String {
                self.to_string()
            }
        })*
    };
}
int_field_value!(i32, i64, u16, u32, u64, usize);

/// Render one structured line: `<time> <LVL> <message> k=v ... module=<m>`.
pub fn line(level: &str, module: &str, event: &str, fields: &[Field]) -> String {
    let ts = Local::now().format("%-I:%M%p").to_string();
    let module = if module.trim().is_empty() {
        "app"
    } else {
        module.trim()
    };
    let event = if event.trim().is_empty() { "log" } else { event.trim() };

    let mut parts = vec![ts, short_level(level).to_string(), normalize_message(event)];
    let mut has_module = false;
    for field in fields {
        if field.key.is_empty() {
            continue;
        }
        if field.key.eq_ignore_ascii_case("module") {
            has_module = true;
        }
        parts.push(format!("{}={}", field.key, field.value));
    }
    if !has_module {
        parts.push(format!("module={}", encode_str(module)));
    }
    parts.join(" ")
}

fn short_level(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" | "DBG" => "DBG",
        "WARN" | "WARNING" | "WRN" => "WRN",
        "ERROR" | "ERR" => "ERR",
        _ => "INF",
    }
}

fn normalize_message(event: &str) -> String {
    event.trim().replace(['_', '-'], " ")
}

/// Colorize a rendered line for the stdout branch.
fn colorize(line: &str) -> String {
    if line.trim().is_empty() {
        return line.to_string();
    }
    let mut parts = line.splitn(3, ' ');
    let (Some(ts), Some(level), Some(rest)) = (parts.next(), parts.next(), parts.next()) else {
        return line.to_string();
    };

    let base = format!(
        "{ANSI_DIM}{ts}{ANSI_RESET} {}{level}{ANSI_RESET} ",
        color_level(level)
    );

    let Some(first_kv) = LOG_KV_RE.find(rest) else {
        return format!("{base}{ANSI_CYAN}{rest}{ANSI_RESET}");
    };

    let msg = rest[..first_kv.start()].trim();
    let kvs = &rest[first_kv.start()..];
    let kv_colored = LOG_KV_RE.replace_all(kvs, |caps: &regex::Captures| {
        let k = &caps[1];
        let v = &caps[2];
        format!(
            "{ANSI_BOLD}{ANSI_BLUE}{k}{ANSI_RESET}={}",
            color_value_for_key(k, v)
        )
    });

    if msg.is_empty() {
        format!("{base}{kv_colored}")
    } else {
        format!("{base}{ANSI_CYAN}{msg}{ANSI_RESET} {kv_colored}")
    }
}

fn color_level(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "DBG" => ANSI_BLUE,
        "WRN" => ANSI_YELLOW,
        "ERR" => ANSI_RED,
        _ => ANSI_GREEN,
    }
}

fn color_value_for_key(key: &str, value: &str) -> String {
    let color = match key.trim().to_ascii_lowercase().as_str() {
        "module" => ANSI_MAGENTA,
        "height" | "latency_ms" | "src_count" => ANSI_YELLOW,
        "status" => {
            if value.trim_matches('"').eq_ignore_ascii_case("ok") {
                ANSI_GREEN
            } else {
                ANSI_RED
            }
        }
        "error" => ANSI_RED,
        "request_id" | "ip" | "host" | "route" | "method" => ANSI_CYAN,
        _ => ANSI_GREEN,
    };
    format!("{color}{value}{ANSI_RESET}")
}

/// One access-log record, emitted once per request or WS session.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    /// "request" or "ws"
    pub event: &'static str,
    pub request_id: String,
    pub host: String,
    pub route: &'static str,
    pub proxied: bool,
    pub request: String,
    pub method: String,
    pub ip: String,
    pub src_count: i64,
    pub latency_ms: f64,
    pub ua: String,
    pub country: String,
    pub status: &'static str,
}

pub struct Logger {
    main: Mutex<File>,
    path: PathBuf,
    mirror_stdout: bool,
    chain_logs: Mutex<HashMap<PathBuf, File>>,
    home: PathBuf,
    logs_dir: PathBuf,
}

impl Logger {
    pub fn open(
        path: PathBuf,
        mirror_stdout: bool,
        home: PathBuf,
        logs_dir: PathBuf,
    ) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            main: Mutex::new(file),
            path,
            mirror_stdout,
            chain_logs: Mutex::new(HashMap::new()),
            home,
            logs_dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one already-rendered line to the main sink.
    pub fn write_line(&self, rendered: &str) {
        {
            let mut file = self.main.lock().expect("main log mutex poisoned");
            if let Err(e) = writeln!(file, "{rendered}") {
                warn!(error = %e, "main log write failed");
            }
        }
        if self.mirror_stdout {
            println!("{}", colorize(rendered));
        }
    }

    /// Emit a structured line via the main sink.
    pub fn print(&self, level: &str, module: &str, event: &str, fields: &[Field]) {
        self.write_line(&line(level, module, event, fields));
    }

    /// Emit the per-request access record; also duplicated into the chain's
    /// own log file when one is configured.
    pub fn access(&self, rec: &AccessRecord, chain_log_file: Option<&str>) {
        let rendered = line(
            "INFO",
            "access",
            rec.event,
            &[
                f("request_id", &rec.request_id),
                f("host", &rec.host),
                f("route", rec.route),
                f("proxied", rec.proxied),
                f("request", &rec.request),
                f("method", &rec.method),
                f("ip", &rec.ip),
                f("src_count", rec.src_count),
                f("latency_ms", rec.latency_ms),
                f("ua", &rec.ua),
                f("country", &rec.country),
                f("status", rec.status),
            ],
        );
        self.write_line(&rendered);
        if let Some(file) = chain_log_file {
            self.chain_line(file, &rendered);
        }
    }

    /// Resolve a chain's configured log file against the home/logs dirs.
    fn resolve_chain_path(&self, file: &str) -> Option<PathBuf> {
        let file = file.trim();
        if file.is_empty() {
            return None;
        }
        let p = Path::new(file);
        if p.is_absolute() {
            Some(p.to_path_buf())
        } else if file.starts_with("logs/") {
            Some(self.home.join(file))
        } else {
            Some(self.logs_dir.join(file))
        }
    }

    fn chain_line(&self, file_cfg: &str, rendered: &str) {
        let Some(path) = self.resolve_chain_path(file_cfg) else {
            return;
        };
        let mut logs = self.chain_logs.lock().expect("chain log mutex poisoned");
        if !logs.contains_key(&path) {
            if let Some(dir) = path.parent() {
                if std::fs::create_dir_all(dir).is_err() {
                    return;
                }
            }
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    logs.insert(path.clone(), file);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open chain log");
                    return;
                }
            }
        }
        if let Some(file) = logs.get_mut(&path) {
            let _ = writeln!(file, "{rendered}");
        }
    }

    pub fn close_chain_logs(&self) {
        let mut logs = self.chain_logs.lock().expect("chain log mutex poisoned");
        logs.clear();
    }
}
