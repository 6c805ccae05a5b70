//! Copy-truncate rotation of the main log into tar.gz archives.
//!
//! One cycle: copy the live log aside, truncate it in place (writers keep
//! their append handles), emit a status line into the fresh log, compress the
//! copy into the archive directory, and record the run. A failed step leaves
//! the copy on disk so the next cycle can retry.

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::debug;

use crate::observability::request_id::new_request_id;
use crate::observability::{f, Field, Logger};

const COMPRESSION: &str = "TAR.GZ";

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub log_path: PathBuf,
    pub archive_dir: PathBuf,
    pub state_path: PathBuf,
    /// 0 disables the age trigger.
    pub interval_days: u64,
    /// 0 disables the size trigger.
    pub max_bytes: u64,
    pub check_interval: Duration,
}

/// Perform a single rotation cycle for the main log.
pub fn run_once(opts: &BackupOptions, logger: &Logger) -> Result<()> {
    let log_path = &opts.log_path;
    let log_dir = log_path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(log_dir).context("create log dir")?;
    fs::create_dir_all(&opts.archive_dir).context("create archive dir")?;

    let info = match fs::metadata(log_path) {
        Ok(info) => info,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let _ = OpenOptions::new().create(true).append(true).open(log_path);
            return Ok(());
        }
        Err(e) => return Err(e).context("stat log"),
    };
    if info.len() == 0 {
        return Ok(());
    }
    let source_size = info.len();

    let request_id = new_request_id().to_uppercase();
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let base = log_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("main.log");
    let copy_name = format!("{base}.{stamp}.copy");
    let copy_path = log_dir.join(&copy_name);
    let tar_name = format!("{base}.{stamp}.tar.gz");
    let final_path = opts.archive_dir.join(&tar_name);

    let fail = |err: &anyhow::Error| {
        status_line(
            logger,
            &request_id,
            "BACKUP FAILED",
            &err.to_string(),
            source_size,
            0,
            &opts.archive_dir,
            &tar_name,
            Some(&err.to_string()),
        );
    };

    if let Err(e) = fs::copy(log_path, &copy_path).context("copy log") {
        fail(&e);
        return Err(e);
    }
    if let Err(e) = truncate(log_path) {
        fail(&e);
        return Err(e);
    }

    status_line(
        logger,
        &request_id,
        "BACKUP STARTED",
        "started",
        source_size,
        0,
        &opts.archive_dir,
        &tar_name,
        None,
    );

    if let Err(e) = write_tar_gz(&copy_path, &copy_name, &final_path) {
        fail(&e);
        return Err(e);
    }
    let _ = fs::remove_file(&copy_path);

    let archive_size = match fs::metadata(&final_path).context("stat archive") {
        Ok(info) => info.len(),
        Err(e) => {
            fail(&e);
            return Err(e);
        }
    };

    status_line(
        logger,
        &request_id,
        "BACKUP COMPLETE",
        "success",
        source_size,
        archive_size,
        &opts.archive_dir,
        &tar_name,
        None,
    );

    write_last_run(&opts.state_path, SystemTime::now());
    Ok(())
}

fn truncate(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .context("open log for truncate")?;
    file.set_len(0).context("truncate log")?;
    Ok(())
}

fn write_tar_gz(src_path: &Path, src_name: &str, tar_path: &Path) -> Result<()> {
    let file = File::create(tar_path).context("create tar")?;
    let gz = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(gz);
    builder
        .append_path_with_name(src_path, src_name)
        .context("tar write")?;
    let gz = builder.into_inner().context("tar finish")?;
    gz.finish().context("gzip finish")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn status_line(
    logger: &Logger,
    request_id: &str,
    event: &str,
    status: &str,
    source_size: u64,
    archive_size: u64,
    location: &Path,
    filename: &str,
    failed: Option<&str>,
) {
    let mut fields: Vec<Field> = vec![
        f("request_id", request_id),
        f("status", status),
        f("filesize", human_size(source_size)),
        f("compression", COMPRESSION),
        f("location", location.display().to_string()),
        f("filename", filename),
        f("archivesize", human_size(archive_size)),
    ];
    if let Some(reason) = failed {
        fields.push(f("failed", reason));
    }
    let level = if event.eq_ignore_ascii_case("BACKUP FAILED") {
        "ERROR"
    } else {
        "INFO"
    };
    logger.print(level, "backup", event, &fields);
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while unit < UNITS.len() - 1 && size >= 1024.0 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{size:.2}{}", UNITS[unit])
    }
}

fn read_last_run(state_path: &Path) -> Option<SystemTime> {
    let raw = fs::read_to_string(state_path).ok()?;
    let secs = raw.trim().parse::<u64>().ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

fn write_last_run(state_path: &Path, t: SystemTime) {
    if let Some(dir) = state_path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let _ = fs::write(state_path, secs.to_string());
}

fn should_backup(opts: &BackupOptions) -> Option<&'static str> {
    if opts.interval_days > 0 {
        let due = match read_last_run(&opts.state_path) {
            None => true,
            Some(last) => SystemTime::now()
                .duration_since(last)
                .map(|d| d >= Duration::from_secs(opts.interval_days * 24 * 3600))
                .unwrap_or(false),
        };
        if due {
            return Some("interval");
        }
    }
    if opts.max_bytes > 0 {
        let size = fs::metadata(&opts.log_path).map(|m| m.len()).unwrap_or(0);
        if size >= opts.max_bytes {
            return Some("size");
        }
    }
    None
}

/// Handle for the periodic rotation loop.
pub struct AutoBackup {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl AutoBackup {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

/// Start the automatic rotation loop; returns `None` when neither trigger is
/// configured.
pub fn start_auto(opts: BackupOptions, logger: Arc<Logger>) -> Option<AutoBackup> {
    if opts.interval_days == 0 && opts.max_bytes == 0 {
        return None;
    }
    let mut opts = opts;
    if opts.check_interval.is_zero() {
        opts.check_interval = Duration::from_secs(600);
    }
    let (tx, mut rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        loop {
            if let Some(reason) = should_backup(&opts) {
                logger.print("INFO", "backup", "triggered", &[f("reason", reason)]);
                if let Err(e) = run_once(&opts, &logger) {
                    logger.print("ERROR", "backup", "failed", &[f("error", e.to_string())]);
                }
            } else {
                debug!("backup check: nothing to do");
            }
            tokio::select! {
                _ = tokio::time::sleep(opts.check_interval) => {}
                _ = rx.changed() => return,
            }
        }
    });

    Some(AutoBackup { stop: tx, handle })
}
