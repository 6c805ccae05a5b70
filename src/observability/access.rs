//! Durable per-source access counters.
//!
//! The whole map is persisted atomically (write temp, rename) on every
//! increment; persistence failures are logged and never block request flow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct AccessCounters {
    path: PathBuf,
    counts: Mutex<HashMap<String, i64>>,
}

impl AccessCounters {
    /// Load persisted counters, skipping empty IPs and negative values.
    pub fn load(path: PathBuf) -> Self {
        let mut counts = HashMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, i64>>(&bytes) {
                Ok(raw) => {
                    for (ip, qty) in raw {
                        if ip.trim().is_empty() || qty < 0 {
                            continue;
                        }
                        counts.insert(ip, qty);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "counter load failed"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "counter load failed"),
        }
        Self {
            path,
            counts: Mutex::new(counts),
        }
    }

    /// Increment the counter for `ip` and persist; returns the new count.
    pub fn record(&self, ip: &str) -> i64 {
        let mut counts = self.counts.lock().expect("counter mutex poisoned");
        let entry = counts.entry(ip.to_string()).or_insert(0);
        *entry += 1;
        let qty = *entry;
        if let Err(e) = persist_locked(&self.path, &counts) {
            warn!(path = %self.path.display(), error = %e, "counter save failed");
        }
        qty
    }

    pub fn persist(&self) -> std::io::Result<()> {
        let counts = self.counts.lock().expect("counter mutex poisoned");
        persist_locked(&self.path, &counts)
    }

    /// Clear all counters and persist an empty object.
    pub fn reset(&self) -> std::io::Result<()> {
        let mut counts = self.counts.lock().expect("counter mutex poisoned");
        counts.clear();
        persist_locked(&self.path, &counts)
    }

    pub fn get(&self, ip: &str) -> i64 {
        let counts = self.counts.lock().expect("counter mutex poisoned");
        counts.get(ip).copied().unwrap_or(0)
    }
}

fn persist_locked(path: &Path, counts: &HashMap<String, i64>) -> std::io::Result<()> {
    let clean: HashMap<&String, &i64> = counts
        .iter()
        .filter(|(ip, qty)| !ip.trim().is_empty() && **qty >= 0)
        .collect();
    let bytes = serde_json::to_vec_pretty(&clean)?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_persist_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access-counts.json");

        let counters = AccessCounters::load(path.clone());
        assert_eq!(counters.record("1.2.3.4"), 1);
        assert_eq!(counters.record("1.2.3.4"), 2);
        assert_eq!(counters.record("5.6.7.8"), 1);

        let reloaded = AccessCounters::load(path);
        assert_eq!(reloaded.get("1.2.3.4"), 2);
        assert_eq!(reloaded.get("5.6.7.8"), 1);
    }

    #[test]
    fn load_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access-counts.json");
        std::fs::write(&path, r#"{"": 5, "1.2.3.4": -1, "9.9.9.9": 7}"#).unwrap();

        let counters = AccessCounters::load(path);
        assert_eq!(counters.get(""), 0);
        assert_eq!(counters.get("1.2.3.4"), 0);
        assert_eq!(counters.get("9.9.9.9"), 7);
    }

    #[test]
    fn reset_persists_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access-counts.json");

        let counters = AccessCounters::load(path.clone());
        counters.record("1.2.3.4");
        counters.reset().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), "{}");
        assert_eq!(AccessCounters::load(path).get("1.2.3.4"), 0);
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let counters = AccessCounters::load(dir.path().join("nope.json"));
        assert_eq!(counters.get("1.2.3.4"), 0);
    }
}
