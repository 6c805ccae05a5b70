use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Backend port assignments. Zero means "inherit the global default".
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Ports {
    pub rpc: u16,
    pub rest: u16,
    pub grpc: u16,
    pub grpc_web: u16,
    pub api: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VhostPrefix {
    pub rpc: String,
    pub rest: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Expose {
    pub path: bool,
    pub vhost: bool,
    pub vhost_prefix: VhostPrefix,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Services {
    pub rpc: bool,
    pub rest: bool,
    pub websocket: bool,
    pub grpc: bool,
    pub grpc_web: bool,
    pub api_alias: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Features {
    pub inject_rpc_index: bool,
    pub inject_rest_swagger: bool,
    /// auto | always | never
    pub absolute_links: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingCfg {
    pub file: String,
    pub format: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Message {
    pub api_msg: String,
    pub rpc_msg: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Aliases {
    pub rpc: Vec<String>,
    pub rest: Vec<String>,
    pub api: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WsConfig {
    pub idle_timeout_sec: u64,
    /// 0 = no hard cap
    pub max_lifetime_sec: u64,
}

impl WsConfig {
    pub fn idle_timeout(&self) -> Duration {
        if self.idle_timeout_sec == 0 {
            Duration::from_secs(3600)
        } else {
            Duration::from_secs(self.idle_timeout_sec)
        }
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        if self.max_lifetime_sec == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_lifetime_sec))
        }
    }
}

/// One chain's proxy exposure. Immutable after load.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    pub schema_version: u32,
    pub chain_name: String,
    pub host: String,
    pub ip: String,

    pub aliases: Aliases,
    pub expose: Expose,
    pub services: Services,
    pub ports: Ports,
    pub ws: WsConfig,
    pub features: Features,
    pub logging: LoggingCfg,
    pub message: Message,

    pub default_ports: bool,
}

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)+$").unwrap()
});

pub fn is_valid_hostname(h: &str) -> bool {
    let h = h.trim().to_ascii_lowercase();
    if h.is_empty() || h.len() > 253 {
        return false;
    }
    HOSTNAME_RE.is_match(&h)
}

fn validate_port(label: &str, v: u16) -> Result<()> {
    if v == 0 {
        bail!("{} port out of range: {}", label, v);
    }
    Ok(())
}

fn valid_absolute_links_mode(m: &str) -> bool {
    matches!(
        m.trim().to_ascii_lowercase().as_str(),
        "" | "auto" | "always" | "never"
    )
}

impl ChainConfig {
    /// Normalize and validate a freshly decoded chain config.
    pub fn validate(&mut self) -> Result<()> {
        if self.schema_version == 0 {
            self.schema_version = 1;
        }

        self.host = self.host.trim().to_ascii_lowercase();
        if !is_valid_hostname(&self.host) {
            bail!("invalid host: {:?}", self.host);
        }
        if self.ip.trim().parse::<IpAddr>().is_err() {
            bail!("invalid ip: {:?}", self.ip);
        }
        self.ip = self.ip.trim().to_string();

        if self.expose.vhost_prefix.rpc.is_empty() {
            self.expose.vhost_prefix.rpc = "rpc".to_string();
        }
        if self.expose.vhost_prefix.rest.is_empty() {
            // common defaults: "api" or "rest"
            self.expose.vhost_prefix.rest = "api".to_string();
        }

        if !valid_absolute_links_mode(&self.features.absolute_links) {
            bail!(
                "features.absolute_links must be auto|always|never, got {:?}",
                self.features.absolute_links
            );
        }

        if !self.default_ports {
            validate_port("rpc", self.ports.rpc)?;
            validate_port("rest", self.ports.rest)?;
            if self.services.grpc {
                validate_port("grpc", self.ports.grpc)?;
            }
            if self.services.grpc_web {
                validate_port("grpc_web", self.ports.grpc_web)?;
            }
            if self.services.api_alias {
                validate_port("api", self.ports.api)?;
            }
        }

        for list in [
            &mut self.aliases.rpc,
            &mut self.aliases.rest,
            &mut self.aliases.api,
        ] {
            for a in list.iter_mut() {
                *a = a.trim().to_ascii_lowercase();
                if !is_valid_hostname(a) {
                    bail!("aliases contain invalid hostname: {:?}", a);
                }
            }
        }

        let s = &self.services;
        if !(s.rpc || s.rest || s.grpc || s.grpc_web || s.api_alias || s.websocket) {
            bail!("no services enabled; enable at least one in [services]");
        }

        // WS tunnels to the RPC /websocket endpoint
        if s.websocket && !s.rpc {
            bail!("services.websocket requires services.rpc to be enabled");
        }

        Ok(())
    }
}

/// Load and validate the global default ports file.
pub fn load_ports(path: &Path) -> Result<Ports> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ports file: {}", path.display()))?;
    let p: Ports = toml::from_str(&content)
        .with_context(|| format!("failed to parse ports file: {}", path.display()))?;

    validate_port("rpc", p.rpc).context("ports.toml")?;
    validate_port("rest", p.rest).context("ports.toml")?;
    Ok(p)
}

/// Whether a directory contains at least one chain config file.
pub fn has_chain_configs(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".toml") && !name.eq_ignore_ascii_case("ports.toml") {
            return true;
        }
    }
    false
}

/// Load every `*.toml` chain file in `dir` (skipping `ports.toml`).
pub fn load_chains(dir: &Path) -> Result<Vec<ChainConfig>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read chain directory: {}", dir.display()))?;
    let mut chains = Vec::new();
    let mut names: Vec<_> = entries
        .flatten()
        .filter(|e| !e.path().is_dir())
        .map(|e| e.path())
        .collect();
    names.sort();

    for path in names {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".toml") || name.eq_ignore_ascii_case("ports.toml") {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut chain: ChainConfig =
            toml::from_str(&content).with_context(|| format!("decode {}", name))?;
        chain.validate().with_context(|| name.to_string())?;
        chains.push(chain);
    }
    Ok(chains)
}
