//! Immutable host -> chain registry and routing decisions.
//!
//! Built once at startup from validated chain configs; lookups after that are
//! lock-free reads. Each chain contributes its base host, its vhost names
//! (`rpc.<base>`, `<rest-prefix>.<base>`) when vhost exposure is enabled, and
//! every explicit alias.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ChainConfig, Ports};

pub const RPC_PREFIX: &str = "/rpc";
pub const REST_PREFIX: &str = "/rest";
pub const GRPC_PREFIX: &str = "/grpc";
pub const GRPC_WEB_PREFIX: &str = "/grpc-web";
pub const API_PREFIX: &str = "/api";

/// Which rewrite rules apply to a proxied response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteScope {
    Rpc,
    Rest,
    Api,
}

/// The outcome of classifying one request against a chain.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    /// Backend URL, scheme + authority + path, query not yet attached.
    pub target: String,
    /// Access-log route label.
    pub route: &'static str,
    pub scope: Option<RewriteScope>,
    /// Banner/index injection requested for this path.
    pub inject: bool,
    pub rpc_vhost: bool,
}

pub struct HostRegistry {
    hosts: HashMap<String, Arc<ChainConfig>>,
    defaults: Ports,
}

/// Lowercase a host header and strip any port suffix, with IPv6 support.
pub fn normalize_host(raw: &str) -> String {
    let h = raw.trim().to_ascii_lowercase();
    if h.is_empty() {
        return h;
    }
    if let Some(rest) = h.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
        return h.trim_matches(|c| c == '[' || c == ']').to_string();
    }
    // a bare IPv6 literal has more than one colon and no brackets
    if h.matches(':').count() > 1 {
        return h;
    }
    match h.split_once(':') {
        Some((host, _)) => host.to_string(),
        None => h,
    }
}

impl HostRegistry {
    pub fn build(chains: Vec<ChainConfig>, defaults: Ports) -> Result<Self> {
        let mut hosts: HashMap<String, Arc<ChainConfig>> = HashMap::new();
        if chains.is_empty() {
            bail!("no chain configs loaded");
        }

        for chain in chains {
            let chain = Arc::new(chain);
            let base = chain.host.clone();
            register(&mut hosts, &base, &chain)?;

            if chain.expose.vhost {
                let rp = &chain.expose.vhost_prefix.rpc;
                let ap = &chain.expose.vhost_prefix.rest;
                register(&mut hosts, &format!("{rp}.{base}"), &chain)?;
                register(&mut hosts, &format!("{ap}.{base}"), &chain)?;
            }

            for alias in chain
                .aliases
                .rpc
                .iter()
                .chain(&chain.aliases.rest)
                .chain(&chain.aliases.api)
            {
                if !alias.is_empty() {
                    register(&mut hosts, alias, &chain)?;
                }
            }
        }

        Ok(Self { hosts, defaults })
    }

    /// Look up the chain serving `raw_host` (which may carry a port suffix).
    pub fn resolve(&self, raw_host: &str) -> Option<Arc<ChainConfig>> {
        self.hosts.get(&normalize_host(raw_host)).cloned()
    }

    pub fn defaults(&self) -> Ports {
        self.defaults
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&String, &Arc<ChainConfig>)> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Resolve per-chain ports against the global defaults.
    pub fn effective_ports(&self, chain: &ChainConfig) -> Ports {
        let mut eff = self.defaults;
        if !chain.default_ports {
            if chain.ports.rpc != 0 {
                eff.rpc = chain.ports.rpc;
            }
            if chain.ports.rest != 0 {
                eff.rest = chain.ports.rest;
            }
            if chain.ports.grpc != 0 {
                eff.grpc = chain.ports.grpc;
            }
            if chain.ports.grpc_web != 0 {
                eff.grpc_web = chain.ports.grpc_web;
            }
            if chain.ports.api != 0 {
                eff.api = chain.ports.api;
            }
        }
        eff
    }

    /// Classify a request and pick the backend URL.
    ///
    /// Vhost routing wins over path routing. Returns `None` when no enabled
    /// service covers the request (the caller answers 404).
    pub fn plan_route(&self, chain: &ChainConfig, host: &str, path: &str) -> Option<RoutePlan> {
        let eff = self.effective_ports(chain);
        let ip = &chain.ip;

        let (is_rpc_vhost, is_rest_vhost) = if chain.expose.vhost {
            let rp = chain.expose.vhost_prefix.rpc.as_str();
            let ap = chain.expose.vhost_prefix.rest.as_str();
            (
                host.starts_with(&format!("{rp}.")) || in_list(&chain.aliases.rpc, host),
                host.starts_with(&format!("{ap}."))
                    || in_list(&chain.aliases.rest, host)
                    || in_list(&chain.aliases.api, host),
            )
        } else {
            (false, false)
        };

        if is_rpc_vhost && chain.services.rpc {
            return Some(RoutePlan {
                target: format!("http://{ip}:{}{path}", eff.rpc),
                route: "direct",
                scope: Some(RewriteScope::Rpc),
                inject: chain.features.inject_rpc_index && (path == "/" || path.is_empty()),
                rpc_vhost: true,
            });
        }
        if is_rest_vhost && chain.services.rest {
            return Some(RoutePlan {
                target: format!("http://{ip}:{}{path}", eff.rest),
                route: "direct",
                scope: Some(RewriteScope::Rest),
                inject: chain.features.inject_rest_swagger && path == "/swagger/",
                rpc_vhost: false,
            });
        }

        if !chain.expose.path {
            return None;
        }

        if path.starts_with(RPC_PREFIX) && chain.services.rpc {
            let rest = path.strip_prefix(RPC_PREFIX).unwrap_or(path);
            return Some(RoutePlan {
                target: format!("http://{ip}:{}{rest}", eff.rpc),
                route: "rpc",
                scope: Some(RewriteScope::Rpc),
                inject: chain.features.inject_rpc_index && (path == "/rpc" || path == "/rpc/"),
                rpc_vhost: false,
            });
        }
        if path.starts_with(REST_PREFIX) && chain.services.rest {
            let rest = path.strip_prefix(REST_PREFIX).unwrap_or(path);
            return Some(RoutePlan {
                target: format!("http://{ip}:{}{rest}", eff.rest),
                route: "rest",
                scope: Some(RewriteScope::Rest),
                inject: chain.features.inject_rest_swagger && path == "/rest/swagger/",
                rpc_vhost: false,
            });
        }
        // grpc-web first so it is not shadowed by the /grpc prefix
        if path.starts_with(GRPC_WEB_PREFIX) && chain.services.grpc_web {
            let rest = path.strip_prefix(GRPC_WEB_PREFIX).unwrap_or(path);
            return Some(RoutePlan {
                target: format!("http://{ip}:{}{rest}", eff.grpc_web),
                route: "rest",
                scope: None,
                inject: false,
                rpc_vhost: false,
            });
        }
        if path.starts_with(GRPC_PREFIX) && chain.services.grpc {
            let rest = path.strip_prefix(GRPC_PREFIX).unwrap_or(path);
            return Some(RoutePlan {
                target: format!("http://{ip}:{}{rest}", eff.grpc),
                route: "rest",
                scope: None,
                inject: false,
                rpc_vhost: false,
            });
        }
        if path.starts_with(API_PREFIX) && chain.services.api_alias {
            let rest = path.strip_prefix(API_PREFIX).unwrap_or(path);
            return Some(RoutePlan {
                target: format!("http://{ip}:{}{rest}", eff.api),
                route: "rest",
                scope: Some(RewriteScope::Api),
                inject: false,
                rpc_vhost: false,
            });
        }
        if (path == "/" || path.is_empty()) && chain.services.rest {
            return Some(RoutePlan {
                target: format!("http://{ip}:{}/", eff.rest),
                route: "rest",
                scope: None,
                inject: false,
                rpc_vhost: false,
            });
        }

        None
    }
}

fn register(
    hosts: &mut HashMap<String, Arc<ChainConfig>>,
    host: &str,
    chain: &Arc<ChainConfig>,
) -> Result<()> {
    if host.is_empty() {
        return Ok(());
    }
    if let Some(existing) = hosts.get(host) {
        if existing.chain_name != chain.chain_name {
            bail!(
                "duplicate host {:?} in chain {:?} conflicts with {:?}",
                host,
                chain.chain_name,
                existing.chain_name
            );
        }
    }
    hosts.insert(host.to_string(), chain.clone());
    Ok(())
}

fn in_list(list: &[String], needle: &str) -> bool {
    list.iter().any(|s| s.eq_ignore_ascii_case(needle.trim()))
}
