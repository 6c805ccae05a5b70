//! HTML body rewriting for proxied index/swagger pages.
//!
//! Upstream pages embed absolute links to the backend's own origin
//! (`http://10.0.0.5:26657/...`) which would dead-end for clients behind the
//! proxy. These are folded back onto the proxy's own namespace, optionally
//! made absolute for embedding frontends, and a banner is inserted after the
//! first `<body>` tag.

use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::registry::RewriteScope;

/// Embedding frontends that need absolute links under the `auto` policy.
const AUTO_ABSOLUTE_MARKER: &str = ".cosmos.directory";

/// Decide the absolute-link host for this response, if any.
pub fn absolute_host<'a>(
    mode: &str,
    incoming_host: &'a str,
    x_forwarded_host: &str,
    referer: &str,
) -> Option<&'a str> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "always" => Some(incoming_host),
        "never" => None,
        // auto: absolute links only for known embedding frontends
        _ => {
            if x_forwarded_host.contains(AUTO_ABSOLUTE_MARKER)
                || referer.contains(AUTO_ABSOLUTE_MARKER)
            {
                Some(incoming_host)
            } else {
                None
            }
        }
    }
}

fn origin_pattern(host_or_ip: &str, port: u16) -> Regex {
    Regex::new(&format!(
        r"(?i)(https?:)?//{}:{}/?",
        regex::escape(host_or_ip),
        port
    ))
    .expect("origin pattern is valid")
}

/// Fold backend-origin links onto the proxy namespace and apply the
/// absolute-link policy. A body with no such links passes through unchanged.
pub fn rewrite_links(
    html: &str,
    scope: RewriteScope,
    internal_ip: &str,
    base_host: &str,
    absolute_host: Option<&str>,
    rpc_vhost: bool,
) -> String {
    let mut html = html.to_string();

    match scope {
        RewriteScope::Rpc => {
            // Tendermint RPC runs on 26657
            let repl = if rpc_vhost { "/" } else { "/rpc/" };
            html = origin_pattern(internal_ip, 26657)
                .replace_all(&html, repl)
                .into_owned();
            html = origin_pattern(base_host, 26657)
                .replace_all(&html, repl)
                .into_owned();
            if rpc_vhost {
                // on rpc.<base> any stray /rpc/ prefixes collapse to /
                html = html.replace(r#"href="/rpc/"#, r#"href="/"#);
                html = html.replace(r#"src="/rpc/"#, r#"src="/"#);
            }
        }
        RewriteScope::Rest | RewriteScope::Api => {
            // Cosmos REST typically on 1317
            html = origin_pattern(internal_ip, 1317)
                .replace_all(&html, "/")
                .into_owned();
            html = origin_pattern(base_host, 1317)
                .replace_all(&html, "/")
                .into_owned();
        }
    }

    if let Some(abs) = absolute_host {
        match scope {
            RewriteScope::Rpc if rpc_vhost => {
                html = html.replace(r#"href="/"#, &format!(r#"href="https://{abs}/"#));
                html = html.replace(r#"src="/"#, &format!(r#"src="https://{abs}/"#));
            }
            RewriteScope::Rpc => {
                html = html.replace(r#"href="/rpc"#, &format!(r#"href="https://{abs}/rpc"#));
                html = html.replace(r#"src="/rpc"#, &format!(r#"src="https://{abs}/rpc"#));
            }
            RewriteScope::Rest => {
                html = html.replace(r#"href="/rest"#, &format!(r#"href="https://{abs}/rest"#));
                html = html.replace(r#"src="/rest"#, &format!(r#"src="https://{abs}/rest"#));
            }
            RewriteScope::Api => {
                html = html.replace(r#"href="/api"#, &format!(r#"href="https://{abs}/api"#));
                html = html.replace(r#"src="/api"#, &format!(r#"src="https://{abs}/api"#));
            }
        }
    }

    html
}

/// Insert the banner after the first `<body>` tag.
pub fn inject_banner(html: &str, banner: &str) -> String {
    if banner.trim().is_empty() {
        return html.to_string();
    }
    html.replacen(
        "<body>",
        &format!("<body>\n<div class=\"banner\">\n{banner}\n</div>\n"),
        1,
    )
}

/// Disk fallback for a chain's banner when no inline message is configured.
pub fn banner_path(config_dir: &Path, chain_name: &str, scope: RewriteScope) -> PathBuf {
    let file = match scope {
        RewriteScope::Rpc => "rpc.msg",
        RewriteScope::Rest | RewriteScope::Api => "rest.msg",
    };
    config_dir
        .join("msg")
        .join(chain_name.to_ascii_lowercase())
        .join(file)
}

pub fn decode_gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_vhost_collapses_backend_origins_to_root() {
        let html = r#"<a href="http://10.0.0.5:26657/status">s</a> <a href="/rpc/status">r</a>"#;
        let out = rewrite_links(html, RewriteScope::Rpc, "10.0.0.5", "chain.example", None, true);
        assert_eq!(out, r#"<a href="/status">s</a> <a href="/status">r</a>"#);
    }

    #[test]
    fn rpc_path_mode_maps_origins_under_rpc_prefix() {
        let html = r#"<a href="//chain.example:26657/genesis">g</a>"#;
        let out = rewrite_links(
            html,
            RewriteScope::Rpc,
            "10.0.0.5",
            "chain.example",
            None,
            false,
        );
        assert_eq!(out, r#"<a href="/rpc/genesis">g</a>"#);
    }

    #[test]
    fn rest_origins_fold_to_root() {
        let html = r#"<img src="https://10.0.0.5:1317/swagger/logo.png">"#;
        let out = rewrite_links(
            html,
            RewriteScope::Rest,
            "10.0.0.5",
            "chain.example",
            None,
            false,
        );
        assert_eq!(out, r#"<img src="/swagger/logo.png">"#);
    }

    #[test]
    fn rewrite_is_idempotent_and_noop_without_backend_links() {
        let html = r#"<a href="https://other.example/page">x</a> plain text"#;
        let once = rewrite_links(
            html,
            RewriteScope::Rpc,
            "10.0.0.5",
            "chain.example",
            None,
            false,
        );
        assert_eq!(once, html);

        let linked = r#"<a href="http://10.0.0.5:26657/status">s</a>"#;
        let once = rewrite_links(
            linked,
            RewriteScope::Rpc,
            "10.0.0.5",
            "chain.example",
            None,
            false,
        );
        let twice = rewrite_links(
            &once,
            RewriteScope::Rpc,
            "10.0.0.5",
            "chain.example",
            None,
            false,
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn absolute_links_prefix_rooted_paths() {
        let html = r#"<a href="/rpc/status">s</a>"#;
        let out = rewrite_links(
            html,
            RewriteScope::Rpc,
            "10.0.0.5",
            "chain.example",
            Some("chain.example"),
            false,
        );
        assert_eq!(out, r#"<a href="https://chain.example/rpc/status">s</a>"#);

        let html = r#"<a href="/status">s</a>"#;
        let out = rewrite_links(
            html,
            RewriteScope::Rpc,
            "10.0.0.5",
            "chain.example",
            Some("rpc.chain.example"),
            true,
        );
        assert_eq!(out, r#"<a href="https://rpc.chain.example/status">s</a>"#);
    }

    #[test]
    fn absolute_host_policy() {
        assert_eq!(
            absolute_host("always", "chain.example", "", ""),
            Some("chain.example")
        );
        assert_eq!(absolute_host("never", "chain.example", "x.cosmos.directory", ""), None);
        assert_eq!(absolute_host("auto", "chain.example", "", ""), None);
        assert_eq!(
            absolute_host("auto", "chain.example", "osmosis.cosmos.directory", ""),
            Some("chain.example")
        );
        assert_eq!(
            absolute_host("auto", "chain.example", "", "https://x.cosmos.directory/page"),
            Some("chain.example")
        );
    }

    #[test]
    fn banner_inserted_after_first_body_tag() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject_banner(html, "maintenance tonight");
        assert!(out.starts_with(
            "<html><body>\n<div class=\"banner\">\nmaintenance tonight\n</div>\n<p>hi</p>"
        ));
        assert_eq!(inject_banner(html, "   "), html);
        // no body tag: unchanged
        assert_eq!(inject_banner("<p>x</p>", "b"), "<p>x</p>");
    }

    #[test]
    fn banner_paths_by_scope() {
        let dir = Path::new("/home/vprox/config");
        assert_eq!(
            banner_path(dir, "Osmosis", RewriteScope::Rpc),
            Path::new("/home/vprox/config/msg/osmosis/rpc.msg")
        );
        assert_eq!(
            banner_path(dir, "osmosis", RewriteScope::Api),
            Path::new("/home/vprox/config/msg/osmosis/rest.msg")
        );
    }

    #[test]
    fn gzip_decode_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"<html><body>hello</body></html>").unwrap();
        let compressed = enc.finish().unwrap();

        let decoded = decode_gzip(&compressed).unwrap();
        assert_eq!(decoded, b"<html><body>hello</body></html>");

        assert!(decode_gzip(b"not gzip at all").is_err());
    }
}
