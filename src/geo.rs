//! Country/ASN lookups against local MaxMind databases.
//!
//! Lookups are best-effort: a missing database or an address outside the
//! dataset yields an empty string and the caller carries on.

use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

const COUNTRY_DB_PATHS: &[&str] = &[
    "/usr/share/GeoIP/GeoLite2-Country.mmdb",
    "/usr/local/share/GeoIP/GeoLite2-Country.mmdb",
];

const ASN_DB_PATHS: &[&str] = &[
    "/usr/share/GeoIP/GeoLite2-ASN.mmdb",
    "/usr/local/share/GeoIP/GeoLite2-ASN.mmdb",
];

pub struct GeoDb {
    country: Option<Reader<Vec<u8>>>,
    asn: Option<Reader<Vec<u8>>>,
    country_path: String,
    asn_path: String,
}

fn open_db(env_var: &str, fallbacks: &[&str]) -> (Option<Reader<Vec<u8>>>, String) {
    let mut candidates: Vec<String> = Vec::new();
    if let Ok(p) = std::env::var(env_var) {
        if !p.trim().is_empty() {
            candidates.push(p.trim().to_string());
        }
    }
    candidates.extend(fallbacks.iter().map(|s| s.to_string()));

    for path in candidates {
        if !Path::new(&path).exists() {
            continue;
        }
        match Reader::open_readfile(&path) {
            Ok(reader) => {
                debug!(path = %path, "loaded geo database");
                return (Some(reader), path);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "failed to open geo database");
            }
        }
    }
    (None, String::new())
}

impl GeoDb {
    /// Open whichever databases are present; absence is not an error.
    pub fn open() -> Self {
        let (country, country_path) = open_db("GEOLITE2_COUNTRY_DB", COUNTRY_DB_PATHS);
        let (asn, asn_path) = open_db("GEOLITE2_ASN_DB", ASN_DB_PATHS);
        Self {
            country,
            asn,
            country_path,
            asn_path,
        }
    }

    /// ISO country code for `ip`, or empty when unknown.
    pub fn country(&self, ip: &str) -> String {
        let Some(reader) = &self.country else {
            return String::new();
        };
        let Ok(addr) = ip.trim().parse::<IpAddr>() else {
            return String::new();
        };
        match reader.lookup::<geoip2::Country>(addr) {
            Ok(rec) => rec
                .country
                .and_then(|c| c.iso_code)
                .unwrap_or_default()
                .to_string(),
            Err(_) => String::new(),
        }
    }

    /// "AS<number> <org>" for `ip`, or empty when unknown.
    pub fn asn(&self, ip: &str) -> String {
        let Some(reader) = &self.asn else {
            return String::new();
        };
        let Ok(addr) = ip.trim().parse::<IpAddr>() else {
            return String::new();
        };
        match reader.lookup::<geoip2::Asn>(addr) {
            Ok(rec) => {
                let num = rec.autonomous_system_number;
                let org = rec.autonomous_system_organization.unwrap_or_default();
                match num {
                    Some(n) if !org.is_empty() => format!("AS{n} {org}"),
                    Some(n) => format!("AS{n}"),
                    None if !org.is_empty() => org.to_string(),
                    None => String::new(),
                }
            }
            Err(_) => String::new(),
        }
    }

    /// One-line status for the startup log.
    pub fn info(&self) -> String {
        match (&self.country, &self.asn) {
            (Some(_), Some(_)) => format!(
                "country db {} / asn db {}",
                self.country_path, self.asn_path
            ),
            (Some(_), None) => format!("country db {} / asn db unavailable", self.country_path),
            (None, Some(_)) => format!("country db unavailable / asn db {}", self.asn_path),
            (None, None) => "no geo databases found, lookups disabled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_without_databases_are_empty() {
        let geo = GeoDb {
            country: None,
            asn: None,
            country_path: String::new(),
            asn_path: String::new(),
        };
        assert_eq!(geo.country("1.1.1.1"), "");
        assert_eq!(geo.asn("1.1.1.1"), "");
        assert_eq!(geo.info(), "no geo databases found, lookups disabled");
    }

    #[test]
    fn lookups_tolerate_garbage_input() {
        let geo = GeoDb {
            country: None,
            asn: None,
            country_path: String::new(),
            asn_path: String::new(),
        };
        assert_eq!(geo.country("not-an-ip"), "");
        assert_eq!(geo.asn(""), "");
    }
}
