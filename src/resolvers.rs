//! Lookup services for profile enrichment
//!
//! Geolocation via an optional MaxMind database, DNS names from the local
//! hosts file or the system resolver, and a static JA3 description table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use maxminddb::geoip2;
use tracing::{debug, warn};

use crate::config::Config;
use crate::types::Geolocation;

/// Known JA3 fingerprints and the client software they map to
const JA3_DATABASE: &[(&str, &str)] = &[
    ("e7d705a3286e19ea42f587b344ee6865", "Tor Browser"),
    ("6734f37431670b3ab4292b8f60f29984", "Trickbot"),
    ("72a589da586844d7f0818ce684948eea", "Metasploit Framework"),
    ("a0e9f5d64349fb13191bc781f81f42e1", "Chromium based browser"),
    ("b20b44b18b853ef29ab773e921b03422", "Firefox"),
    ("456523fc94726331a4d5a2e1d40b2cd7", "curl"),
    ("3b5074b1b5d032e5620f69f9f700ff0e", "Python requests"),
    ("10ee8d30a5d01c042afd7b2b205facc4", "OpenSSL s_client"),
];

/// Resolver bundle handed to the profile registry
pub struct Resolvers {
    geo: Option<maxminddb::Reader<Vec<u8>>>,
    local_dns: bool,
    hosts: HashMap<IpAddr, String>,
    resolver: Option<trust_dns_resolver::Resolver>,
}

impl Resolvers {
    pub fn new(cfg: &Config) -> Resolvers {
        let geo = cfg.geoip_db.as_ref().and_then(|path| {
            match maxminddb::Reader::open_readfile(path) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!("failed to open geolocation database {path}: {e}");
                    None
                }
            }
        });

        let hosts = if cfg.local_dns {
            load_hosts_file("/etc/hosts")
        } else {
            HashMap::new()
        };

        let resolver = if cfg.local_dns {
            None
        } else {
            match trust_dns_resolver::Resolver::from_system_conf() {
                Ok(r) => Some(r),
                Err(e) => {
                    debug!("system resolver unavailable: {e}");
                    None
                }
            }
        };

        Resolvers {
            geo,
            local_dns: cfg.local_dns,
            hosts,
            resolver,
        }
    }

    /// Resolver bundle with every backend disabled, for tests
    pub fn disabled() -> Resolvers {
        Resolvers {
            geo: None,
            local_dns: true,
            hosts: HashMap::new(),
            resolver: None,
        }
    }

    /// Geolocate an address
    pub fn lookup_geolocation(&self, ip: IpAddr) -> Option<Geolocation> {
        let reader = self.geo.as_ref()?;
        let city: geoip2::City = reader.lookup(ip).ok()?;

        let country = city
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string())
            .unwrap_or_default();
        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string())
            .unwrap_or_default();

        if country.is_empty() && city_name.is_empty() {
            return None;
        }
        Some(Geolocation {
            country,
            city: city_name,
        })
    }

    /// DNS names for an address, honoring local-DNS mode
    pub fn lookup_dns_names(&self, ip: IpAddr) -> Vec<String> {
        if self.local_dns {
            return self.hosts.get(&ip).cloned().into_iter().collect();
        }

        let resolver = match &self.resolver {
            Some(r) => r,
            None => return Vec::new(),
        };
        match resolver.reverse_lookup(ip) {
            Ok(response) => response
                .iter()
                .map(|name| name.to_string().trim_end_matches('.').to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Description for a JA3 hash; empty when unknown
    pub fn lookup_ja3(&self, hash: &str) -> String {
        JA3_DATABASE
            .iter()
            .find(|(h, _)| *h == hash)
            .map(|(_, desc)| desc.to_string())
            .unwrap_or_default()
    }
}

fn load_hosts_file(path: impl AsRef<Path>) -> HashMap<IpAddr, String> {
    let mut hosts = HashMap::new();
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return hosts,
    };

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let addr = match parts.next().and_then(|a| a.parse::<IpAddr>().ok()) {
            Some(a) => a,
            None => continue,
        };
        if let Some(name) = parts.next() {
            hosts.entry(addr).or_insert_with(|| name.to_string());
        }
    }
    hosts
}
