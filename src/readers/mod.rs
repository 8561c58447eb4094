//! Protocol decoders
//!
//! One decoder per supported application protocol. The stream factory
//! picks an initial decoder from the destination port; at connection
//! completion the server banner may upgrade a generic TCP decoder to a
//! protocol-specific one.

pub mod http;
pub mod pop3;
pub mod ssh;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::stats::{ErrorMap, SharedStats};
use crate::stream::ConnContext;
use crate::types::Service;
use crate::writer::Writer;

pub use http::HttpPairing;

/// Decoder attached to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    RawTcp,
    Http,
    Ssh,
    Pop3,
    /// Encrypted HTTP; accounted but bodies are skipped
    HttpsOpaque,
}

impl DecoderKind {
    /// Initial decoder selection by well-known destination port
    pub fn for_port(dst_port: u16) -> DecoderKind {
        match dst_port {
            80 => DecoderKind::Http,
            22 => DecoderKind::Ssh,
            110 => DecoderKind::Pop3,
            443 => DecoderKind::HttpsOpaque,
            _ => DecoderKind::RawTcp,
        }
    }

    /// Upgrade a generic TCP decoder by sniffing the server banner
    pub fn sniff_banner(self, banner: &[u8]) -> DecoderKind {
        if self != DecoderKind::RawTcp {
            return self;
        }
        if contains(banner, b"HTTP") {
            DecoderKind::Http
        } else if contains(banner, b"SSH") {
            DecoderKind::Ssh
        } else if contains(banner, b"POP server ready") {
            DecoderKind::Pop3
        } else {
            DecoderKind::RawTcp
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Shared sinks handed to every decoder
pub struct DecoderSinks {
    pub cfg: Arc<Config>,
    pub stats: Arc<SharedStats>,
    pub errors: Arc<ErrorMap>,
    pub http: Arc<HttpPairing>,
    pub services: Arc<ServiceStore>,
    pub http_writer: Option<Arc<Writer>>,
}

/// Run the decoder chosen for a completed connection
pub fn decode(kind: DecoderKind, sinks: &DecoderSinks, ctx: &ConnContext) -> Result<()> {
    match kind {
        DecoderKind::Http => http::decode_http(sinks, ctx),
        DecoderKind::Ssh => ssh::decode_ssh(sinks, ctx),
        DecoderKind::Pop3 => pop3::decode_pop3(sinks, ctx),
        DecoderKind::RawTcp => tcp::decode_tcp(sinks, ctx),
        DecoderKind::HttpsOpaque => Ok(()),
    }
}

/// Deduplicating store of identified services, keyed by ip:port
#[derive(Default)]
pub struct ServiceStore {
    inner: Mutex<HashMap<String, Service>>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a service or merge byte counters into the known entry.
    /// Returns true when the service was new.
    pub fn put(&self, service: Service) -> bool {
        let key = format!("{}:{}", service.ip, service.port);
        let mut inner = self.inner.lock();
        match inner.get_mut(&key) {
            Some(existing) => {
                existing.bytes_client += service.bytes_client;
                existing.bytes_server += service.bytes_server;
                if existing.banner.is_empty() {
                    existing.banner = service.banner;
                }
                false
            }
            None => {
                inner.insert(key, service);
                true
            }
        }
    }

    /// All services sorted by ip:port
    pub fn all(&self) -> Vec<Service> {
        let inner = self.inner.lock();
        let mut out: Vec<Service> = inner.values().cloned().collect();
        out.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_for_port() {
        assert_eq!(DecoderKind::for_port(80), DecoderKind::Http);
        assert_eq!(DecoderKind::for_port(22), DecoderKind::Ssh);
        assert_eq!(DecoderKind::for_port(110), DecoderKind::Pop3);
        assert_eq!(DecoderKind::for_port(443), DecoderKind::HttpsOpaque);
        assert_eq!(DecoderKind::for_port(12345), DecoderKind::RawTcp);
    }

    #[test]
    fn test_banner_sniffing() {
        let raw = DecoderKind::RawTcp;
        assert_eq!(raw.sniff_banner(b"HTTP/1.1 200 OK"), DecoderKind::Http);
        assert_eq!(raw.sniff_banner(b"SSH-2.0-OpenSSH_8.9"), DecoderKind::Ssh);
        assert_eq!(
            raw.sniff_banner(b"+OK Dovecot POP server ready"),
            DecoderKind::Pop3
        );
        assert_eq!(raw.sniff_banner(b"\x00\x01binary"), DecoderKind::RawTcp);

        // Sniffing never downgrades an explicit selection
        assert_eq!(
            DecoderKind::Ssh.sniff_banner(b"HTTP/1.1 200 OK"),
            DecoderKind::Ssh
        );
    }

    #[test]
    fn test_service_store_dedup() {
        let store = ServiceStore::new();
        let svc = Service {
            ip: "10.0.0.1".to_string(),
            port: 22,
            name: "SSH".to_string(),
            bytes_client: 10,
            bytes_server: 20,
            ..Default::default()
        };
        assert!(store.put(svc.clone()));
        assert!(!store.put(svc));

        let all = store.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bytes_client, 20);
        assert_eq!(all[0].bytes_server, 40);
    }
}
