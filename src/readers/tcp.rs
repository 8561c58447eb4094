//! Generic TCP decoder
//!
//! Banner grab for connections no protocol-specific decoder claimed.
//! Identifies the service from the first server bytes and files a service
//! record.

use regex::Regex;
use std::sync::OnceLock;

use super::{DecoderSinks, ServiceStore};
use crate::error::Result;
use crate::stats::SharedStats;
use crate::stream::ConnContext;
use crate::types::Service;

fn ssh_banner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^SSH-(?P<proto>[0-9.]+)-(?P<product>[A-Za-z][A-Za-z0-9]*)[_-]?(?P<version>\S*)")
            .expect("static regex")
    })
}

fn server_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^Server:\s*(?P<product>[^/\r\n ]+)(?:/(?P<version>\S+))?")
            .expect("static regex")
    })
}

/// Identify a service from its banner bytes
pub fn identify_banner(banner: &[u8]) -> (String, String, String) {
    let text = String::from_utf8_lossy(banner);

    if let Some(caps) = ssh_banner_re().captures(&text) {
        return (
            "SSH".to_string(),
            caps.name("product")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            caps.name("version")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        );
    }

    if text.starts_with("HTTP/") || text.contains("\r\nServer:") || text.contains("\nServer:") {
        let (product, version) = server_header_re()
            .captures(&text)
            .map(|caps| {
                (
                    caps.name("product")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                    caps.name("version")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                )
            })
            .unwrap_or_default();
        return ("HTTP".to_string(), product, version);
    }

    if text.starts_with("+OK") {
        let product = if text.contains("Dovecot") {
            "Dovecot".to_string()
        } else {
            String::new()
        };
        return ("POP3".to_string(), product, String::new());
    }

    if text.starts_with("220 ") || text.starts_with("220-") {
        return ("SMTP".to_string(), String::new(), String::new());
    }

    (String::new(), String::new(), String::new())
}

/// Build a service record from a completed connection's server side
pub fn service_from_banner(ctx: &ConnContext, banner: &[u8]) -> Service {
    let (name, product, version) = identify_banner(banner);
    let bytes_client: u64 = ctx.client_data.iter().map(|d| d.raw.len() as u64).sum();
    let bytes_server: u64 = ctx.server_data.iter().map(|d| d.raw.len() as u64).sum();

    Service {
        timestamp: Some(ctx.first_packet),
        name,
        product,
        vendor: String::new(),
        version,
        protocol: "TCP".to_string(),
        ip: ctx.flow.dst_ip.to_string(),
        port: ctx.flow.dst_port,
        hostname: String::new(),
        bytes_client,
        bytes_server,
        banner: String::from_utf8_lossy(banner).to_string(),
    }
}

/// Persist the server banner as a service record
pub fn save_service_banner(
    store: &ServiceStore,
    stats: &SharedStats,
    ctx: &ConnContext,
    banner: &[u8],
) {
    if banner.is_empty() {
        return;
    }
    let service = service_from_banner(ctx, banner);
    if store.put(service) {
        stats.update(|s| s.num_services += 1);
    }
}

/// Decode a completed connection as a raw TCP banner grab
pub fn decode_tcp(sinks: &DecoderSinks, ctx: &ConnContext) -> Result<()> {
    let banner: Vec<u8> = ctx
        .server_data
        .iter()
        .flat_map(|d| d.raw.iter().copied())
        .take(crate::stream::reader::SERVICE_BANNER_SIZE)
        .collect();
    save_service_banner(&sinks.services, &sinks.stats, ctx, &banner);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_ssh_banner() {
        let (name, product, version) = identify_banner(b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3\r\n");
        assert_eq!(name, "SSH");
        assert_eq!(product, "OpenSSH");
        assert_eq!(version, "8.9p1");
    }

    #[test]
    fn test_identify_http_server() {
        let (name, product, version) =
            identify_banner(b"HTTP/1.1 200 OK\r\nServer: nginx/1.24.0\r\n\r\n");
        assert_eq!(name, "HTTP");
        assert_eq!(product, "nginx");
        assert_eq!(version, "1.24.0");
    }

    #[test]
    fn test_identify_pop3() {
        let (name, product, _) = identify_banner(b"+OK Dovecot ready.\r\n");
        assert_eq!(name, "POP3");
        assert_eq!(product, "Dovecot");
    }

    #[test]
    fn test_identify_unknown() {
        let (name, product, version) = identify_banner(&[0x16, 0x03, 0x01]);
        assert!(name.is_empty());
        assert!(product.is_empty());
        assert!(version.is_empty());
    }
}
