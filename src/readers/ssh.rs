//! SSH stream decoder
//!
//! Protocol identification stops at the version exchange; the banner names
//! the implementation on each side and everything after the key exchange
//! is opaque.

use tracing::debug;

use super::{tcp, DecoderSinks};
use crate::error::Result;
use crate::stream::ConnContext;

/// Decode a completed connection as SSH
pub fn decode_ssh(sinks: &DecoderSinks, ctx: &ConnContext) -> Result<()> {
    if !sinks.cfg.decode_ssh {
        return Ok(());
    }

    let banner: Vec<u8> = ctx
        .server_data
        .iter()
        .flat_map(|d| d.raw.iter().copied())
        .take_while(|&b| b != b'\n')
        .collect();

    if !banner.starts_with(b"SSH-") {
        debug!(ident = %ctx.ident, "no SSH version exchange found");
        return Ok(());
    }

    if let Some(client_banner) = ctx
        .client_data
        .first()
        .filter(|d| d.raw.starts_with(b"SSH-"))
    {
        let client_line: Vec<u8> = client_banner
            .raw
            .iter()
            .copied()
            .take_while(|&b| b != b'\n')
            .collect();
        debug!(
            ident = %ctx.ident,
            client = %String::from_utf8_lossy(&client_line).trim_end(),
            "SSH client version exchange"
        );
    }

    tcp::save_service_banner(&sinks.services, &sinks.stats, ctx, &banner);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::{Direction, FlowPair};
    use crate::readers::{HttpPairing, ServiceStore};
    use crate::stats::{ErrorMap, SharedStats};
    use crate::stream::StreamData;
    use chrono::Utc;
    use std::sync::Arc;

    fn sinks() -> DecoderSinks {
        DecoderSinks {
            cfg: Arc::new(Config::default()),
            stats: Arc::new(SharedStats::new()),
            errors: Arc::new(ErrorMap::new()),
            http: Arc::new(HttpPairing::new()),
            services: Arc::new(ServiceStore::new()),
            http_writer: None,
        }
    }

    fn ctx(server_payload: &[u8]) -> ConnContext {
        ConnContext {
            flow: FlowPair {
                src_ip: "10.0.0.2".parse().unwrap(),
                dst_ip: "10.0.0.1".parse().unwrap(),
                src_port: 50000,
                dst_port: 22,
            },
            ident: "10.0.0.2:50000 -> 10.0.0.1:22".to_string(),
            first_packet: Utc::now(),
            client_data: vec![StreamData {
                raw: b"SSH-2.0-libssh_0.10.4\r\n".to_vec(),
                ts: Utc::now(),
                dir: Direction::ClientToServer,
            }],
            server_data: vec![StreamData {
                raw: server_payload.to_vec(),
                ts: Utc::now(),
                dir: Direction::ServerToClient,
            }],
        }
    }

    #[test]
    fn test_ssh_service_recorded() {
        let sinks = sinks();
        decode_ssh(&sinks, &ctx(b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3\r\nmore")).unwrap();

        let services = sinks.services.all();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "SSH");
        assert_eq!(services[0].product, "OpenSSH");
        assert_eq!(services[0].port, 22);
        assert_eq!(sinks.stats.snapshot().num_services, 1);
    }

    #[test]
    fn test_non_ssh_payload_ignored() {
        let sinks = sinks();
        decode_ssh(&sinks, &ctx(b"220 mail ESMTP\r\n")).unwrap();
        assert!(sinks.services.is_empty());
    }
}
