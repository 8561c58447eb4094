//! POP3 stream decoder
//!
//! Parses the greeting banner and files a service record. Mailbox
//! contents are not reconstructed.

use tracing::debug;

use super::{tcp, DecoderSinks};
use crate::error::Result;
use crate::stream::ConnContext;

/// Decode a completed connection as POP3
pub fn decode_pop3(sinks: &DecoderSinks, ctx: &ConnContext) -> Result<()> {
    if !sinks.cfg.decode_pop3 {
        return Ok(());
    }

    let banner: Vec<u8> = ctx
        .server_data
        .iter()
        .flat_map(|d| d.raw.iter().copied())
        .take_while(|&b| b != b'\n')
        .collect();

    if !banner.starts_with(b"+OK") {
        debug!(ident = %ctx.ident, "no POP3 greeting found");
        return Ok(());
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
                dst_port: 110,
            },
            ident: "10.0.0.2:50000 -> 10.0.0.1:110".to_string(),
            first_packet: Utc::now(),
            client_data: Vec::new(),
            server_data: vec![StreamData {
                raw: server_payload.to_vec(),
                ts: Utc::now(),
                dir: Direction::ServerToClient,
            }],
        }
    }

    #[test]
    fn test_pop3_service_recorded() {
        let sinks = sinks();
        decode_pop3(&sinks, &ctx(b"+OK Dovecot POP server ready.\r\n")).unwrap();

        let services = sinks.services.all();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "POP3");
        assert_eq!(services[0].product, "Dovecot");
        assert_eq!(services[0].port, 110);
    }

    #[test]
    fn test_non_pop3_payload_ignored() {
        let sinks = sinks();
        decode_pop3(&sinks, &ctx(b"-ERR busy\r\n")).unwrap();
        assert!(sinks.services.is_empty());
    }
}
