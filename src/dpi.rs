//! Application-layer protocol identification
//!
//! Lightweight payload and port heuristics used to tag profiles with the
//! protocols an address has spoken. Not a full parser; the stream readers
//! do the real decoding.

use crate::core::{Layer4, Packet};
use crate::tls;

/// One identified protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpiResult {
    pub protocol: &'static str,
    pub category: &'static str,
}

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"OPTI", b"PATC", b"CONN", b"TRAC",
];

/// Identify the protocols spoken in a packet
pub fn get_protocols(packet: &Packet) -> Vec<DpiResult> {
    let mut results = Vec::new();
    let payload = packet.payload();

    match &packet.layer4 {
        Layer4::Tcp(tcp) => {
            if !payload.is_empty() {
                if HTTP_METHODS.iter().any(|m| payload.starts_with(m))
                    || payload.starts_with(b"HTTP/")
                {
                    results.push(DpiResult {
                        protocol: "HTTP",
                        category: "web",
                    });
                }
                if payload.starts_with(b"SSH-") {
                    results.push(DpiResult {
                        protocol: "SSH",
                        category: "remote_access",
                    });
                }
                if tls::parse_client_hello(payload).is_some()
                    || tls::parse_server_hello(payload).is_some()
                {
                    results.push(DpiResult {
                        protocol: "TLS",
                        category: "encryption",
                    });
                }
                if payload.starts_with(b"+OK") && (tcp.src_port == 110 || tcp.dst_port == 110) {
                    results.push(DpiResult {
                        protocol: "POP3",
                        category: "mail",
                    });
                }
                if payload.starts_with(b"220 ") && (tcp.src_port == 25 || tcp.dst_port == 25) {
                    results.push(DpiResult {
                        protocol: "SMTP",
                        category: "mail",
                    });
                }
            }
        }
        Layer4::Udp(udp) => {
            if udp.src_port == 53 || udp.dst_port == 53 {
                results.push(DpiResult {
                    protocol: "DNS",
                    category: "network",
                });
            }
            if udp.src_port == 123 || udp.dst_port == 123 {
                results.push(DpiResult {
                    protocol: "NTP",
                    category: "network",
                });
            }
            if udp.src_port == 67 || udp.dst_port == 67 || udp.dst_port == 68 {
                results.push(DpiResult {
                    protocol: "DHCP",
                    category: "network",
                });
            }
        }
        Layer4::None => {}
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ipv4Info, Layer3, TcpInfo, UdpInfo};
    use chrono::Utc;

    fn tcp_packet(src_port: u16, dst_port: u16, payload: &[u8]) -> Packet {
        Packet {
            timestamp: Utc::now(),
            data_len: payload.len() as u32 + 54,
            layer3: Layer3::Ipv4(Ipv4Info::default()),
            layer4: Layer4::Tcp(TcpInfo {
                src_port,
                dst_port,
                payload: payload.to_vec(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_http_request() {
        let pkt = tcp_packet(40000, 80, b"GET /index.html HTTP/1.1\r\n");
        let protos = get_protocols(&pkt);
        assert!(protos.iter().any(|p| p.protocol == "HTTP"));
    }

    #[test]
    fn test_ssh_banner() {
        let pkt = tcp_packet(22, 40000, b"SSH-2.0-OpenSSH_8.9p1 Ubuntu\r\n");
        let protos = get_protocols(&pkt);
        assert_eq!(protos[0].protocol, "SSH");
        assert_eq!(protos[0].category, "remote_access");
    }

    #[test]
    fn test_tls_client_hello() {
        let payload = crate::tls::build_client_hello("example.org", &[0x1301]);
        let pkt = tcp_packet(40000, 443, &payload);
        assert!(get_protocols(&pkt).iter().any(|p| p.protocol == "TLS"));
    }

    #[test]
    fn test_dns_by_port() {
        let pkt = Packet {
            timestamp: Utc::now(),
            data_len: 60,
            layer3: Layer3::Ipv4(Ipv4Info::default()),
            layer4: Layer4::Udp(UdpInfo {
                src_port: 40000,
                dst_port: 53,
                payload: vec![0; 12],
            }),
        };
        assert!(get_protocols(&pkt).iter().any(|p| p.protocol == "DNS"));
    }

    #[test]
    fn test_unknown_payload() {
        let pkt = tcp_packet(1111, 2222, b"\x00\x01\x02\x03");
        assert!(get_protocols(&pkt).is_empty());
    }
}
