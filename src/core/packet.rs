//! Unified packet representation
//!
//! One immutable capture unit: timestamp, parsed layers and owned payload.
//! Parsing is backed by etherparse; the engine consumes packets strictly in
//! capture order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use etherparse::SlicedPacket;

use crate::error::{NetcapError, Result};

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn {
            s.push('S');
        }
        if self.ack {
            s.push('A');
        }
        if self.fin {
            s.push('F');
        }
        if self.rst {
            s.push('R');
        }
        if self.psh {
            s.push('P');
        }
        if self.urg {
            s.push('U');
        }
        if s.is_empty() {
            s.push('.');
        }
        write!(f, "{}", s)
    }
}

/// IPv4 layer info
#[derive(Debug, Clone)]
pub struct Ipv4Info {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub identification: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in 8-byte units
    pub fragment_offset: u16,
    /// Total length field (header + payload)
    pub total_length: u16,
    /// IP payload bytes (the fragment body for fragmented packets)
    pub payload: Vec<u8>,
}

impl Default for Ipv4Info {
    fn default() -> Self {
        Ipv4Info {
            src_addr: Ipv4Addr::new(0, 0, 0, 0),
            dst_addr: Ipv4Addr::new(0, 0, 0, 0),
            protocol: 0,
            ttl: 0,
            identification: 0,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            total_length: 0,
            payload: Vec::new(),
        }
    }
}

impl Ipv4Info {
    pub fn is_fragmented(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

/// IPv6 layer info (no defragmentation support)
#[derive(Debug, Clone)]
pub struct Ipv6Info {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
}

/// IP layer
#[derive(Debug, Clone)]
pub enum Layer3 {
    Ipv4(Ipv4Info),
    Ipv6(Ipv6Info),
}

impl Layer3 {
    pub fn src_ip(&self) -> IpAddr {
        match self {
            Layer3::Ipv4(i) => IpAddr::V4(i.src_addr),
            Layer3::Ipv6(i) => IpAddr::V6(i.src_addr),
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match self {
            Layer3::Ipv4(i) => IpAddr::V4(i.dst_addr),
            Layer3::Ipv6(i) => IpAddr::V6(i.dst_addr),
        }
    }

    pub fn as_ipv4(&self) -> Option<&Ipv4Info> {
        match self {
            Layer3::Ipv4(i) => Some(i),
            Layer3::Ipv6(_) => None,
        }
    }
}

/// TCP layer info
#[derive(Debug, Clone, Default)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: TcpFlags,
    /// Raw option bytes as they appeared on the wire
    pub options_raw: Vec<u8>,
    /// Checksum validity; `None` when verification was not requested
    pub checksum_valid: Option<bool>,
    pub payload: Vec<u8>,
}

/// UDP layer info
#[derive(Debug, Clone, Default)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Transport layer
#[derive(Debug, Clone)]
pub enum Layer4 {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    /// Non-TCP/UDP or payload still fragmented
    None,
}

impl Layer4 {
    pub fn as_tcp(&self) -> Option<&TcpInfo> {
        match self {
            Layer4::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_udp(&self) -> Option<&UdpInfo> {
        match self {
            Layer4::Udp(u) => Some(u),
            _ => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Layer4::Tcp(_))
    }
}

/// Unified packet representation
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Captured frame length
    pub data_len: u32,
    pub layer3: Layer3,
    pub layer4: Layer4,
}

impl Packet {
    /// Parse an Ethernet frame into a packet.
    ///
    /// Checksum verification is only performed when requested; the result
    /// lands in `TcpInfo::checksum_valid`.
    pub fn parse(data: &[u8], timestamp: DateTime<Utc>, verify_checksum: bool) -> Result<Packet> {
        let sliced = SlicedPacket::from_ethernet(data)
            .map_err(|e| NetcapError::Malformed(format!("ethernet decode: {e}")))?;

        let layer3 = match &sliced.net {
            Some(etherparse::NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                Layer3::Ipv4(Ipv4Info {
                    src_addr: header.source_addr(),
                    dst_addr: header.destination_addr(),
                    protocol: header.protocol().0,
                    ttl: header.ttl(),
                    identification: header.identification(),
                    dont_fragment: header.dont_fragment(),
                    more_fragments: header.more_fragments(),
                    fragment_offset: header.fragments_offset().value(),
                    total_length: header.total_len(),
                    payload: ipv4.payload().payload.to_vec(),
                })
            }
            Some(etherparse::NetSlice::Ipv6(ipv6)) => {
                let header = ipv6.header();
                Layer3::Ipv6(Ipv6Info {
                    src_addr: header.source_addr(),
                    dst_addr: header.destination_addr(),
                    next_header: header.next_header().0,
                    hop_limit: header.hop_limit(),
                })
            }
            _ => return Err(NetcapError::Malformed("no IP layer".to_string())),
        };

        let layer4 = match &sliced.transport {
            Some(etherparse::TransportSlice::Tcp(tcp)) => {
                let checksum_valid = if verify_checksum {
                    Some(verify_tcp_checksum(&layer3, tcp.slice()))
                } else {
                    None
                };
                Layer4::Tcp(TcpInfo {
                    src_port: tcp.source_port(),
                    dst_port: tcp.destination_port(),
                    seq: tcp.sequence_number(),
                    ack: tcp.acknowledgment_number(),
                    window: tcp.window_size(),
                    flags: TcpFlags {
                        fin: tcp.fin(),
                        syn: tcp.syn(),
                        rst: tcp.rst(),
                        psh: tcp.psh(),
                        ack: tcp.ack(),
                        urg: tcp.urg(),
                        ece: tcp.ece(),
                        cwr: tcp.cwr(),
                    },
                    options_raw: tcp.options().to_vec(),
                    checksum_valid,
                    payload: tcp.payload().to_vec(),
                })
            }
            Some(etherparse::TransportSlice::Udp(udp)) => Layer4::Udp(UdpInfo {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
                payload: udp.payload().to_vec(),
            }),
            _ => Layer4::None,
        };

        Ok(Packet {
            timestamp,
            data_len: data.len() as u32,
            layer3,
            layer4,
        })
    }

    /// Re-decode the transport layer from the IP payload.
    ///
    /// Used after defragmentation produced a complete IPv4 packet whose
    /// next layer could not be parsed from any single fragment.
    pub fn rebuild_transport(&mut self, verify_checksum: bool) -> Result<()> {
        let (protocol, payload) = match &self.layer3 {
            Layer3::Ipv4(info) => (info.protocol, info.payload.clone()),
            Layer3::Ipv6(_) => return Ok(()),
        };

        self.layer4 = match protocol {
            6 => {
                let (header, rest) = etherparse::TcpHeader::from_slice(&payload)
                    .map_err(|e| NetcapError::Malformed(format!("tcp decode: {e}")))?;
                let header_len = payload.len() - rest.len();
                let checksum_valid = if verify_checksum {
                    Some(verify_tcp_checksum(&self.layer3, &payload))
                } else {
                    None
                };
                Layer4::Tcp(TcpInfo {
                    src_port: header.source_port,
                    dst_port: header.destination_port,
                    seq: header.sequence_number,
                    ack: header.acknowledgment_number,
                    window: header.window_size,
                    flags: TcpFlags {
                        fin: header.fin,
                        syn: header.syn,
                        rst: header.rst,
                        psh: header.psh,
                        ack: header.ack,
                        urg: header.urg,
                        ece: header.ece,
                        cwr: header.cwr,
                    },
                    options_raw: payload[20..header_len].to_vec(),
                    checksum_valid,
                    payload: rest.to_vec(),
                })
            }
            17 => {
                let (header, rest) = etherparse::UdpHeader::from_slice(&payload)
                    .map_err(|e| NetcapError::Malformed(format!("udp decode: {e}")))?;
                Layer4::Udp(UdpInfo {
                    src_port: header.source_port,
                    dst_port: header.destination_port,
                    payload: rest.to_vec(),
                })
            }
            _ => Layer4::None,
        };

        Ok(())
    }

    pub fn src_ip(&self) -> IpAddr {
        self.layer3.src_ip()
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.layer3.dst_ip()
    }

    pub fn src_port(&self) -> u16 {
        match &self.layer4 {
            Layer4::Tcp(t) => t.src_port,
            Layer4::Udp(u) => u.src_port,
            Layer4::None => 0,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match &self.layer4 {
            Layer4::Tcp(t) => t.dst_port,
            Layer4::Udp(u) => u.dst_port,
            Layer4::None => 0,
        }
    }

    pub fn tcp(&self) -> Option<&TcpInfo> {
        self.layer4.as_tcp()
    }

    pub fn udp(&self) -> Option<&UdpInfo> {
        self.layer4.as_udp()
    }

    pub fn is_tcp(&self) -> bool {
        self.layer4.is_tcp()
    }

    pub fn has_transport(&self) -> bool {
        !matches!(self.layer4, Layer4::None)
    }

    /// Application payload of the transport layer
    pub fn payload(&self) -> &[u8] {
        match &self.layer4 {
            Layer4::Tcp(t) => &t.payload,
            Layer4::Udp(u) => &u.payload,
            Layer4::None => &[],
        }
    }
}

/// One's-complement checksum of the TCP segment over the network
/// pseudo-header. Returns true when the stored checksum verifies.
fn verify_tcp_checksum(layer3: &Layer3, tcp_segment: &[u8]) -> bool {
    let mut sum: u32 = 0;

    fn add_bytes(sum: &mut u32, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for c in &mut chunks {
            *sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
        }
        if let [last] = chunks.remainder() {
            *sum += u32::from(u16::from_be_bytes([*last, 0]));
        }
    }

    match layer3 {
        Layer3::Ipv4(info) => {
            add_bytes(&mut sum, &info.src_addr.octets());
            add_bytes(&mut sum, &info.dst_addr.octets());
            sum += 6u32; // protocol
            sum += tcp_segment.len() as u32;
        }
        Layer3::Ipv6(info) => {
            add_bytes(&mut sum, &info.src_addr.octets());
            add_bytes(&mut sum, &info.dst_addr.octets());
            sum += tcp_segment.len() as u32;
            sum += 6u32;
        }
    }

    add_bytes(&mut sum, tcp_segment);

    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16 == 0xFFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn build_tcp(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 1], [192, 168, 1, 2], 64)
            .tcp(40000, 80, 1000, 4096);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    #[test]
    fn test_parse_tcp() {
        let data = build_tcp(b"hello");
        let pkt = Packet::parse(&data, Utc::now(), false).unwrap();

        assert!(pkt.is_tcp());
        assert_eq!(pkt.src_port(), 40000);
        assert_eq!(pkt.dst_port(), 80);
        assert_eq!(pkt.payload(), b"hello");
        assert_eq!(pkt.src_ip().to_string(), "192.168.1.1");
        assert!(pkt.tcp().unwrap().checksum_valid.is_none());
    }

    #[test]
    fn test_checksum_valid() {
        let data = build_tcp(b"payload bytes");
        let pkt = Packet::parse(&data, Utc::now(), true).unwrap();
        assert_eq!(pkt.tcp().unwrap().checksum_valid, Some(true));
    }

    #[test]
    fn test_checksum_corrupted() {
        let mut data = build_tcp(b"payload bytes");
        // Flip a bit inside the TCP checksum field (eth 14 + ip 20 + 16)
        data[14 + 20 + 16] ^= 0xFF;
        let pkt = Packet::parse(&data, Utc::now(), true).unwrap();
        assert_eq!(pkt.tcp().unwrap().checksum_valid, Some(false));
    }

    #[test]
    fn test_parse_udp() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(5353, 53);
        let mut data = Vec::new();
        builder.write(&mut data, b"query").unwrap();

        let pkt = Packet::parse(&data, Utc::now(), false).unwrap();
        assert!(!pkt.is_tcp());
        assert_eq!(pkt.udp().unwrap().dst_port, 53);
        assert_eq!(pkt.payload(), b"query");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Packet::parse(&[0u8; 4], Utc::now(), false).is_err());
    }
}
