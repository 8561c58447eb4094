//! Flow identity
//!
//! A connection is named by the pair of its network and transport flows,
//! oriented client to server. The canonical ident string derives from that
//! orientation and reverses together with the flow pair.

use std::net::IpAddr;

use super::packet::Packet;

/// Packet direction relative to the connection originator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From client to server
    ClientToServer,
    /// From server to client
    ServerToClient,
}

impl Direction {
    pub fn reverse(&self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Network flow plus transport flow with a canonical direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowPair {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowPair {
    pub fn from_packet(pkt: &Packet) -> FlowPair {
        FlowPair {
            src_ip: pkt.src_ip(),
            dst_ip: pkt.dst_ip(),
            src_port: pkt.src_port(),
            dst_port: pkt.dst_port(),
        }
    }

    /// Flip both the network and the transport flow
    pub fn reverse(&self) -> FlowPair {
        FlowPair {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Canonical identity string in the current orientation
    pub fn ident(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

impl std::fmt::Display for FlowPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ident())
    }
}

/// Reverse an identity string produced by `FlowPair::ident`
pub fn reverse_ident(ident: &str) -> String {
    match ident.split_once(" -> ") {
        Some((a, b)) => format!("{} -> {}", b, a),
        None => ident.to_string(),
    }
}

/// Direction-agnostic pool key (smaller endpoint first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    ip_a: IpAddr,
    ip_b: IpAddr,
    port_a: u16,
    port_b: u16,
}

impl PoolKey {
    pub fn from_packet(pkt: &Packet) -> PoolKey {
        Self::from_flow(&FlowPair::from_packet(pkt))
    }

    pub fn from_flow(flow: &FlowPair) -> PoolKey {
        if (flow.src_ip, flow.src_port) <= (flow.dst_ip, flow.dst_port) {
            PoolKey {
                ip_a: flow.src_ip,
                ip_b: flow.dst_ip,
                port_a: flow.src_port,
                port_b: flow.dst_port,
            }
        } else {
            PoolKey {
                ip_a: flow.dst_ip,
                ip_b: flow.src_ip,
                port_a: flow.dst_port,
                port_b: flow.src_port,
            }
        }
    }
}
