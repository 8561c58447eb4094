//! Core packet and flow types

pub mod flow;
pub mod packet;

pub use flow::{Direction, FlowPair, PoolKey};
pub use packet::{Ipv4Info, Ipv6Info, Layer3, Layer4, Packet, TcpFlags, TcpInfo, UdpInfo};
