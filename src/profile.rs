//! Per-IP behavioral profiles
//!
//! Process-wide map from source address to a mutable profile aggregate.
//! The registry mutex is held only to locate or install an entry; all field
//! updates for a packet happen atomically under the per-profile mutex.
//! Profiles live for the process lifetime and are never evicted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{Layer4, Packet};
use crate::dpi;
use crate::resolvers::Resolvers;
use crate::tls;
use crate::types::{IpProfile, Port, Protocol};

/// One profile entry with its own lock
pub struct Profile {
    inner: Mutex<IpProfile>,
}

impl Profile {
    /// Snapshot of the current profile state
    pub fn snapshot(&self) -> IpProfile {
        self.inner.lock().clone()
    }
}

/// Registry of all profiles keyed by source address
pub struct ProfileRegistry {
    items: Mutex<HashMap<String, Arc<Profile>>>,
    resolvers: Resolvers,
}

impl ProfileRegistry {
    pub fn new(resolvers: Resolvers) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            resolvers,
        }
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Fetch a known profile and update it, or install a new one
    pub fn observe(&self, packet: &Packet) -> Option<Arc<Profile>> {
        let addr = packet.src_ip().to_string();
        if addr.is_empty() {
            return None;
        }

        let existing = {
            let items = self.items.lock();
            items.get(&addr).cloned()
        };

        if let Some(profile) = existing {
            self.update(&profile, packet);
            return Some(profile);
        }

        let profile = Arc::new(Profile {
            inner: Mutex::new(self.build(&addr, packet)),
        });

        let mut items = self.items.lock();
        // Lost the install race: update the winner instead
        if let Some(winner) = items.get(&addr).cloned() {
            drop(items);
            self.update(&winner, packet);
            return Some(winner);
        }
        items.insert(addr, profile.clone());
        drop(items);

        Some(profile)
    }

    /// Snapshots of every profile, sorted by address
    pub fn snapshots(&self) -> Vec<IpProfile> {
        let items: Vec<Arc<Profile>> = self.items.lock().values().cloned().collect();
        let mut out: Vec<IpProfile> = items.iter().map(|p| p.snapshot()).collect();
        out.sort_by(|a, b| a.addr.cmp(&b.addr));
        out
    }

    fn update(&self, profile: &Profile, packet: &Packet) {
        let data_len = packet.data_len as u64;
        let mut p = profile.inner.lock();

        p.num_packets += 1;
        p.bytes += data_len;
        p.timestamp_last = Some(packet.timestamp);

        match &packet.layer4 {
            Layer4::Tcp(tcp) => {
                bump_port(&mut p.src_ports, tcp.src_port, data_len, true);
                bump_port(&mut p.dst_ports, tcp.dst_port, data_len, true);
            }
            Layer4::Udp(udp) => {
                bump_port(&mut p.src_ports, udp.src_port, data_len, false);
                bump_port(&mut p.dst_ports, udp.dst_port, data_len, false);
            }
            Layer4::None => {}
        }

        self.update_tls(&mut p, packet);
        self.update_dpi(&mut p, packet);
    }

    fn build(&self, addr: &str, packet: &Packet) -> IpProfile {
        let data_len = packet.data_len as u64;

        let mut src_ports = HashMap::new();
        let mut dst_ports = HashMap::new();
        match &packet.layer4 {
            Layer4::Tcp(tcp) => {
                bump_port(&mut src_ports, tcp.src_port, data_len, true);
                bump_port(&mut dst_ports, tcp.dst_port, data_len, true);
            }
            Layer4::Udp(udp) => {
                bump_port(&mut src_ports, udp.src_port, data_len, false);
                bump_port(&mut dst_ports, udp.dst_port, data_len, false);
            }
            Layer4::None => {}
        }

        let mut profile = IpProfile {
            addr: addr.to_string(),
            timestamp_first: Some(packet.timestamp),
            timestamp_last: Some(packet.timestamp),
            num_packets: 1,
            bytes: data_len,
            dns_names: self.resolvers.lookup_dns_names(packet.src_ip()),
            geolocation: self.resolvers.lookup_geolocation(packet.src_ip()),
            src_ports,
            dst_ports,
            ..Default::default()
        };

        self.update_tls(&mut profile, packet);
        self.update_dpi(&mut profile, packet);
        profile
    }

    fn update_tls(&self, p: &mut IpProfile, packet: &Packet) {
        let payload = packet.payload();
        if payload.is_empty() {
            return;
        }

        if let Some(hello) = tls::parse_client_hello(payload) {
            if let Some(sni) = &hello.sni {
                *p.snis.entry(sni.clone()).or_insert(0) += 1;
            }
            if let Some(ja3) = &hello.ja3 {
                if !p.ja3.contains_key(&ja3.hash) {
                    let desc = self.resolvers.lookup_ja3(&ja3.hash);
                    p.ja3.insert(ja3.hash.clone(), desc);
                }
            }
        } else if let Some(hello) = tls::parse_server_hello(payload) {
            if let Some(ja3s) = &hello.ja3s {
                if !p.ja3.contains_key(&ja3s.hash) {
                    let desc = self.resolvers.lookup_ja3(&ja3s.hash);
                    p.ja3.insert(ja3s.hash.clone(), desc);
                }
            }
        }
    }

    fn update_dpi(&self, p: &mut IpProfile, packet: &Packet) {
        for result in dpi::get_protocols(packet) {
            match p.protocols.get_mut(result.protocol) {
                Some(proto) => proto.packets += 1,
                None => {
                    p.protocols.insert(
                        result.protocol.to_string(),
                        Protocol {
                            packets: 1,
                            category: result.category.to_string(),
                        },
                    );
                }
            }
        }
    }
}

fn bump_port(ports: &mut HashMap<String, Port>, port: u16, data_len: u64, is_tcp: bool) {
    let entry = ports.entry(port.to_string()).or_default();
    entry.bytes += data_len;
    if is_tcp {
        entry.num_tcp += 1;
    } else {
        entry.num_udp += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Ipv4Info, Layer3, TcpInfo};
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn packet(src_port: u16, dst_port: u16, payload: Vec<u8>) -> Packet {
        Packet {
            timestamp: Utc::now(),
            data_len: 54 + payload.len() as u32,
            layer3: Layer3::Ipv4(Ipv4Info {
                src_addr: Ipv4Addr::new(192, 168, 1, 50),
                dst_addr: Ipv4Addr::new(10, 0, 0, 1),
                protocol: 6,
                ..Default::default()
            }),
            layer4: Layer4::Tcp(TcpInfo {
                src_port,
                dst_port,
                payload,
                ..Default::default()
            }),
        }
    }

    fn registry() -> ProfileRegistry {
        ProfileRegistry::new(Resolvers::disabled())
    }

    #[test]
    fn test_install_and_update() {
        let reg = registry();

        let p1 = packet(40000, 80, Vec::new());
        reg.observe(&p1).unwrap();
        assert_eq!(reg.size(), 1);

        let p2 = packet(40000, 443, Vec::new());
        let profile = reg.observe(&p2).unwrap();
        assert_eq!(reg.size(), 1);

        let snap = profile.snapshot();
        assert_eq!(snap.num_packets, 2);
        assert_eq!(snap.bytes, (p1.data_len + p2.data_len) as u64);
        assert_eq!(snap.src_ports.get("40000").unwrap().num_tcp, 2);
        assert!(snap.dst_ports.contains_key("80"));
        assert!(snap.dst_ports.contains_key("443"));
    }

    #[test]
    fn test_byte_port_consistency() {
        let reg = registry();
        for i in 0..5 {
            reg.observe(&packet(40000 + i, 80, vec![0; 100]));
        }

        let snap = reg.snapshots().remove(0);
        let port_sum: u64 = snap
            .src_ports
            .values()
            .chain(snap.dst_ports.values())
            .map(|p| p.bytes)
            .sum();
        assert_eq!(snap.bytes, port_sum / 2);
    }

    #[test]
    fn test_duplicate_ja3_single_entry() {
        let reg = registry();
        let hello = crate::tls::build_client_hello("example.com", &[0x1301]);

        reg.observe(&packet(40000, 443, hello.clone()));
        let profile = reg.observe(&packet(40001, 443, hello)).unwrap();

        let snap = profile.snapshot();
        assert_eq!(snap.ja3.len(), 1);
        assert_eq!(snap.snis.values().sum::<i64>(), 2);
        assert_eq!(snap.snis.len(), 1);
    }

    #[test]
    fn test_profiles_grow_only() {
        let reg = registry();
        reg.observe(&packet(1, 2, Vec::new()));
        reg.observe(&packet(3, 4, Vec::new()));

        let snap = reg.snapshots().remove(0);
        assert_eq!(snap.src_ports.len(), 2);
        assert_eq!(snap.dst_ports.len(), 2);
        assert!(snap.timestamp_first <= snap.timestamp_last);
    }
}
