//! IPv4 defragmentation
//!
//! Stateful per-flow-id fragment cache. Returns the reassembled packet
//! once all fragments are present; transient gaps are not errors, but a
//! malformed fragment set (conflicting overlap, oversized reassembly) is.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::core::Ipv4Info;
use crate::error::{NetcapError, Result};

/// Maximum reassembled IPv4 packet size
const MAX_IP_PACKET_SIZE: usize = 65535;

/// Give up on a fragment group after this much capture time
const FRAGMENT_TIMEOUT_SECS: i64 = 30;

/// Expiry sweep cadence, in defragment calls
const CLEANUP_EVERY: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
}

#[derive(Debug)]
struct FragmentGroup {
    first_seen: DateTime<Utc>,
    /// (byte offset, payload)
    fragments: Vec<(usize, Vec<u8>)>,
    seen_last: bool,
    expected_size: Option<usize>,
}

impl FragmentGroup {
    fn new(first_seen: DateTime<Utc>) -> Self {
        Self {
            first_seen,
            fragments: Vec::new(),
            seen_last: false,
            expected_size: None,
        }
    }

    fn add(&mut self, offset: usize, payload: &[u8], more_fragments: bool) -> Result<()> {
        let start = offset;
        let end = offset + payload.len();

        if end > MAX_IP_PACKET_SIZE {
            return Err(NetcapError::Defrag(format!(
                "fragment set exceeds maximum packet size ({end} bytes)"
            )));
        }

        if !more_fragments {
            if self.seen_last && self.expected_size != Some(end) {
                return Err(NetcapError::Defrag(
                    "conflicting final fragments".to_string(),
                ));
            }
            self.seen_last = true;
            self.expected_size = Some(end);
        }

        for (existing_offset, existing) in &self.fragments {
            let existing_start = *existing_offset;
            let existing_end = existing_start + existing.len();

            if start < existing_end && end > existing_start {
                // Exact duplicates are retransmissions; partial overlap is
                // a malformed set
                if start == existing_start && payload == existing.as_slice() {
                    return Ok(());
                }
                return Err(NetcapError::Defrag(format!(
                    "overlapping fragments at offset {start}"
                )));
            }
        }

        self.fragments.push((offset, payload.to_vec()));
        Ok(())
    }

    fn is_complete(&self) -> bool {
        let expected = match self.expected_size {
            Some(e) => e,
            None => return false,
        };

        let mut sorted: Vec<_> = self
            .fragments
            .iter()
            .map(|(o, p)| (*o, p.len()))
            .collect();
        sorted.sort_by_key(|&(offset, _)| offset);

        let mut pos = 0usize;
        for (offset, len) in sorted {
            if offset > pos {
                return false;
            }
            pos = pos.max(offset + len);
        }
        pos >= expected
    }

    fn assemble(mut self) -> Vec<u8> {
        self.fragments.sort_by_key(|&(offset, _)| offset);
        let mut out = Vec::with_capacity(self.expected_size.unwrap_or(0));
        for (_, payload) in self.fragments {
            out.extend_from_slice(&payload);
        }
        out
    }
}

/// Stateful IPv4 defragmenter
#[derive(Debug, Default)]
pub struct Defragmenter {
    groups: HashMap<FragmentKey, FragmentGroup>,
    calls: u64,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one IPv4 packet.
    ///
    /// Unfragmented packets come back unchanged. For fragments, `None`
    /// means more fragments are required; on completion the reassembled
    /// packet is returned with cleared fragmentation fields and an
    /// updated total length.
    pub fn defragment(
        &mut self,
        ipv4: &Ipv4Info,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Ipv4Info>> {
        if !ipv4.is_fragmented() {
            return Ok(Some(ipv4.clone()));
        }

        self.calls += 1;
        if self.calls % CLEANUP_EVERY == 0 {
            self.expire(timestamp);
        }

        let key = FragmentKey {
            src: ipv4.src_addr,
            dst: ipv4.dst_addr,
            id: ipv4.identification,
            protocol: ipv4.protocol,
        };

        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| FragmentGroup::new(timestamp));

        let offset = ipv4.fragment_offset as usize * 8;
        if let Err(e) = group.add(offset, &ipv4.payload, ipv4.more_fragments) {
            self.groups.remove(&key);
            return Err(e);
        }

        if !group.is_complete() {
            debug!(ident = ipv4.identification, "fragment, waiting for more");
            return Ok(None);
        }

        let group = self.groups.remove(&key).expect("group present");
        let payload = group.assemble();

        let mut out = ipv4.clone();
        out.more_fragments = false;
        out.fragment_offset = 0;
        out.total_length = (payload.len() + 20) as u16;
        out.payload = payload;
        Ok(Some(out))
    }

    /// Active fragment groups awaiting completion
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(FRAGMENT_TIMEOUT_SECS);
        self.groups.retain(|_, g| g.first_seen >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(offset_units: u16, payload: &[u8], more: bool) -> Ipv4Info {
        Ipv4Info {
            src_addr: Ipv4Addr::new(192, 168, 1, 1),
            dst_addr: Ipv4Addr::new(10, 0, 0, 1),
            protocol: 17,
            ttl: 64,
            identification: 1234,
            dont_fragment: false,
            more_fragments: more,
            fragment_offset: offset_units,
            total_length: (payload.len() + 20) as u16,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_passthrough_unfragmented() {
        let mut defrag = Defragmenter::new();
        let pkt = frag(0, b"whole", false);
        // offset 0 and no MF: not fragmented at all
        let out = defrag.defragment(&pkt, Utc::now()).unwrap().unwrap();
        assert_eq!(out.payload, b"whole");
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn test_two_fragment_reassembly() {
        let mut defrag = Defragmenter::new();
        let now = Utc::now();

        let first = frag(0, &[1u8; 16], true);
        assert!(defrag.defragment(&first, now).unwrap().is_none());
        assert_eq!(defrag.pending(), 1);

        let second = frag(2, &[2u8; 8], false);
        let out = defrag.defragment(&second, now).unwrap().unwrap();

        assert_eq!(out.payload.len(), 24);
        assert_eq!(&out.payload[..16], &[1u8; 16]);
        assert_eq!(&out.payload[16..], &[2u8; 8]);
        assert!(!out.more_fragments);
        assert_eq!(out.fragment_offset, 0);
        assert_eq!(out.total_length, 44);
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut defrag = Defragmenter::new();
        let now = Utc::now();

        assert!(defrag
            .defragment(&frag(2, &[2u8; 8], false), now)
            .unwrap()
            .is_none());
        let out = defrag
            .defragment(&frag(0, &[1u8; 16], true), now)
            .unwrap()
            .unwrap();
        assert_eq!(out.payload.len(), 24);
    }

    #[test]
    fn test_overlap_is_fatal() {
        let mut defrag = Defragmenter::new();
        let now = Utc::now();

        assert!(defrag
            .defragment(&frag(0, &[1u8; 16], true), now)
            .unwrap()
            .is_none());
        let err = defrag.defragment(&frag(1, &[9u8; 16], true), now);
        assert!(matches!(err, Err(NetcapError::Defrag(_))));
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let mut defrag = Defragmenter::new();
        let now = Utc::now();

        assert!(defrag
            .defragment(&frag(0, &[1u8; 16], true), now)
            .unwrap()
            .is_none());
        assert!(defrag
            .defragment(&frag(0, &[1u8; 16], true), now)
            .unwrap()
            .is_none());
        let out = defrag
            .defragment(&frag(2, &[2u8; 8], false), now)
            .unwrap()
            .unwrap();
        assert_eq!(out.payload.len(), 24);
    }

    #[test]
    fn test_oversized_is_fatal() {
        let mut defrag = Defragmenter::new();
        let pkt = frag(8190, &[0u8; 2000], false);
        assert!(matches!(
            defrag.defragment(&pkt, Utc::now()),
            Err(NetcapError::Defrag(_))
        ));
    }
}
