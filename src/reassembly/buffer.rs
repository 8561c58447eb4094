//! Per-direction sequence buffer
//!
//! Orders TCP payload by sequence number, trims overlap (earliest arrival
//! wins), queues out-of-order segments and hands back contiguous runs as
//! scatter-gather deliveries with per-delivery statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Offset added to the first sequence number so extended positions can
/// wander backwards without underflow
const SEQ_BASE_OFFSET: u64 = 1 << 32;

#[derive(Debug)]
struct Queued {
    data: Vec<u8>,
    ts: DateTime<Utc>,
    out_of_order: bool,
}

/// One in-order byte range presented to the stream consumer
#[derive(Debug)]
pub struct Delivery {
    pub data: Vec<u8>,
    /// Capture timestamp of the newest contributing segment
    pub ts: DateTime<Utc>,
    /// Contiguous pieces merged into this delivery
    pub chunks: u64,
    /// Segments contributing to this delivery
    pub packets: u64,
    /// Missing byte count before this delivery; -1 when the stream start
    /// was never observed
    pub skip: i64,
    /// First delivery for this direction
    pub start: bool,
    pub queued_bytes: u64,
    pub queued_packets: u64,
    pub overlap_bytes: u64,
    pub overlap_packets: u64,
}

/// Sequence-ordered buffer for one direction of a connection
#[derive(Debug, Default)]
pub struct StreamBuffer {
    /// Extended sequence position expected next; None until the first
    /// accepted segment
    next: Option<u64>,
    saw_start: bool,
    delivered_any: bool,
    queued: BTreeMap<u64, Queued>,
    pending_ooo_bytes: u64,
    pending_ooo_packets: u64,
    pending_overlap_bytes: u64,
    pending_overlap_packets: u64,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes queued but not yet deliverable
    pub fn pending_bytes(&self) -> u64 {
        self.queued.values().map(|q| q.data.len() as u64).sum()
    }

    pub fn has_pending(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Map a 32-bit sequence number onto the extended position closest to
    /// the current expectation
    fn extend_seq(&self, next: u64, seq: u32) -> u64 {
        let base = next & !0xFFFF_FFFFu64;
        let candidate = base | u64::from(seq);
        let prev = candidate.wrapping_sub(1 << 32);
        let succ = candidate + (1 << 32);

        let dist = |a: u64| a.abs_diff(next);
        let mut best = candidate;
        if prev < candidate && dist(prev) < dist(best) {
            best = prev;
        }
        if dist(succ) < dist(best) {
            best = succ;
        }
        best
    }

    /// Insert one segment's payload. SYN segments consume a sequence
    /// number before any payload.
    pub fn insert(&mut self, seq: u32, syn: bool, data: &[u8], ts: DateTime<Utc>) {
        let next = match self.next {
            Some(n) => n,
            None => {
                let start = SEQ_BASE_OFFSET + u64::from(seq) + u64::from(syn);
                self.saw_start = syn;
                self.next = Some(start);
                start
            }
        };
        let next = self.next.unwrap_or(next);

        if data.is_empty() {
            return;
        }

        let mut start = self.extend_seq(next, seq) + u64::from(syn);
        let mut end = start + data.len() as u64;
        let mut data = data;
        let mut overlapped = false;

        // Trim against already delivered bytes
        if start < next {
            let cut = (next - start).min(data.len() as u64);
            self.pending_overlap_bytes += cut;
            overlapped = true;
            data = &data[cut as usize..];
            start += cut;
        }

        // Trim against the nearest queued segment starting before us
        if let Some((&qstart, q)) = self.queued.range(..start).next_back() {
            let qend = qstart + q.data.len() as u64;
            if qend > start {
                let cut = (qend - start).min(data.len() as u64);
                self.pending_overlap_bytes += cut;
                overlapped = true;
                data = &data[cut as usize..];
                start += cut;
            }
        }

        if start >= end || data.is_empty() {
            if overlapped {
                self.pending_overlap_packets += 1;
            }
            return;
        }
        end = start + data.len() as u64;

        // Split the remainder around queued segments inside our range;
        // the earlier arrival keeps its bytes
        let existing: Vec<(u64, u64)> = self
            .queued
            .range(start..end)
            .map(|(&s, q)| (s, s + q.data.len() as u64))
            .collect();

        let mut pieces: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut cursor = start;
        for (estart, eend) in existing {
            if cursor < estart {
                let piece = &data[(cursor - start) as usize..(estart - start) as usize];
                pieces.push((cursor, piece.to_vec()));
            }
            let covered = eend.min(end).saturating_sub(estart.max(cursor));
            self.pending_overlap_bytes += covered;
            overlapped = true;
            cursor = cursor.max(eend);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            let piece = &data[(cursor - start) as usize..];
            pieces.push((cursor, piece.to_vec()));
        }

        if overlapped {
            self.pending_overlap_packets += 1;
        }

        for (pos, piece) in pieces {
            let out_of_order = pos > next;
            if out_of_order {
                self.pending_ooo_bytes += piece.len() as u64;
                self.pending_ooo_packets += 1;
            }
            self.queued.insert(
                pos,
                Queued {
                    data: piece,
                    ts,
                    out_of_order,
                },
            );
        }
    }

    /// Pop the contiguous run at the expected position, if any
    pub fn take_ready(&mut self) -> Option<Delivery> {
        let next = self.next?;
        if self.queued.first_key_value().map(|(&k, _)| k) != Some(next) {
            return None;
        }

        let mut data = Vec::new();
        let mut cursor = next;
        let mut chunks = 0u64;
        let mut packets = 0u64;
        let mut reordered = false;
        let mut ts: Option<DateTime<Utc>> = None;

        while let Some(entry) = self.queued.remove(&cursor) {
            cursor += entry.data.len() as u64;
            data.extend_from_slice(&entry.data);
            chunks += 1;
            packets += 1;
            reordered |= entry.out_of_order;
            // newest contributing segment keeps delivery timestamps
            // monotone per direction
            ts = Some(ts.map_or(entry.ts, |t: DateTime<Utc>| t.max(entry.ts)));
        }
        let ts = ts.unwrap_or_else(Utc::now);

        let start = !self.delivered_any;
        let skip = if start && !self.saw_start { -1 } else { 0 };
        self.delivered_any = true;
        self.next = Some(cursor);

        let delivery = Delivery {
            data,
            ts,
            chunks: if reordered { chunks.max(2) } else { chunks },
            packets,
            skip,
            start,
            queued_bytes: std::mem::take(&mut self.pending_ooo_bytes),
            queued_packets: std::mem::take(&mut self.pending_ooo_packets),
            overlap_bytes: std::mem::take(&mut self.pending_overlap_bytes),
            overlap_packets: std::mem::take(&mut self.pending_overlap_packets),
        };
        Some(delivery)
    }

    /// Force out the earliest queued run, recording the skipped gap
    pub fn flush(&mut self) -> Option<Delivery> {
        let next = self.next?;
        let first = self.queued.first_key_value().map(|(&k, _)| k)?;

        let gap = first.saturating_sub(next);
        self.next = Some(first);
        let mut delivery = self.take_ready()?;
        if delivery.skip == 0 && gap > 0 {
            delivery.skip = gap as i64;
        }
        Some(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buf = StreamBuffer::new();
        buf.insert(1000, true, &[], ts());
        buf.insert(1001, false, b"hello ", ts());

        let d = buf.take_ready().unwrap();
        assert_eq!(d.data, b"hello ");
        assert!(d.start);
        assert_eq!(d.skip, 0);
        assert_eq!(d.chunks, 1);

        buf.insert(1007, false, b"world", ts());
        let d = buf.take_ready().unwrap();
        assert_eq!(d.data, b"world");
        assert!(!d.start);
    }

    #[test]
    fn test_out_of_order_reorders() {
        let mut buf = StreamBuffer::new();
        buf.insert(100, true, &[], ts());

        buf.insert(106, false, b"world", ts());
        assert!(buf.take_ready().is_none());
        assert!(buf.has_pending());

        buf.insert(101, false, b"hello", ts());
        let d = buf.take_ready().unwrap();
        assert_eq!(d.data, b"helloworld");
        assert!(d.chunks > 1);
        assert_eq!(d.queued_packets, 1);
        assert_eq!(d.queued_bytes, 5);
    }

    #[test]
    fn test_overlap_earlier_wins() {
        let mut buf = StreamBuffer::new();
        buf.insert(0, true, &[], ts());

        buf.insert(1, false, b"AAAA", ts());
        // Overlaps the first two bytes of the retransmission
        buf.insert(3, false, b"BBBB", ts());

        let d = buf.take_ready().unwrap();
        assert_eq!(d.data, b"AAAABB");
        assert_eq!(d.overlap_bytes, 2);
        assert_eq!(d.overlap_packets, 1);
    }

    #[test]
    fn test_full_duplicate_dropped() {
        let mut buf = StreamBuffer::new();
        buf.insert(10, true, &[], ts());
        buf.insert(11, false, b"data", ts());
        let _ = buf.take_ready().unwrap();

        buf.insert(11, false, b"data", ts());
        assert!(buf.take_ready().is_none());
        buf.insert(15, false, b"more", ts());
        let d = buf.take_ready().unwrap();
        assert_eq!(d.data, b"more");
        assert_eq!(d.overlap_bytes, 4);
    }

    #[test]
    fn test_missing_init_skip() {
        let mut buf = StreamBuffer::new();
        // No SYN observed, stream picked up mid-flight
        buf.insert(5000, false, b"mid-stream", ts());
        let d = buf.take_ready().unwrap();
        assert_eq!(d.skip, -1);
        assert_eq!(d.data, b"mid-stream");

        buf.insert(5010, false, b" more", ts());
        let d = buf.take_ready().unwrap();
        assert_eq!(d.skip, 0);
    }

    #[test]
    fn test_flush_reports_gap() {
        let mut buf = StreamBuffer::new();
        buf.insert(100, true, &[], ts());
        buf.insert(101, false, b"first", ts());
        let _ = buf.take_ready().unwrap();

        // Bytes 106..116 never arrive
        buf.insert(116, false, b"late", ts());
        assert!(buf.take_ready().is_none());

        let d = buf.flush().unwrap();
        assert_eq!(d.skip, 10);
        assert_eq!(d.data, b"late");
        assert!(!buf.has_pending());
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut buf = StreamBuffer::new();
        let seq = u32::MAX - 1;
        buf.insert(seq, false, b"ab", ts());
        let d = buf.take_ready().unwrap();
        assert_eq!(d.data, b"ab");

        // Continues across the 2^32 boundary
        buf.insert(0, false, b"cd", ts());
        let d = buf.take_ready().unwrap();
        assert_eq!(d.data, b"cd");
    }

    #[test]
    fn test_five_segments_reordered_payload_identical() {
        let parts: [&[u8]; 5] = [b"11", b"22", b"33", b"44", b"55"];
        let order = [0usize, 2, 1, 3, 4];

        let mut buf = StreamBuffer::new();
        buf.insert(0, true, &[], ts());
        let mut collected = Vec::new();
        for &i in &order {
            let seq = 1 + (0..i).map(|j| parts[j].len() as u32).sum::<u32>();
            buf.insert(seq, false, parts[i], ts());
            while let Some(d) = buf.take_ready() {
                collected.extend_from_slice(&d.data);
            }
        }
        assert_eq!(collected, b"1122334455");
    }
}
