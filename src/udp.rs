//! UDP stream handling
//!
//! UDP has no state machine; direction is inferred from the first
//! observed source. Streams accumulate per 5-tuple and are serialized as
//! connection audit records at end of capture when enabled.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::conversation;
use crate::core::{Direction, FlowPair, Packet, PoolKey};
use crate::error::Result;
use crate::stats::SharedStats;
use crate::stream::StreamData;
use crate::types::Connection;
use crate::writer::Writer;

struct UdpStream {
    /// Oriented by the first observed source
    flow: FlowPair,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    packets: u64,
    bytes: u64,
    fragments: Vec<StreamData>,
}

/// Accumulates UDP conversations for the end-of-capture drain
#[derive(Default)]
pub struct UdpHandler {
    streams: Mutex<HashMap<PoolKey, UdpStream>>,
}

impl UdpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Account one UDP packet
    pub fn handle(&self, packet: &Packet) {
        let udp = match packet.udp() {
            Some(udp) => udp,
            None => return,
        };

        let flow = FlowPair::from_packet(packet);
        let key = PoolKey::from_flow(&flow);
        let mut streams = self.streams.lock();

        let stream = streams.entry(key).or_insert_with(|| UdpStream {
            flow,
            first: packet.timestamp,
            last: packet.timestamp,
            packets: 0,
            bytes: 0,
            fragments: Vec::new(),
        });

        let dir = if flow.src_ip == stream.flow.src_ip && flow.src_port == stream.flow.src_port {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };

        stream.last = packet.timestamp;
        stream.packets += 1;
        stream.bytes += udp.payload.len() as u64;
        if !udp.payload.is_empty() {
            stream.fragments.push(StreamData {
                raw: udp.payload.clone(),
                ts: packet.timestamp,
                dir,
            });
        }
    }

    /// Serialize all accumulated streams as connection records and
    /// conversation artifacts. Returns the number of streams saved.
    pub fn save_all(
        &self,
        writer: Option<&Writer>,
        out_dir: &str,
        debug: bool,
        stats: &SharedStats,
    ) -> Result<u64> {
        let streams: Vec<UdpStream> = {
            let mut guard = self.streams.lock();
            let mut out: Vec<UdpStream> = guard.drain().map(|(_, s)| s).collect();
            out.sort_by_key(|s| s.first);
            out
        };

        let mut saved = 0u64;
        for stream in streams {
            let record = Connection {
                timestamp_first: Some(stream.first),
                timestamp_last: Some(stream.last),
                proto: "UDP".to_string(),
                src_ip: stream.flow.src_ip.to_string(),
                src_port: stream.flow.src_port,
                dst_ip: stream.flow.dst_ip.to_string(),
                dst_port: stream.flow.dst_port,
                total_size: stream.bytes,
                num_packets: stream.packets,
            };
            if let Some(writer) = writer {
                writer.write_record(&record)?;
            }

            if !stream.fragments.is_empty() {
                let (raw, colored) = conversation::render(&stream.fragments, debug);
                conversation::save(out_dir, &stream.flow.ident(), &raw, &colored)?;
            }

            stats.update(|s| s.saved_udp_connections += 1);
            saved += 1;
        }

        Ok(saved)
    }
}
