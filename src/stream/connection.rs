//! Bi-directional TCP connection
//!
//! Gates segments through the FSM, option checker and checksum, routes
//! reassembled byte ranges to the direction readers, and on completion
//! persists the conversation, saves the service banner and runs the
//! protocol decoder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::reader::StreamReader;
use super::StreamData;
use crate::core::flow::reverse_ident;
use crate::core::{Direction, FlowPair, TcpInfo};
use crate::error::Result;
use crate::readers::{self, DecoderKind, DecoderSinks};
use crate::reassembly::buffer::{Delivery, StreamBuffer};
use crate::conversation;
use crate::reassembly::fsm::TcpFsm;
use crate::reassembly::options::TcpOptionCheck;

/// Why a connection is being completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteReason {
    /// FIN exchange or RST observed
    Teardown,
    /// Timeout or end-of-capture flush
    Flush,
}

/// Result of feeding one segment
#[derive(Debug, Clone, Copy)]
pub struct SegmentOutcome {
    pub accepted: bool,
    /// Connection teardown finished; caller should complete it
    pub complete_now: bool,
}

/// Completed-connection context handed to the protocol decoders
pub struct ConnContext {
    /// Client-to-server oriented flow
    pub flow: FlowPair,
    pub ident: String,
    pub first_packet: DateTime<Utc>,
    pub client_data: Vec<StreamData>,
    pub server_data: Vec<StreamData>,
}

struct ConnState {
    fsm: TcpFsm,
    optcheck: TcpOptionCheck,
    /// Oriented so that src is the assumed client
    flow: FlowPair,
    ident: String,
    fsm_errored: bool,
    decoder: DecoderKind,
    first_packet: DateTime<Utc>,
    /// Flow of the earliest packet, kept for the completion flip check
    earliest_flow: Option<FlowPair>,
    last_seen: DateTime<Utc>,
    /// Reader slot currently holding the client side
    client_slot: usize,
    buffers: [StreamBuffer; 2],
    fin: [bool; 2],
    rst: bool,
    completed: bool,
}

/// One bi-directional TCP connection and its two stream readers
pub struct TcpConnection {
    readers: [StreamReader; 2],
    sinks: Arc<DecoderSinks>,
    state: Mutex<ConnState>,
}

impl TcpConnection {
    /// Create a connection for the first observed segment of a 5-tuple.
    ///
    /// Slot 0 holds the side that sent the first packet; the completion
    /// flip check may re-assign the client slot later.
    pub fn new(
        flow: FlowPair,
        first_packet: DateTime<Utc>,
        decoder: DecoderKind,
        sinks: Arc<DecoderSinks>,
    ) -> TcpConnection {
        let capacity = sinks.cfg.stream_buffer_size;
        let allow_missing_init = sinks.cfg.allow_missing_init;
        let ident = flow.ident();

        TcpConnection {
            readers: [StreamReader::spawn(capacity), StreamReader::spawn(capacity)],
            sinks,
            state: Mutex::new(ConnState {
                fsm: TcpFsm::new(allow_missing_init),
                optcheck: TcpOptionCheck::new(),
                flow,
                ident,
                fsm_errored: false,
                decoder,
                first_packet,
                earliest_flow: None,
                last_seen: first_packet,
                client_slot: 0,
                buffers: [StreamBuffer::new(), StreamBuffer::new()],
                fin: [false, false],
                rst: false,
                completed: false,
            }),
        }
    }

    pub fn ident(&self) -> String {
        self.state.lock().ident.clone()
    }

    /// Client-oriented flow pair
    pub fn flow(&self) -> FlowPair {
        self.state.lock().flow
    }

    pub fn decoder(&self) -> DecoderKind {
        self.state.lock().decoder
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.state.lock().last_seen
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Queued bytes awaiting delivery across both directions
    pub fn pending_bytes(&self) -> u64 {
        let st = self.state.lock();
        st.buffers[0].pending_bytes() + st.buffers[1].pending_bytes()
    }

    /// Feed one segment through the acceptance gates and the sequence
    /// buffer, then deliver any in-order runs to the direction reader.
    pub async fn process_segment(
        &self,
        tcp: &TcpInfo,
        ts: DateTime<Utc>,
        pkt_flow: FlowPair,
    ) -> SegmentOutcome {
        let cfg = &self.sinks.cfg;

        let (slot, dir, deliveries, complete_now) = {
            let mut st = self.state.lock();
            st.last_seen = ts;
            if ts < st.first_packet {
                st.first_packet = ts;
                st.earliest_flow = Some(pkt_flow);
            }

            let dir = if pkt_flow.src_ip == st.flow.src_ip && pkt_flow.src_port == st.flow.src_port
            {
                Direction::ClientToServer
            } else {
                Direction::ServerToClient
            };
            let slot = match dir {
                Direction::ClientToServer => st.client_slot,
                Direction::ServerToClient => 1 - st.client_slot,
            };

            // Finite state machine
            if !st.fsm.check(tcp.flags, dir) {
                debug!(
                    ident = %st.ident,
                    state = %st.fsm.state(),
                    "segment rejected by FSM"
                );
                let first = !st.fsm_errored;
                st.fsm_errored = true;
                self.sinks.stats.update(|s| {
                    s.reject_fsm += 1;
                    if first {
                        s.reject_conn_fsm += 1;
                    }
                });
                self.sinks.errors.inc("FSM");
                if !cfg.ignore_fsm_err {
                    return SegmentOutcome {
                        accepted: false,
                        complete_now: false,
                    };
                }
            }

            // TCP options
            if let Err(reason) = st.optcheck.accept(tcp, dir) {
                debug!(ident = %st.ident, %reason, "segment rejected by option checker");
                self.sinks.stats.update(|s| s.reject_opt += 1);
                self.sinks.errors.inc("OptionChecker");
                if !cfg.no_opt_check {
                    return SegmentOutcome {
                        accepted: false,
                        complete_now: false,
                    };
                }
            }

            // TCP checksum
            if cfg.checksum && tcp.checksum_valid == Some(false) {
                debug!(ident = %st.ident, "segment rejected by checksum");
                self.sinks.stats.update(|s| s.reject_opt += 1);
                self.sinks.errors.inc("Checksum");
                return SegmentOutcome {
                    accepted: false,
                    complete_now: false,
                };
            }

            st.buffers[slot].insert(tcp.seq, tcp.flags.syn, &tcp.payload, ts);
            let mut deliveries = Vec::new();
            while let Some(d) = st.buffers[slot].take_ready() {
                deliveries.push(d);
            }

            if tcp.flags.fin {
                st.fin[slot] = true;
            }
            if tcp.flags.rst {
                st.rst = true;
            }
            let complete_now = !st.completed && (st.rst || (st.fin[0] && st.fin[1]));

            (slot, dir, deliveries, complete_now)
        };

        self.feed(slot, dir, deliveries).await;

        SegmentOutcome {
            accepted: true,
            complete_now,
        }
    }

    /// Deliver in-order byte ranges to the direction reader, applying the
    /// skip policy and per-delivery statistics
    async fn feed(&self, slot: usize, dir: Direction, deliveries: Vec<Delivery>) {
        let cfg = &self.sinks.cfg;

        for d in deliveries {
            self.sinks.stats.update(|s| {
                if d.skip > 0 {
                    s.missed_bytes += d.skip as u64;
                }
                s.sz += d.data.len() as u64;
                s.pkt += d.packets;
                if d.chunks > 1 {
                    s.reassembled += 1;
                }
                s.out_of_order_packets += d.queued_packets;
                s.out_of_order_bytes += d.queued_bytes;
                if d.data.len() as u64 > s.biggest_chunk_bytes {
                    s.biggest_chunk_bytes = d.data.len() as u64;
                }
                if d.packets > s.biggest_chunk_packets {
                    s.biggest_chunk_packets = d.packets;
                }
                s.overlap_bytes += d.overlap_bytes;
                s.overlap_packets += d.overlap_packets;
            });

            if d.skip == -1 && cfg.allow_missing_init {
                // acceptable initial gap
            } else if d.skip != 0 {
                // missing bytes, do not even try to parse
                continue;
            }

            let decoder = self.state.lock().decoder;
            match decoder {
                // encrypted bodies are accounted but never delivered
                DecoderKind::HttpsOpaque => continue,
                DecoderKind::Http if !cfg.decode_http => continue,
                DecoderKind::Ssh if !cfg.decode_ssh => continue,
                DecoderKind::Pop3 if !cfg.decode_pop3 => continue,
                _ => {}
            }

            if d.data.is_empty() {
                continue;
            }

            if cfg.hex_dump {
                debug!(bytes = d.data.len(), "feeding stream reader:\n{:02x?}", d.data);
            }

            let frag = StreamData {
                raw: d.data,
                ts: d.ts,
                dir,
            };
            if !self.readers[slot].send(frag, cfg.stream_send_timeout_ms).await {
                trace!("fragment dropped, reader unavailable");
            }
        }
    }

    /// Force out queued data with gaps recorded as skips
    pub async fn flush_buffers(&self) -> usize {
        let mut batches = Vec::new();
        {
            let mut st = self.state.lock();
            let client_slot = st.client_slot;
            for slot in 0..2 {
                let dir = if slot == client_slot {
                    Direction::ClientToServer
                } else {
                    Direction::ServerToClient
                };
                let mut deliveries = Vec::new();
                while let Some(d) = st.buffers[slot].flush() {
                    deliveries.push(d);
                }
                if !deliveries.is_empty() {
                    batches.push((slot, dir, deliveries));
                }
            }
        }

        let mut count = 0;
        for (slot, dir, deliveries) in batches {
            count += deliveries.len();
            self.feed(slot, dir, deliveries).await;
        }
        count
    }

    /// Finish the connection: flush, flip if the earliest packet proves
    /// the orientation wrong, persist the conversation, save the service
    /// banner and run the protocol decoder.
    ///
    /// The connection stays in the pool afterwards so a trailing ACK is
    /// still accepted.
    pub async fn complete(&self, reason: CompleteReason) -> Result<()> {
        self.flush_buffers().await;

        {
            let mut st = self.state.lock();
            if st.completed {
                return Ok(());
            }
            st.completed = true;
        }

        // Duplicate closes are caught and counted, never fatal
        for reader in &self.readers {
            if !reader.close_channel() {
                self.sinks.errors.inc("channel-double-close");
            }
        }
        self.readers[0].join().await;
        self.readers[1].join().await;

        let (flow, ident, first_packet, client_slot) = {
            let mut st = self.state.lock();
            if let Some(earliest) = st.earliest_flow.take() {
                let differs = earliest.src_ip != st.flow.src_ip
                    || earliest.src_port != st.flow.src_port;
                if differs {
                    st.client_slot = 1 - st.client_slot;
                    st.flow = st.flow.reverse();
                    st.ident = reverse_ident(&st.ident);
                    debug!(ident = %st.ident, "flipped connection orientation");
                }
            }
            (st.flow, st.ident.clone(), st.first_packet, st.client_slot)
        };
        let server_slot = 1 - client_slot;

        // Re-tag stored fragments to match the final orientation
        self.readers[client_slot].retag(Direction::ClientToServer);
        self.readers[server_slot].retag(Direction::ServerToClient);

        let mut client_data = self.readers[client_slot].data_slice();
        client_data.sort_by_key(|d| d.ts);
        let mut server_data = self.readers[server_slot].data_slice();
        server_data.sort_by_key(|d| d.ts);

        let merged = conversation::merge_sorted(&client_data, &server_data);
        if !merged.is_empty() {
            self.readers[0].mark_saved();
            self.readers[1].mark_saved();

            let (raw, colored) = conversation::render(&merged, self.sinks.cfg.debug);
            conversation::save(&self.sinks.cfg.out_dir, &ident, &raw, &colored)?;
            self.sinks.stats.update(|s| s.saved_tcp_connections += 1);
        }

        let ctx = ConnContext {
            flow,
            ident: ident.clone(),
            first_packet,
            client_data,
            server_data,
        };

        // A first selection was made from the ports; peek into the server
        // banner to settle what the stream really is
        let banner = self.readers[server_slot].service_banner();
        let decoder = {
            let mut st = self.state.lock();
            let upgraded = st.decoder.sniff_banner(&banner);
            st.decoder = upgraded;
            upgraded
        };

        if reason == CompleteReason::Teardown || self.sinks.cfg.write_incomplete {
            readers::decode(decoder, &self.sinks, &ctx)?;
        } else {
            debug!(ident = %ident, "incomplete stream, records suppressed");
        }

        debug!(ident = %ident, "stream closed");
        Ok(())
    }
}
