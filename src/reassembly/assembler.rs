//! Assembler
//!
//! Drives segments through their connections in capture order and owns
//! the timeout-based flush logic. Must be fed sequentially; cross-flow
//! parallelism comes from the per-connection reader tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::pool::StreamPool;
use crate::core::{FlowPair, Packet};
use crate::error::Result;
use crate::readers::DecoderSinks;
use crate::stream::connection::CompleteReason;

/// Sequential front of the reassembly core
pub struct Assembler {
    pool: Arc<StreamPool>,
    sinks: Arc<DecoderSinks>,
}

impl Assembler {
    pub fn new(pool: Arc<StreamPool>, sinks: Arc<DecoderSinks>) -> Assembler {
        Assembler { pool, sinks }
    }

    /// Feed one TCP packet. Non-TCP packets are the caller's problem.
    pub async fn assemble(&self, packet: &Packet) -> Result<()> {
        let tcp = match packet.tcp() {
            Some(tcp) => tcp,
            None => return Ok(()),
        };

        self.sinks
            .stats
            .update(|s| s.totalsz += tcp.payload.len() as u64);

        let flow = FlowPair::from_packet(packet);
        let (conn, _) = self.pool.get_or_create(flow, packet.timestamp);

        let outcome = conn.process_segment(tcp, packet.timestamp, flow).await;
        if outcome.complete_now {
            conn.complete(CompleteReason::Teardown).await?;
        }
        Ok(())
    }

    /// Timeout-driven flush.
    ///
    /// Connections idle since `tc` are closed; connections with stalled
    /// pending data older than `t` are flushed but stay open. Returns
    /// (flushed deliveries, closed connections).
    pub async fn flush_with_options(
        &self,
        t: DateTime<Utc>,
        tc: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let mut flushed = 0usize;
        let mut closed = 0usize;

        for conn in self.pool.connections() {
            if conn.is_completed() {
                continue;
            }
            let last_seen = conn.last_seen();
            if last_seen < tc {
                conn.complete(CompleteReason::Flush).await?;
                closed += 1;
            } else if last_seen < t && conn.pending_bytes() > 0 {
                flushed += conn.flush_buffers().await;
            }
        }

        if flushed > 0 || closed > 0 {
            debug!(flushed, closed, "forced flush");
        }
        Ok((flushed, closed))
    }

    /// End-of-capture drain: complete every remaining connection
    pub async fn flush_all(&self) -> Result<usize> {
        let mut closed = 0usize;
        for conn in self.pool.connections() {
            if !conn.is_completed() {
                conn.complete(CompleteReason::Flush).await?;
                closed += 1;
            }
        }
        debug!(closed, "assembler flush");
        Ok(closed)
    }
}
