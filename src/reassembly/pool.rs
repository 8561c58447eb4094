//! Stream factory and connection pool
//!
//! Creates a connection on the first segment of a 5-tuple, choosing the
//! initial decoder from the destination port, and tracks every live
//! connection for periodic flushing and the end-of-capture drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::core::{FlowPair, PoolKey};
use crate::readers::{DecoderKind, DecoderSinks};
use crate::stream::TcpConnection;

/// Pool of live connections keyed by direction-agnostic 5-tuple
pub struct StreamPool {
    conns: Mutex<HashMap<PoolKey, Arc<TcpConnection>>>,
    sinks: Arc<DecoderSinks>,
    streams_created: AtomicU64,
}

impl StreamPool {
    pub fn new(sinks: Arc<DecoderSinks>) -> StreamPool {
        StreamPool {
            conns: Mutex::new(HashMap::new()),
            sinks,
            streams_created: AtomicU64::new(0),
        }
    }

    /// Connection for a segment's 5-tuple, created on first sight.
    ///
    /// The creating packet's source is taken as the client until the
    /// completion flip check proves otherwise.
    pub fn get_or_create(
        &self,
        flow: FlowPair,
        ts: DateTime<Utc>,
    ) -> (Arc<TcpConnection>, bool) {
        let key = PoolKey::from_flow(&flow);

        let mut conns = self.conns.lock();
        if let Some(conn) = conns.get(&key) {
            return (conn.clone(), false);
        }

        let decoder = DecoderKind::for_port(flow.dst_port);
        let conn = Arc::new(TcpConnection::new(
            flow,
            ts,
            decoder,
            self.sinks.clone(),
        ));
        conns.insert(key, conn.clone());
        self.streams_created.fetch_add(1, Ordering::Relaxed);
        debug!(ident = %conn.ident(), ?decoder, "new stream");

        (conn, true)
    }

    /// Snapshot of all tracked connections
    pub fn connections(&self) -> Vec<Arc<TcpConnection>> {
        self.conns.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }

    /// Total streams created over the run
    pub fn streams_created(&self) -> u64 {
        self.streams_created.load(Ordering::Relaxed)
    }
}
