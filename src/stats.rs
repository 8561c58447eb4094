//! Process-wide reassembly statistics
//!
//! One counter bundle under a single mutex, plus the error-subject
//! histogram printed at shutdown.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Counter bundle for the reassembly pipeline
#[derive(Debug, Default, Clone)]
pub struct ReassemblyStats {
    pub ipdefrag: u64,
    pub missed_bytes: u64,
    pub pkt: u64,
    /// Bytes delivered to stream readers
    pub sz: u64,
    /// Total TCP payload bytes observed
    pub totalsz: u64,
    pub reject_fsm: u64,
    pub reject_opt: u64,
    /// Connections with at least one FSM reject
    pub reject_conn_fsm: u64,
    /// Deliveries assembled from more than one chunk
    pub reassembled: u64,
    pub out_of_order_bytes: u64,
    pub out_of_order_packets: u64,
    pub biggest_chunk_bytes: u64,
    pub biggest_chunk_packets: u64,
    pub overlap_bytes: u64,
    pub overlap_packets: u64,
    pub saved_tcp_connections: u64,
    pub saved_udp_connections: u64,
    pub num_services: u64,
}

/// Shared statistics handle
#[derive(Debug, Default)]
pub struct SharedStats {
    inner: Mutex<ReassemblyStats>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure under the stats lock
    pub fn update<F: FnOnce(&mut ReassemblyStats)>(&self, f: F) {
        f(&mut self.inner.lock());
    }

    pub fn snapshot(&self) -> ReassemblyStats {
        self.inner.lock().clone()
    }

    /// Rows for the shutdown table
    pub fn rows(&self, with_defrag: bool) -> Vec<(&'static str, u64)> {
        let s = self.snapshot();
        let mut rows = Vec::new();
        if with_defrag {
            rows.push(("IPdefrag", s.ipdefrag));
        }
        rows.push(("missed bytes", s.missed_bytes));
        rows.push(("total packets", s.pkt));
        rows.push(("rejected FSM", s.reject_fsm));
        rows.push(("rejected Options", s.reject_opt));
        rows.push(("reassembled bytes", s.sz));
        rows.push(("total TCP bytes", s.totalsz));
        rows.push(("conn rejected FSM", s.reject_conn_fsm));
        rows.push(("reassembled chunks", s.reassembled));
        rows.push(("out-of-order packets", s.out_of_order_packets));
        rows.push(("out-of-order bytes", s.out_of_order_bytes));
        rows.push(("biggest-chunk packets", s.biggest_chunk_packets));
        rows.push(("biggest-chunk bytes", s.biggest_chunk_bytes));
        rows.push(("overlap packets", s.overlap_packets));
        rows.push(("overlap bytes", s.overlap_bytes));
        rows.push(("saved TCP connections", s.saved_tcp_connections));
        rows.push(("saved UDP connections", s.saved_udp_connections));
        rows.push(("numServices", s.num_services));
        rows
    }
}

#[derive(Debug, Default)]
struct ErrorMapInner {
    total: u64,
    counts: HashMap<String, u64>,
}

/// Error-subject histogram
#[derive(Debug, Default)]
pub struct ErrorMap {
    inner: Mutex<ErrorMapInner>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, subject: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.total += 1;
        *inner.counts.entry(subject.into()).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    /// Sorted (subject, count) rows for the shutdown table
    pub fn rows(&self) -> Vec<(String, u64)> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        rows
    }
}
