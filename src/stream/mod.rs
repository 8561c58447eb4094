//! Per-connection stream handling
//!
//! A `TcpConnection` owns one `StreamReader` per direction. The assembler
//! feeds direction-correct byte fragments into the readers; on completion
//! the merged conversation is persisted and a protocol decoder runs over
//! the collected streams.

pub mod connection;
pub mod reader;

use chrono::{DateTime, Utc};

use crate::core::Direction;

/// One reassembled byte fragment, owned by the stream layer
#[derive(Debug, Clone)]
pub struct StreamData {
    pub raw: Vec<u8>,
    /// Capture timestamp of the newest contributing segment
    pub ts: DateTime<Utc>,
    pub dir: Direction,
}

pub use connection::{ConnContext, TcpConnection};
pub use reader::StreamReader;
