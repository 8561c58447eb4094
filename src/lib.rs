//! Netcap traffic analysis framework
//!
//! Consumes raw packets in capture order, performs IPv4 defragmentation,
//! drives bi-directional TCP reassembly, routes reassembled streams to
//! protocol decoders (HTTP, SSH, POP3, generic banner grab), maintains
//! per-IP behavioral profiles and emits length-prefixed audit records
//! through a buffered, optionally compressed writer.
//!
//! The [`engine::Engine`] is the entry point: feed it frames with
//! `ingest`, then call `finish` at end of capture.

pub mod config;
pub mod conversation;
pub mod core;
pub mod defrag;
pub mod dpi;
pub mod engine;
pub mod error;
pub mod profile;
pub mod readers;
pub mod reassembly;
pub mod resolvers;
pub mod stats;
pub mod stream;
pub mod tls;
pub mod types;
pub mod udp;
pub mod writer;

pub use config::Config;
pub use engine::{Engine, Summary};
pub use error::{NetcapError, Result};
