//! Engine configuration
//!
//! All knobs recognized by the reassembly and profiling engine, loadable
//! from a TOML file or constructed in code.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Packets between forced assembler flushes
    #[serde(default = "default_flush_every")]
    pub flush_every: u64,

    /// Idle bound for pending (gapped) streams, seconds
    #[serde(default = "default_close_pending")]
    pub close_pending_timeout_secs: u64,

    /// Idle bound before a connection is closed, seconds
    #[serde(default = "default_close_inactive")]
    pub close_inactive_timeout_secs: u64,

    /// Accept streams for which no SYN was observed
    #[serde(default)]
    pub allow_missing_init: bool,

    /// Keep segments that the connection FSM rejected
    #[serde(default)]
    pub ignore_fsm_err: bool,

    /// Skip TCP option checking
    #[serde(default)]
    pub no_opt_check: bool,

    /// Verify the TCP checksum against the network pseudo-header
    #[serde(default)]
    pub checksum: bool,

    /// Disable IPv4 defragmentation
    #[serde(default)]
    pub no_defrag: bool,

    /// Emit records even when streams did not complete
    #[serde(default)]
    pub write_incomplete: bool,

    /// Hex-dump payloads handed to stream readers
    #[serde(default)]
    pub hex_dump: bool,

    /// Verbose reassembly logging and timestamp markers in conversations
    #[serde(default)]
    pub debug: bool,

    /// Path for an end-of-run memory snapshot ("" disables)
    #[serde(default)]
    pub mem_profile: String,

    /// Persist UDP conversations at end of capture
    #[serde(default)]
    pub save_conns: bool,

    /// Wait for stream readers to drain on exit
    #[serde(default = "default_true")]
    pub wait_for_connections: bool,

    /// Suppress the shutdown tables
    #[serde(default)]
    pub quiet: bool,

    /// Resolve DNS names from the local hosts file instead of a resolver
    #[serde(default)]
    pub local_dns: bool,

    /// Optional MaxMind database path for geolocation lookups
    #[serde(default)]
    pub geoip_db: Option<String>,

    /// Output directory for record files and conversation artifacts
    #[serde(default = "default_out_dir")]
    pub out_dir: String,

    /// Capacity of the per-direction stream reader channels
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer_size: usize,

    /// Per-direction enqueue timeout in milliseconds; 0 disables the
    /// drop-under-pressure policy
    #[serde(default)]
    pub stream_send_timeout_ms: u64,

    /// Decode HTTP streams
    #[serde(default = "default_true")]
    pub decode_http: bool,

    /// Decode SSH streams
    #[serde(default = "default_true")]
    pub decode_ssh: bool,

    /// Decode POP3 streams
    #[serde(default = "default_true")]
    pub decode_pop3: bool,

    /// Buffered writer capacity in bytes
    #[serde(default = "default_mem_buffer")]
    pub mem_buffer_size: usize,

    /// Compression block size in bytes
    #[serde(default = "default_compression_block")]
    pub compression_block_size: usize,

    /// Buffer record output
    #[serde(default = "default_true")]
    pub buffer: bool,

    /// Compress record output with gzip
    #[serde(default)]
    pub compress: bool,

    /// Write records as CSV instead of delimited binary
    #[serde(default)]
    pub csv: bool,

    /// Source identifier written into record file headers
    #[serde(default = "default_source")]
    pub source: String,

    /// Version string written into record file headers
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_flush_every() -> u64 {
    100
}

fn default_close_pending() -> u64 {
    5
}

fn default_close_inactive() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}

fn default_out_dir() -> String {
    ".".to_string()
}

fn default_stream_buffer() -> usize {
    100
}

fn default_mem_buffer() -> usize {
    1024 * 1024
}

fn default_compression_block() -> usize {
    1024 * 1024
}

fn default_source() -> String {
    "unknown".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_every: default_flush_every(),
            close_pending_timeout_secs: default_close_pending(),
            close_inactive_timeout_secs: default_close_inactive(),
            allow_missing_init: false,
            ignore_fsm_err: false,
            no_opt_check: false,
            checksum: false,
            no_defrag: false,
            write_incomplete: false,
            hex_dump: false,
            debug: false,
            mem_profile: String::new(),
            save_conns: false,
            wait_for_connections: true,
            quiet: false,
            local_dns: false,
            geoip_db: None,
            out_dir: default_out_dir(),
            stream_buffer_size: default_stream_buffer(),
            stream_send_timeout_ms: 0,
            decode_http: true,
            decode_ssh: true,
            decode_pop3: true,
            mem_buffer_size: default_mem_buffer(),
            compression_block_size: default_compression_block(),
            buffer: true,
            compress: false,
            csv: false,
            source: default_source(),
            version: default_version(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from a path if present, falling back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Pending-stream flush cutoff as a duration
    pub fn close_pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.close_pending_timeout_secs as i64)
    }

    /// Inactive-connection close cutoff as a duration
    pub fn close_inactive_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.close_inactive_timeout_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.flush_every, 100);
        assert_eq!(cfg.close_pending_timeout_secs, 5);
        assert!(cfg.wait_for_connections);
        assert!(!cfg.checksum);
        assert!(cfg.decode_http);
        assert_eq!(cfg.stream_send_timeout_ms, 0);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = Config::default();
        cfg.allow_missing_init = true;
        cfg.flush_every = 42;

        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert!(back.allow_missing_init);
        assert_eq!(back.flush_every, 42);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str("checksum = true\n").unwrap();
        assert!(cfg.checksum);
        assert_eq!(cfg.flush_every, 100);
        assert_eq!(cfg.out_dir, ".");
    }
}
