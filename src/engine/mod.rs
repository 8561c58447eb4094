//! Top-level engine
//!
//! Owns every shared component (stats, profiles, pool, writers, pairing
//! maps) and drives the pipeline: packet in capture order, through the
//! defragmenter, TCP/UDP dispatch, assembler and profile registry; then
//! the end-of-capture drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tabled::{Table, Tabled};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{Layer3, Packet};
use crate::defrag::Defragmenter;
use crate::error::{NetcapError, Result};
use crate::profile::ProfileRegistry;
use crate::readers::{DecoderSinks, HttpPairing, ServiceStore};
use crate::reassembly::{Assembler, StreamPool};
use crate::resolvers::Resolvers;
use crate::stats::{ErrorMap, SharedStats};
use crate::types::RecordType;
use crate::udp::UdpHandler;
use crate::writer::{Writer, WriterConfig};

/// Bounded wait for reader drain at end of capture
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run summary returned by `finish`
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub packets: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub errors: u64,
    /// (file name, file size) per closed writer
    pub files: Vec<(String, u64)>,
    pub http_records: u64,
    pub service_records: u64,
    pub profile_records: u64,
    pub connection_records: u64,
}

#[derive(Tabled)]
struct Row {
    setting: String,
    value: String,
}

/// The flow reassembly and profiling engine
pub struct Engine {
    cfg: Arc<Config>,
    stats: Arc<SharedStats>,
    errors: Arc<ErrorMap>,
    registry: ProfileRegistry,
    defrag: Mutex<Defragmenter>,
    pool: Arc<StreamPool>,
    assembler: Assembler,
    udp: UdpHandler,
    http_pairing: Arc<HttpPairing>,
    services: Arc<ServiceStore>,
    http_writer: Option<Arc<Writer>>,
    service_writer: Option<Arc<Writer>>,
    conn_writer: Option<Arc<Writer>>,
    profile_writer: Option<Arc<Writer>>,
    packet_count: AtomicU64,
    data_bytes: AtomicU64,
    start: Instant,
}

impl Engine {
    /// Build the engine, opening one writer per enabled record type and
    /// emitting the file headers.
    pub fn new(cfg: Config) -> Result<Engine> {
        let cfg = Arc::new(cfg);
        let stats = Arc::new(SharedStats::new());
        let errors = Arc::new(ErrorMap::new());
        let http_pairing = Arc::new(HttpPairing::new());
        let services = Arc::new(ServiceStore::new());

        let open = |record_type: RecordType| -> Result<Arc<Writer>> {
            let writer = Writer::new(WriterConfig::for_type(record_type, &cfg))?;
            writer.write_header(&cfg.source, &cfg.version, false)?;
            Ok(Arc::new(writer))
        };

        let http_writer = if cfg.decode_http {
            Some(open(RecordType::Http)?)
        } else {
            None
        };
        let service_writer = Some(open(RecordType::Service)?);
        let conn_writer = if cfg.save_conns {
            Some(open(RecordType::Connection)?)
        } else {
            None
        };
        let profile_writer = Some(open(RecordType::IpProfile)?);

        let sinks = Arc::new(DecoderSinks {
            cfg: cfg.clone(),
            stats: stats.clone(),
            errors: errors.clone(),
            http: http_pairing.clone(),
            services: services.clone(),
            http_writer: http_writer.clone(),
        });

        let pool = Arc::new(StreamPool::new(sinks.clone()));
        let assembler = Assembler::new(pool.clone(), sinks);
        let registry = ProfileRegistry::new(Resolvers::new(&cfg));

        Ok(Engine {
            cfg,
            stats,
            errors,
            registry,
            defrag: Mutex::new(Defragmenter::new()),
            pool,
            assembler,
            udp: UdpHandler::new(),
            http_pairing,
            services,
            http_writer,
            service_writer,
            conn_writer,
            profile_writer,
            packet_count: AtomicU64::new(0),
            data_bytes: AtomicU64::new(0),
            start: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub fn errors(&self) -> &ErrorMap {
        &self.errors
    }

    pub fn pool(&self) -> &StreamPool {
        &self.pool
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Parse and ingest one captured frame.
    ///
    /// Must be called sequentially in capture order; reassembly depends
    /// on monotonic packet order.
    pub async fn ingest(&self, data: &[u8], timestamp: DateTime<Utc>) -> Result<()> {
        let packet = match Packet::parse(data, timestamp, self.cfg.checksum) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping undecodable frame: {e}");
                self.errors.inc("packet-decode");
                return Ok(());
            }
        };
        self.ingest_packet(packet).await
    }

    /// Ingest an already parsed packet
    pub async fn ingest_packet(&self, mut packet: Packet) -> Result<()> {
        let count = self.packet_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.data_bytes
            .fetch_add(packet.data_len as u64, Ordering::Relaxed);

        // Every packet feeds the profile registry
        self.registry.observe(&packet);

        // IPv4 defragmentation; reassembly only sees IPv4 unless disabled
        if !self.cfg.no_defrag {
            let fragment = match &packet.layer3 {
                Layer3::Ipv4(info) if info.is_fragmented() => Some(info.clone()),
                Layer3::Ipv4(_) => None,
                Layer3::Ipv6(_) => return Ok(()),
            };
            if let Some(ipv4) = fragment {
                let reassembled = self.defrag.lock().defragment(&ipv4, packet.timestamp)?;
                match reassembled {
                    None => {
                        debug!("fragment, more required");
                        return Ok(());
                    }
                    Some(complete) => {
                        if complete.total_length != ipv4.total_length {
                            self.stats.update(|s| s.ipdefrag += 1);
                            debug!(proto = complete.protocol, "decoding reassembled packet");
                            packet.layer3 = Layer3::Ipv4(complete);
                            if let Err(e) = packet.rebuild_transport(self.cfg.checksum) {
                                self.errors.inc("defrag-decode");
                                debug!("failed to decode reassembled packet: {e}");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        if packet.is_tcp() {
            self.assembler.assemble(&packet).await?;
        } else if packet.udp().is_some() {
            self.udp.handle(&packet);
        }

        // Periodic timeout-based flush
        if count % self.cfg.flush_every == 0 {
            let t = packet.timestamp - self.cfg.close_pending_timeout();
            let tc = packet.timestamp - self.cfg.close_inactive_timeout();
            let (flushed, closed) = self.assembler.flush_with_options(t, tc).await?;
            debug!(flushed, closed, "periodic flush");
        }

        Ok(())
    }

    /// End-of-capture drain: flush the assembler, wait for readers with a
    /// bounded timeout, drain the HTTP pairing table, persist services,
    /// profiles and UDP conversations, close the writers and print the
    /// shutdown tables.
    pub async fn finish(&self) -> Result<Summary> {
        if self.cfg.wait_for_connections {
            match tokio::time::timeout(DEFAULT_REASSEMBLY_TIMEOUT, self.assembler.flush_all())
                .await
            {
                Ok(result) => {
                    result?;
                }
                Err(_) => {
                    warn!(
                        "reader drain timed out after {:?}, forcing close",
                        DEFAULT_REASSEMBLY_TIMEOUT
                    );
                    self.errors.inc("reassembly-timeout");
                }
            }
        }

        // Drain residual request/response maps
        let drained = self
            .http_pairing
            .drain(self.http_writer.as_deref())?;
        debug!(drained, "flushed leftover HTTP records");

        if let Some(writer) = &self.service_writer {
            for service in self.services.all() {
                writer.write_record(&service)?;
            }
        }

        if let Some(writer) = &self.profile_writer {
            for profile in self.registry.snapshots() {
                writer.write_record(&profile)?;
            }
        }

        if self.cfg.save_conns {
            self.udp.save_all(
                self.conn_writer.as_deref(),
                &self.cfg.out_dir,
                self.cfg.debug,
                &self.stats,
            )?;
        }

        if !self.cfg.mem_profile.is_empty() {
            self.write_mem_profile()?;
        }

        let mut summary = Summary {
            packets: self.packet_count.load(Ordering::Relaxed),
            bytes: self.data_bytes.load(Ordering::Relaxed),
            elapsed: self.start.elapsed(),
            errors: self.errors.total(),
            ..Default::default()
        };

        for writer in [
            &self.http_writer,
            &self.service_writer,
            &self.conn_writer,
            &self.profile_writer,
        ]
        .into_iter()
        .flatten()
        {
            match writer.record_type() {
                RecordType::Http => summary.http_records = writer.num_records(),
                RecordType::Service => summary.service_records = writer.num_records(),
                RecordType::Connection => summary.connection_records = writer.num_records(),
                RecordType::IpProfile => summary.profile_records = writer.num_records(),
                RecordType::Header => {}
            }
            summary.files.push(writer.close()?);
        }

        if !self.cfg.quiet {
            self.print_tables(&summary);
        }

        Ok(summary)
    }

    /// Engine occupancy snapshot written on request; a failure here is
    /// fatal per configuration contract
    fn write_mem_profile(&self) -> Result<()> {
        let stats = self.stats.snapshot();
        let report = format!(
            "connections: {}\nstreams created: {}\nprofiles: {}\nservices: {}\nudp streams: {}\ndefrag pending: {}\nreassembled bytes: {}\n",
            self.pool.len(),
            self.pool.streams_created(),
            self.registry.size(),
            self.services.len(),
            self.udp.len(),
            self.defrag.lock().pending(),
            stats.sz,
        );
        std::fs::write(&self.cfg.mem_profile, report)
            .map_err(|e| NetcapError::Record(format!("failed to write memory snapshot: {e}")))?;
        Ok(())
    }

    fn print_tables(&self, summary: &Summary) {
        let (requests, responses) = self.http_pairing.counts();
        info!(
            "processed {} packets ({} bytes) in {:?} (errors: {}, requests: {}, responses: {})",
            summary.packets, summary.bytes, summary.elapsed, summary.errors, requests, responses
        );

        let settings = vec![
            Row {
                setting: "FlushEvery".to_string(),
                value: self.cfg.flush_every.to_string(),
            },
            Row {
                setting: "CloseInactiveTimeout".to_string(),
                value: format!("{}s", self.cfg.close_inactive_timeout_secs),
            },
            Row {
                setting: "ClosePendingTimeout".to_string(),
                value: format!("{}s", self.cfg.close_pending_timeout_secs),
            },
            Row {
                setting: "AllowMissingInit".to_string(),
                value: self.cfg.allow_missing_init.to_string(),
            },
            Row {
                setting: "IgnoreFsmErr".to_string(),
                value: self.cfg.ignore_fsm_err.to_string(),
            },
            Row {
                setting: "NoOptCheck".to_string(),
                value: self.cfg.no_opt_check.to_string(),
            },
            Row {
                setting: "Checksum".to_string(),
                value: self.cfg.checksum.to_string(),
            },
            Row {
                setting: "NoDefrag".to_string(),
                value: self.cfg.no_defrag.to_string(),
            },
            Row {
                setting: "WriteIncomplete".to_string(),
                value: self.cfg.write_incomplete.to_string(),
            },
        ];
        println!("{}", Table::new(settings));

        let stats: Vec<Row> = self
            .stats
            .rows(!self.cfg.no_defrag)
            .into_iter()
            .map(|(name, value)| Row {
                setting: name.to_string(),
                value: value.to_string(),
            })
            .collect();
        println!("TCP stats:\n{}", Table::new(stats));

        if self.errors.total() != 0 {
            let rows: Vec<Row> = self
                .errors
                .rows()
                .into_iter()
                .map(|(subject, count)| Row {
                    setting: subject,
                    value: count.to_string(),
                })
                .collect();
            println!(
                "errors: {}\n{}",
                self.errors.total(),
                Table::new(rows)
            );
        }
    }
}
