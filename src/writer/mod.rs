//! Audit record writer
//!
//! Layers an optional buffered writer and an optional gzip encoder under
//! the length-delimited record framing, or projects records to CSV rows.
//! A single mutex serializes every emission so frames never interleave.

pub mod delimited;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::Config;
use crate::error::{NetcapError, Result};
use crate::types::{AuditRecord, Header, RecordType};
use delimited::{DelimitedReader, DelimitedWriter};

/// Options controlling a single record writer
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub record_type: RecordType,
    pub out_dir: String,
    pub buffer: bool,
    pub compress: bool,
    pub csv: bool,
    /// Route frames into an in-memory channel instead of a file
    pub chan: bool,
    pub mem_buffer_size: usize,
    pub compression_block_size: usize,
    /// Gzip worker hint, `2 x available_parallelism`
    pub compression_parallelism: usize,
}

impl WriterConfig {
    pub fn for_type(record_type: RecordType, cfg: &Config) -> Self {
        Self {
            record_type,
            out_dir: cfg.out_dir.clone(),
            buffer: cfg.buffer,
            compress: cfg.compress,
            csv: cfg.csv,
            chan: false,
            mem_buffer_size: cfg.mem_buffer_size,
            compression_block_size: cfg.compression_block_size,
            compression_parallelism: default_compression_parallelism(),
        }
    }
}

/// Default gzip parallelism: twice the available cores
pub fn default_compression_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

/// Write half of the in-memory channel mode
struct ChanWriter {
    tx: crossbeam_channel::Sender<Vec<u8>>,
}

impl Write for ChanWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Stream {
    Plain(Box<dyn Write + Send>),
    Gzip(GzEncoder<Box<dyn Write + Send>>),
}

impl Stream {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Stream::Plain(w) => w,
            Stream::Gzip(w) => w,
        }
    }
}

struct Inner {
    stream: Option<Stream>,
    records: u64,
    bytes: u64,
    closed: Option<(String, u64)>,
}

/// Audit record writer for one record type
pub struct Writer {
    record_type: RecordType,
    csv: bool,
    chan: bool,
    path: Option<PathBuf>,
    chan_rx: Option<crossbeam_channel::Receiver<Vec<u8>>>,
    inner: Mutex<Inner>,
}

impl Writer {
    /// Open a writer according to the configuration.
    ///
    /// Channel mode cannot be combined with buffering or compression.
    pub fn new(cfg: WriterConfig) -> Result<Writer> {
        if cfg.chan && (cfg.buffer || cfg.compress) {
            return Err(NetcapError::Invariant(
                "buffering or compression cannot be combined with channel output".to_string(),
            ));
        }

        let mut chan_rx = None;
        let mut path = None;

        let base: Box<dyn Write + Send> = if cfg.chan {
            let (tx, rx) = crossbeam_channel::unbounded();
            chan_rx = Some(rx);
            Box::new(ChanWriter { tx })
        } else {
            let suffix = match (cfg.csv, cfg.compress) {
                (true, true) => ".csv.gz",
                (true, false) => ".csv",
                (false, true) => ".ncap.gz",
                (false, false) => ".ncap",
            };
            fs::create_dir_all(&cfg.out_dir)?;
            let file_path =
                PathBuf::from(&cfg.out_dir).join(format!("{}{}", cfg.record_type.name(), suffix));
            let file = File::create(&file_path)?;
            path = Some(file_path);

            if cfg.buffer {
                Box::new(BufWriter::with_capacity(cfg.mem_buffer_size, file))
            } else if cfg.compress {
                // Give the encoder block-sized writes even without the
                // buffered layer
                Box::new(BufWriter::with_capacity(cfg.compression_block_size, file))
            } else {
                Box::new(file)
            }
        };

        let stream = if cfg.compress {
            debug!(
                block_size = cfg.compression_block_size,
                parallelism = cfg.compression_parallelism,
                "gzip layer enabled"
            );
            Stream::Gzip(GzEncoder::new(base, Compression::default()))
        } else {
            Stream::Plain(base)
        };

        Ok(Writer {
            record_type: cfg.record_type,
            csv: cfg.csv,
            chan: cfg.chan,
            path,
            chan_rx,
            inner: Mutex::new(Inner {
                stream: Some(stream),
                records: 0,
                bytes: 0,
                closed: None,
            }),
        })
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Receiver for channel mode frames
    pub fn chan_rx(&self) -> Option<&crossbeam_channel::Receiver<Vec<u8>>> {
        self.chan_rx.as_ref()
    }

    /// Write the file header describing the record stream
    pub fn write_header(
        &self,
        source: &str,
        version: &str,
        contains_payloads: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let stream = match inner.stream.as_mut() {
            Some(s) => s,
            None => return Err(NetcapError::Record("writer already closed".to_string())),
        };

        let n = if self.csv {
            let row = format!("{}\n", self.record_type.columns().join(","));
            stream
                .writer()
                .write_all(row.as_bytes())
                .map_err(|e| NetcapError::Record(e.to_string()))?;
            row.len()
        } else {
            let header = Header {
                record_type: self.record_type,
                created: Utc::now(),
                source: source.to_string(),
                version: version.to_string(),
                contains_payloads,
            };
            let body = bincode::serde::encode_to_vec(&header, bincode::config::standard())
                .map_err(|e| NetcapError::Encode(e.to_string()))?;
            let mut dw = DelimitedWriter::new(stream.writer());
            dw.put(&body).map_err(|e| NetcapError::Record(e.to_string()))?
        };

        inner.bytes += n as u64;
        Ok(())
    }

    /// Serialize and frame one record. Emission is serialized by the
    /// writer mutex.
    pub fn write_record<T: AuditRecord>(&self, record: &T) -> Result<()> {
        let mut inner = self.inner.lock();
        let stream = match inner.stream.as_mut() {
            Some(s) => s,
            None => return Err(NetcapError::Record("writer already closed".to_string())),
        };

        let n = if self.csv {
            let row = format!("{}\n", record.csv_values().join(","));
            stream
                .writer()
                .write_all(row.as_bytes())
                .map_err(|e| NetcapError::Record(e.to_string()))?;
            row.len()
        } else {
            let body = bincode::serde::encode_to_vec(record, bincode::config::standard())
                .map_err(|e| NetcapError::Encode(e.to_string()))?;
            let mut dw = DelimitedWriter::new(stream.writer());
            dw.put(&body).map_err(|e| NetcapError::Record(e.to_string()))?
        };

        inner.records += 1;
        inner.bytes += n as u64;
        Ok(())
    }

    /// Records successfully written so far
    pub fn num_records(&self) -> u64 {
        self.inner.lock().records
    }

    /// Flush all layers and close the output.
    ///
    /// Idempotent; repeated calls return the same `(name, size)`.
    pub fn close(&self) -> Result<(String, u64)> {
        let mut inner = self.inner.lock();
        if let Some(result) = &inner.closed {
            return Ok(result.clone());
        }

        // Release layers in reverse order of construction
        if let Some(stream) = inner.stream.take() {
            match stream {
                Stream::Gzip(enc) => {
                    let mut base = enc
                        .finish()
                        .map_err(|e| NetcapError::Record(e.to_string()))?;
                    base.flush().map_err(|e| NetcapError::Record(e.to_string()))?;
                }
                Stream::Plain(mut w) => {
                    w.flush().map_err(|e| NetcapError::Record(e.to_string()))?;
                }
            }
        }

        let (name, size) = match &self.path {
            Some(path) => {
                let size = fs::metadata(path)?.len();
                (path.display().to_string(), size)
            }
            None => (self.record_type.name().to_string(), inner.bytes),
        };

        debug!(name = %name, size, records = inner.records, "closed record writer");
        inner.closed = Some((name.clone(), size));
        Ok((name, size))
    }

    pub fn is_chan(&self) -> bool {
        self.chan
    }
}

/// Reader side for `.ncap` and `.ncap.gz` files
pub struct RecordReader {
    inner: DelimitedReader<Box<dyn Read>>,
}

impl RecordReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<RecordReader> {
        let path = path.into();
        let file = File::open(&path)?;
        let base: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(RecordReader {
            inner: DelimitedReader::new(base),
        })
    }

    /// Decode the file header, which must be the first record
    pub fn read_header(&mut self) -> Result<Header> {
        let body = self
            .next_body()?
            .ok_or_else(|| NetcapError::Malformed("empty record file".to_string()))?;
        decode_record(&body)
    }

    /// Next raw record body
    pub fn next_body(&mut self) -> Result<Option<Vec<u8>>> {
        self.inner
            .next()
            .map_err(|e| NetcapError::Malformed(e.to_string()))
    }

    /// Next decoded record
    pub fn next_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next_body()? {
            Some(body) => Ok(Some(decode_record(&body)?)),
            None => Ok(None),
        }
    }
}

/// Decode one framed record body
pub fn decode_record<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| NetcapError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Http;

    fn writer_config(dir: &std::path::Path, compress: bool, csv: bool) -> WriterConfig {
        WriterConfig {
            record_type: RecordType::Http,
            out_dir: dir.display().to_string(),
            buffer: true,
            compress,
            csv,
            chan: false,
            mem_buffer_size: 4096,
            compression_block_size: 4096,
            compression_parallelism: 2,
        }
    }

    fn sample(i: i32) -> Http {
        Http {
            method: "GET".to_string(),
            url: format!("/page/{i}"),
            status_code: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(writer_config(dir.path(), false, false)).unwrap();
        writer.write_header("test", "0.1", false).unwrap();
        for i in 0..10 {
            writer.write_record(&sample(i)).unwrap();
        }
        assert_eq!(writer.num_records(), 10);
        let (name, size) = writer.close().unwrap();
        assert!(name.ends_with("HTTP.ncap"));
        assert!(size > 0);

        let mut reader = RecordReader::open(&name).unwrap();
        let header = reader.read_header().unwrap();
        assert_eq!(header.record_type, RecordType::Http);
        assert_eq!(header.source, "test");

        let mut count = 0;
        while let Some(rec) = reader.next_record::<Http>().unwrap() {
            assert_eq!(rec, sample(count));
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn test_compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(writer_config(dir.path(), true, false)).unwrap();
        writer.write_header("gz", "0.1", true).unwrap();
        for i in 0..1000 {
            writer.write_record(&sample(i)).unwrap();
        }
        let (name, _) = writer.close().unwrap();
        assert!(name.ends_with("HTTP.ncap.gz"));

        let mut reader = RecordReader::open(&name).unwrap();
        assert!(reader.read_header().unwrap().contains_payloads);
        let mut count = 0;
        while let Some(rec) = reader.next_record::<Http>().unwrap() {
            assert_eq!(rec, sample(count));
            count += 1;
        }
        assert_eq!(count, 1000);
    }

    #[test]
    fn test_csv_output() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(writer_config(dir.path(), false, true)).unwrap();
        writer.write_header("csv", "0.1", false).unwrap();

        let mut rec = sample(0);
        rec.user_agent = crate::types::escape_commas("Mozilla/5.0 (X11, Linux)");
        writer.write_record(&rec).unwrap();
        let (name, _) = writer.close().unwrap();
        assert!(name.ends_with("HTTP.csv"));

        let text = std::fs::read_to_string(&name).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,proto,method"));
        let row = lines.next().unwrap();
        assert!(row.contains("Mozilla/5.0 (X11(comma) Linux)"));
        assert!(row.contains("GET"));
    }

    #[test]
    fn test_close_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(writer_config(dir.path(), false, false)).unwrap();
        writer.write_record(&sample(1)).unwrap();

        let first = writer.close().unwrap();
        let second = writer.close().unwrap();
        assert_eq!(first, second);

        // Writes after close fail with a record error
        assert!(writer.write_record(&sample(2)).is_err());
    }

    #[test]
    fn test_chan_mode_rejects_buffering() {
        let mut cfg = writer_config(std::path::Path::new("."), false, false);
        cfg.chan = true;
        cfg.buffer = true;
        assert!(matches!(
            Writer::new(cfg),
            Err(NetcapError::Invariant(_))
        ));
    }

    #[test]
    fn test_chan_mode_delivers_frames() {
        let mut cfg = writer_config(std::path::Path::new("."), false, false);
        cfg.chan = true;
        cfg.buffer = false;

        let writer = Writer::new(cfg).unwrap();
        let rx = writer.chan_rx().unwrap().clone();
        writer.write_record(&sample(7)).unwrap();

        // varint length frame, then the body
        let frame = rx.recv().unwrap();
        assert!(!frame.is_empty());
    }
}
