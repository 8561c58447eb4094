//! Audit record types
//!
//! Typed, self-describing messages emitted by the engine. Every record file
//! starts with a [`Header`] describing the record type that follows; all
//! records in a file are homogeneous.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the record type stored in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Header,
    Http,
    Service,
    Connection,
    IpProfile,
}

impl RecordType {
    /// File basename for this record type
    pub fn name(&self) -> &'static str {
        match self {
            RecordType::Header => "Header",
            RecordType::Http => "HTTP",
            RecordType::Service => "Service",
            RecordType::Connection => "Connection",
            RecordType::IpProfile => "IPProfile",
        }
    }

    /// CSV column set for this record type
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            RecordType::Header => &["type", "created", "source", "version", "contains_payloads"],
            RecordType::Http => &[
                "timestamp",
                "proto",
                "method",
                "host",
                "user_agent",
                "referer",
                "req_content_length",
                "url",
                "src_ip",
                "dst_ip",
                "status_code",
                "res_content_length",
                "content_type",
            ],
            RecordType::Service => &[
                "timestamp",
                "name",
                "product",
                "vendor",
                "version",
                "protocol",
                "ip",
                "port",
                "hostname",
                "bytes_client",
                "bytes_server",
                "banner",
            ],
            RecordType::Connection => &[
                "timestamp_first",
                "timestamp_last",
                "proto",
                "src_ip",
                "src_port",
                "dst_ip",
                "dst_port",
                "total_size",
                "num_packets",
            ],
            RecordType::IpProfile => &[
                "addr",
                "timestamp_first",
                "timestamp_last",
                "num_packets",
                "bytes",
                "dns_names",
                "snis",
                "ja3_hashes",
                "protocols",
                "src_ports",
                "dst_ports",
                "geolocation",
            ],
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Replace commas so values survive CSV projection
pub fn escape_commas(s: &str) -> String {
    s.replace(',', "(comma)")
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Common interface of all audit records
pub trait AuditRecord: Serialize {
    /// Record type id
    fn record_type(&self) -> RecordType;

    /// Values projected into one CSV row, aligned with
    /// `RecordType::columns`
    fn csv_values(&self) -> Vec<String>;
}

/// File header preceding the record stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Header {
    pub record_type: RecordType,
    pub created: DateTime<Utc>,
    pub source: String,
    pub version: String,
    pub contains_payloads: bool,
}

impl AuditRecord for Header {
    fn record_type(&self) -> RecordType {
        RecordType::Header
    }

    fn csv_values(&self) -> Vec<String> {
        vec![
            self.record_type.to_string(),
            ts(&self.created),
            self.source.clone(),
            self.version.clone(),
            self.contains_payloads.to_string(),
        ]
    }
}

/// One matched (or partial) HTTP exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Http {
    pub timestamp: Option<DateTime<Utc>>,
    pub proto: String,
    pub method: String,
    pub host: String,
    /// Commas escaped to `(comma)`
    pub user_agent: String,
    /// Commas escaped to `(comma)`
    pub referer: String,
    pub req_content_length: i64,
    /// Commas escaped to `(comma)`
    pub url: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub status_code: i32,
    pub res_content_length: i64,
    pub content_type: String,
}

impl AuditRecord for Http {
    fn record_type(&self) -> RecordType {
        RecordType::Http
    }

    fn csv_values(&self) -> Vec<String> {
        vec![
            self.timestamp.as_ref().map(ts).unwrap_or_default(),
            self.proto.clone(),
            self.method.clone(),
            self.host.clone(),
            self.user_agent.clone(),
            self.referer.clone(),
            self.req_content_length.to_string(),
            self.url.clone(),
            self.src_ip.clone(),
            self.dst_ip.clone(),
            self.status_code.to_string(),
            self.res_content_length.to_string(),
            self.content_type.clone(),
        ]
    }
}

/// A network service identified from a captured banner
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub timestamp: Option<DateTime<Utc>>,
    pub name: String,
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub protocol: String,
    pub ip: String,
    pub port: u16,
    pub hostname: String,
    pub bytes_client: u64,
    pub bytes_server: u64,
    pub banner: String,
}

impl AuditRecord for Service {
    fn record_type(&self) -> RecordType {
        RecordType::Service
    }

    fn csv_values(&self) -> Vec<String> {
        vec![
            self.timestamp.as_ref().map(ts).unwrap_or_default(),
            self.name.clone(),
            self.product.clone(),
            self.vendor.clone(),
            self.version.clone(),
            self.protocol.clone(),
            self.ip.clone(),
            self.port.to_string(),
            self.hostname.clone(),
            self.bytes_client.to_string(),
            self.bytes_server.to_string(),
            escape_commas(&self.banner),
        ]
    }
}

/// A transport-level conversation (used for UDP streams)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub timestamp_first: Option<DateTime<Utc>>,
    pub timestamp_last: Option<DateTime<Utc>>,
    pub proto: String,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub total_size: u64,
    pub num_packets: u64,
}

impl AuditRecord for Connection {
    fn record_type(&self) -> RecordType {
        RecordType::Connection
    }

    fn csv_values(&self) -> Vec<String> {
        vec![
            self.timestamp_first.as_ref().map(ts).unwrap_or_default(),
            self.timestamp_last.as_ref().map(ts).unwrap_or_default(),
            self.proto.clone(),
            self.src_ip.clone(),
            self.src_port.to_string(),
            self.dst_ip.clone(),
            self.dst_port.to_string(),
            self.total_size.to_string(),
            self.num_packets.to_string(),
        ]
    }
}

/// Per-port traffic totals inside a profile
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Port {
    pub bytes: u64,
    pub num_tcp: u64,
    pub num_udp: u64,
}

/// One identified application protocol inside a profile
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Protocol {
    pub packets: u64,
    pub category: String,
}

/// Geolocation result for an address
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Geolocation {
    pub country: String,
    pub city: String,
}

impl std::fmt::Display for Geolocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.city.is_empty() {
            write!(f, "{}", self.country)
        } else {
            write!(f, "{}/{}", self.country, self.city)
        }
    }
}

/// Behavioral profile of a single source address
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IpProfile {
    pub addr: String,
    pub timestamp_first: Option<DateTime<Utc>>,
    pub timestamp_last: Option<DateTime<Utc>>,
    pub num_packets: u64,
    pub bytes: u64,
    pub dns_names: Vec<String>,
    /// SNI -> observation count
    pub snis: HashMap<String, i64>,
    /// JA3 hash -> description
    pub ja3: HashMap<String, String>,
    /// Protocol name -> stats
    pub protocols: HashMap<String, Protocol>,
    /// Source port -> totals
    pub src_ports: HashMap<String, Port>,
    /// Destination port -> totals
    pub dst_ports: HashMap<String, Port>,
    pub geolocation: Option<Geolocation>,
}

impl AuditRecord for IpProfile {
    fn record_type(&self) -> RecordType {
        RecordType::IpProfile
    }

    fn csv_values(&self) -> Vec<String> {
        let mut snis: Vec<_> = self.snis.keys().cloned().collect();
        snis.sort();
        let mut ja3: Vec<_> = self.ja3.keys().cloned().collect();
        ja3.sort();
        let mut protos: Vec<_> = self.protocols.keys().cloned().collect();
        protos.sort();
        let mut src_ports: Vec<_> = self.src_ports.keys().cloned().collect();
        src_ports.sort();
        let mut dst_ports: Vec<_> = self.dst_ports.keys().cloned().collect();
        dst_ports.sort();

        vec![
            self.addr.clone(),
            self.timestamp_first.as_ref().map(ts).unwrap_or_default(),
            self.timestamp_last.as_ref().map(ts).unwrap_or_default(),
            self.num_packets.to_string(),
            self.bytes.to_string(),
            self.dns_names.join(";"),
            snis.join(";"),
            ja3.join(";"),
            protos.join(";"),
            src_ports.join(";"),
            dst_ports.join(";"),
            self.geolocation
                .as_ref()
                .map(|g| g.to_string())
                .unwrap_or_default(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_commas() {
        assert_eq!(escape_commas("a,b,c"), "a(comma)b(comma)c");
        assert_eq!(escape_commas("plain"), "plain");
    }

    #[test]
    fn test_http_csv_alignment() {
        let h = Http::default();
        assert_eq!(h.csv_values().len(), RecordType::Http.columns().len());
    }

    #[test]
    fn test_service_csv_alignment() {
        let s = Service::default();
        assert_eq!(s.csv_values().len(), RecordType::Service.columns().len());
    }

    #[test]
    fn test_connection_csv_alignment() {
        let c = Connection::default();
        assert_eq!(c.csv_values().len(), RecordType::Connection.columns().len());
    }

    #[test]
    fn test_profile_csv_alignment() {
        let p = IpProfile::default();
        assert_eq!(p.csv_values().len(), RecordType::IpProfile.columns().len());
    }

    #[test]
    fn test_record_type_names() {
        assert_eq!(RecordType::Http.name(), "HTTP");
        assert_eq!(RecordType::IpProfile.name(), "IPProfile");
    }
}
