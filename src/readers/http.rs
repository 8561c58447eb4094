//! HTTP stream decoder
//!
//! Parses pipelined requests and responses from the two directions of a
//! completed connection, pairs them in order, and emits one audit record
//! per exchange. Unmatched halves wait in the pairing table until the
//! end-of-capture drain.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{tcp, DecoderSinks};
use crate::error::Result;
use crate::stats::ErrorMap;
use crate::stream::{ConnContext, StreamData};
use crate::types::{escape_commas, Http};
use crate::writer::Writer;

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// One parsed request with the connection endpoints baked in
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub proto: String,
    pub host: String,
    pub user_agent: String,
    pub referer: String,
    pub content_length: i64,
    pub ts: DateTime<Utc>,
    pub src_ip: String,
    pub dst_ip: String,
}

/// One parsed response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: i32,
    pub content_length: i64,
    pub content_type: String,
    pub ts: DateTime<Utc>,
}

/// Flattened direction stream with fragment timestamp marks
struct ByteStream {
    data: Vec<u8>,
    marks: Vec<(usize, DateTime<Utc>)>,
}

impl ByteStream {
    fn from_fragments(frags: &[StreamData]) -> ByteStream {
        let mut data = Vec::new();
        let mut marks = Vec::new();
        for frag in frags {
            marks.push((data.len(), frag.ts));
            data.extend_from_slice(&frag.raw);
        }
        ByteStream { data, marks }
    }

    /// Timestamp of the fragment containing the given offset
    fn ts_at(&self, offset: usize) -> DateTime<Utc> {
        let mut ts = self.marks.first().map(|(_, t)| *t).unwrap_or_else(Utc::now);
        for (start, t) in &self.marks {
            if *start <= offset {
                ts = *t;
            } else {
                break;
            }
        }
        ts
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split a header block into (first line, lowercase header map)
fn parse_head(block: &str) -> Option<(String, HashMap<String, String>)> {
    let mut lines = block.lines();
    let first = lines.next()?.to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    Some((first, headers))
}

/// Length of the message body following the head block
fn body_length(headers: &HashMap<String, String>, stream: &ByteStream, body_start: usize) -> usize {
    if headers
        .get("transfer-encoding")
        .map(|v| v.to_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        // Consume up to and including the last-chunk terminator
        return match find(&stream.data, b"0\r\n\r\n", body_start) {
            Some(end) => end + 5 - body_start,
            None => stream.data.len() - body_start,
        };
    }
    headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
}

/// Parse all requests from the client-to-server stream
pub fn parse_requests(
    frags: &[StreamData],
    src_ip: &str,
    dst_ip: &str,
    errors: &ErrorMap,
) -> Vec<HttpRequest> {
    let stream = ByteStream::from_fragments(frags);
    let mut out = Vec::new();
    let mut offset = 0usize;

    while offset < stream.data.len() {
        let head_end = match find(&stream.data, b"\r\n\r\n", offset) {
            Some(p) => p,
            None => break,
        };
        let block = match std::str::from_utf8(&stream.data[offset..head_end]) {
            Ok(b) => b,
            Err(_) => {
                errors.inc("HTTP-request-encoding");
                break;
            }
        };
        let (first, headers) = match parse_head(block) {
            Some(p) => p,
            None => break,
        };

        let mut parts = first.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let uri = parts.next().unwrap_or("").to_string();
        let proto = parts.next().unwrap_or("HTTP/1.0").to_string();
        if !METHODS.contains(&method.as_str()) {
            errors.inc("HTTP-request-method");
            break;
        }

        let body_start = head_end + 4;
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        out.push(HttpRequest {
            method,
            uri,
            proto,
            host: headers.get("host").cloned().unwrap_or_default(),
            user_agent: headers.get("user-agent").cloned().unwrap_or_default(),
            referer: headers.get("referer").cloned().unwrap_or_default(),
            content_length,
            ts: stream.ts_at(offset),
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
        });

        offset = (body_start + body_length(&headers, &stream, body_start)).min(stream.data.len());
    }

    out
}

/// Parse all responses from the server-to-client stream
pub fn parse_responses(frags: &[StreamData], errors: &ErrorMap) -> Vec<HttpResponse> {
    let stream = ByteStream::from_fragments(frags);
    let mut out = Vec::new();
    let mut offset = 0usize;

    while offset < stream.data.len() {
        let head_end = match find(&stream.data, b"\r\n\r\n", offset) {
            Some(p) => p,
            None => break,
        };
        let block = match std::str::from_utf8(&stream.data[offset..head_end]) {
            Ok(b) => b,
            Err(_) => {
                errors.inc("HTTP-response-encoding");
                break;
            }
        };
        let (first, headers) = match parse_head(block) {
            Some(p) => p,
            None => break,
        };

        if !first.starts_with("HTTP/") {
            errors.inc("HTTP-response-proto");
            break;
        }
        let status_code = first
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(0);

        let body_start = head_end + 4;
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        out.push(HttpResponse {
            status_code,
            content_length,
            content_type: headers.get("content-type").cloned().unwrap_or_default(),
            ts: stream.ts_at(offset),
        });

        offset = (body_start + body_length(&headers, &stream, body_start)).min(stream.data.len());
    }

    out
}

/// Combine a request and/or response into one audit record
pub fn build_record(req: Option<&HttpRequest>, res: Option<&HttpResponse>) -> Http {
    let mut record = Http::default();

    if let Some(req) = req {
        record.timestamp = Some(req.ts);
        record.proto = req.proto.clone();
        record.method = req.method.clone();
        record.host = req.host.clone();
        record.user_agent = escape_commas(&req.user_agent);
        record.referer = escape_commas(&req.referer);
        record.req_content_length = req.content_length;
        record.url = escape_commas(&req.uri);
        record.src_ip = req.src_ip.clone();
        record.dst_ip = req.dst_ip.clone();
    }

    if let Some(res) = res {
        if record.timestamp.is_none() {
            record.timestamp = Some(res.ts);
        }
        record.status_code = res.status_code;
        record.res_content_length = res.content_length;
        record.content_type = res.content_type.clone();
    }

    record
}

#[derive(Default)]
struct PairingInner {
    requests: HashMap<String, Vec<HttpRequest>>,
    responses: HashMap<String, Vec<HttpResponse>>,
    emitted_requests: u64,
    emitted_responses: u64,
}

/// Request/response pairing table shared by all connections.
///
/// Responses can finish parsing before their requests; both halves wait
/// here keyed by the connection ident until the post-capture drain.
#[derive(Default)]
pub struct HttpPairing {
    inner: Mutex<PairingInner>,
}

impl HttpPairing {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_emitted(&self, requests: u64, responses: u64) {
        let mut inner = self.inner.lock();
        inner.emitted_requests += requests;
        inner.emitted_responses += responses;
    }

    /// (requests, responses) emitted so far
    pub fn counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.emitted_requests, inner.emitted_responses)
    }

    /// Entries still waiting for a partner
    pub fn pending(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (
            inner.requests.values().map(|v| v.len()).sum(),
            inner.responses.values().map(|v| v.len()).sum(),
        )
    }

    fn push_unmatched(&self, ident: &str, reqs: Vec<HttpRequest>, ress: Vec<HttpResponse>) {
        if reqs.is_empty() && ress.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if !reqs.is_empty() {
            inner
                .requests
                .entry(ident.to_string())
                .or_default()
                .extend(reqs);
        }
        if !ress.is_empty() {
            inner
                .responses
                .entry(ident.to_string())
                .or_default()
                .extend(ress);
        }
    }

    /// End-of-capture drain: pair whatever matches across the maps, then
    /// flush response-only and request-only records. Returns the number of
    /// records written.
    pub fn drain(&self, writer: Option<&Writer>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut total = 0u64;

        let idents: Vec<String> = inner.responses.keys().cloned().collect();
        for ident in idents {
            let mut responses = inner.responses.remove(&ident).unwrap_or_default();
            let mut requests = inner.requests.remove(&ident).unwrap_or_default();

            let paired = requests.len().min(responses.len());
            for (req, res) in requests.drain(..paired).zip(responses.drain(..paired)) {
                if let Some(w) = writer {
                    w.write_record(&build_record(Some(&req), Some(&res)))?;
                }
                inner.emitted_requests += 1;
                inner.emitted_responses += 1;
                total += 1;
            }

            // Response-only leftovers
            for res in responses {
                if let Some(w) = writer {
                    w.write_record(&build_record(None, Some(&res)))?;
                }
                inner.emitted_responses += 1;
                total += 1;
            }
            // Request-only leftovers for this stream
            for req in requests {
                if let Some(w) = writer {
                    w.write_record(&build_record(Some(&req), None))?;
                }
                inner.emitted_requests += 1;
                total += 1;
            }
        }

        // Streams that never saw a response
        let idents: Vec<String> = inner.requests.keys().cloned().collect();
        for ident in idents {
            for req in inner.requests.remove(&ident).unwrap_or_default() {
                if let Some(w) = writer {
                    w.write_record(&build_record(Some(&req), None))?;
                }
                inner.emitted_requests += 1;
                total += 1;
            }
        }

        Ok(total)
    }
}

/// Decode a completed connection as HTTP
pub fn decode_http(sinks: &DecoderSinks, ctx: &ConnContext) -> Result<()> {
    if !sinks.cfg.decode_http {
        return Ok(());
    }

    let src_ip = ctx.flow.src_ip.to_string();
    let dst_ip = ctx.flow.dst_ip.to_string();

    let mut requests = parse_requests(&ctx.client_data, &src_ip, &dst_ip, &sinks.errors);
    let mut responses = parse_responses(&ctx.server_data, &sinks.errors);
    debug!(
        ident = %ctx.ident,
        requests = requests.len(),
        responses = responses.len(),
        "decoded HTTP streams"
    );

    let paired = requests.len().min(responses.len());
    for (req, res) in requests.drain(..paired).zip(responses.drain(..paired)) {
        if let Some(writer) = &sinks.http_writer {
            writer.write_record(&build_record(Some(&req), Some(&res)))?;
        }
        sinks.http.record_emitted(1, 1);
    }

    sinks.http.push_unmatched(&ctx.ident, requests, responses);

    let banner: Vec<u8> = ctx
        .server_data
        .iter()
        .flat_map(|d| d.raw.iter().copied())
        .take(crate::stream::reader::SERVICE_BANNER_SIZE)
        .collect();
    tcp::save_service_banner(&sinks.services, &sinks.stats, ctx, &banner);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Direction;

    fn frag(bytes: &[u8]) -> StreamData {
        StreamData {
            raw: bytes.to_vec(),
            ts: Utc::now(),
            dir: Direction::ClientToServer,
        }
    }

    #[test]
    fn test_parse_single_request() {
        let errors = ErrorMap::new();
        let data = frag(
            b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test, agent\r\n\r\n",
        );
        let reqs = parse_requests(&[data], "1.1.1.1", "2.2.2.2", &errors);

        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, "GET");
        assert_eq!(reqs[0].uri, "/index.html");
        assert_eq!(reqs[0].host, "example.com");
        assert_eq!(reqs[0].user_agent, "test, agent");
        assert_eq!(reqs[0].src_ip, "1.1.1.1");
        assert_eq!(errors.total(), 0);
    }

    #[test]
    fn test_parse_pipelined_requests() {
        let errors = ErrorMap::new();
        let data = frag(
            b"POST /a HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let reqs = parse_requests(&[data], "", "", &errors);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].method, "POST");
        assert_eq!(reqs[0].content_length, 4);
        assert_eq!(reqs[1].uri, "/b");
    }

    #[test]
    fn test_parse_response_with_body() {
        let errors = ErrorMap::new();
        let data = frag(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 42\r\n\r\n",
        );
        let ress = parse_responses(&[data], &errors);
        assert_eq!(ress.len(), 1);
        assert_eq!(ress[0].status_code, 200);
        assert_eq!(ress[0].content_length, 42);
        assert_eq!(ress[0].content_type, "text/html");
    }

    #[test]
    fn test_record_escapes_commas() {
        let req = HttpRequest {
            method: "GET".to_string(),
            uri: "/p?a=1,2".to_string(),
            proto: "HTTP/1.1".to_string(),
            host: String::new(),
            user_agent: "Agent, with commas".to_string(),
            referer: "http://r/x,y".to_string(),
            content_length: 0,
            ts: Utc::now(),
            src_ip: String::new(),
            dst_ip: String::new(),
        };
        let rec = build_record(Some(&req), None);
        assert_eq!(rec.user_agent, "Agent(comma) with commas");
        assert_eq!(rec.referer, "http://r/x(comma)y");
        assert_eq!(rec.url, "/p?a=1(comma)2");
    }

    #[test]
    fn test_pairing_drain_pairs_and_flushes() {
        let pairing = HttpPairing::new();
        let req = HttpRequest {
            method: "GET".to_string(),
            uri: "/".to_string(),
            proto: "HTTP/1.1".to_string(),
            host: String::new(),
            user_agent: String::new(),
            referer: String::new(),
            content_length: 0,
            ts: Utc::now(),
            src_ip: String::new(),
            dst_ip: String::new(),
        };
        let res = HttpResponse {
            status_code: 200,
            content_length: 1,
            content_type: String::new(),
            ts: Utc::now(),
        };

        pairing.push_unmatched("a", vec![req.clone(), req.clone()], vec![res.clone()]);
        pairing.push_unmatched("b", Vec::new(), vec![res]);

        // One pair on "a", one leftover request on "a", one leftover
        // response on "b"
        let total = pairing.drain(None).unwrap();
        assert_eq!(total, 3);
        let (reqs, ress) = pairing.counts();
        assert_eq!(reqs, 2);
        assert_eq!(ress, 2);
        assert_eq!(pairing.pending(), (0, 0));
    }

    #[test]
    fn test_invalid_method_counted() {
        let errors = ErrorMap::new();
        let data = frag(b"BREW /coffee HTCPCP/1.0\r\n\r\n");
        let reqs = parse_requests(&[data], "", "", &errors);
        assert!(reqs.is_empty());
        assert_eq!(errors.total(), 1);
    }
}
