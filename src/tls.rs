//! TLS handshake parsing
//!
//! Extracts SNI and JA3/JA3S fingerprints from client and server hello
//! messages. Only the fields needed for profiling are decoded.

use serde::{Deserialize, Serialize};

/// TLS record content type for handshakes
const TLS_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000A;
const EXT_EC_POINT_FORMATS: u16 = 0x000B;

/// JA3 fingerprint: canonical string and its md5 digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ja3Fingerprint {
    pub string: String,
    pub hash: String,
}

/// Decoded TLS client hello
#[derive(Debug, Clone, Default)]
pub struct ClientHello {
    pub version: u16,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub supported_groups: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub sni: Option<String>,
    pub ja3: Option<Ja3Fingerprint>,
}

/// Decoded TLS server hello
#[derive(Debug, Clone, Default)]
pub struct ServerHello {
    pub version: u16,
    pub cipher_suite: u16,
    pub extensions: Vec<u16>,
    pub ja3s: Option<Ja3Fingerprint>,
}

/// GREASE values are reserved and excluded from fingerprints
fn is_grease(v: u16) -> bool {
    (v & 0x0F0F) == 0x0A0A && (v >> 8) == (v & 0xFF)
}

fn join_u16(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

fn join_u8(values: &[u8]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Handshake body of a TLS record, if the payload is one
fn handshake_body(payload: &[u8], handshake_type: u8) -> Option<&[u8]> {
    if payload.len() < 5 || payload[0] != TLS_HANDSHAKE {
        return None;
    }
    let version = u16::from_be_bytes([payload[1], payload[2]]);
    if !(0x0300..=0x0304).contains(&version) {
        return None;
    }
    let body = &payload[5..];
    if body.first() != Some(&handshake_type) {
        return None;
    }
    Some(body)
}

/// Parse a TLS client hello from a TCP payload
pub fn parse_client_hello(payload: &[u8]) -> Option<ClientHello> {
    let data = handshake_body(payload, HANDSHAKE_CLIENT_HELLO)?;
    if data.len() < 38 {
        return None;
    }

    let mut hello = ClientHello {
        version: u16::from_be_bytes([data[4], data[5]]),
        ..Default::default()
    };

    // handshake type (1) + length (3) + version (2) + random (32)
    let mut pos = 38;

    if pos >= data.len() {
        return None;
    }
    let session_id_len = data[pos] as usize;
    pos += 1 + session_id_len;

    if pos + 2 > data.len() {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    if pos + cipher_suites_len > data.len() {
        return None;
    }
    for i in (0..cipher_suites_len).step_by(2) {
        if i + 1 < cipher_suites_len {
            let suite = u16::from_be_bytes([data[pos + i], data[pos + i + 1]]);
            if !is_grease(suite) {
                hello.cipher_suites.push(suite);
            }
        }
    }
    pos += cipher_suites_len;

    if pos >= data.len() {
        return None;
    }
    let compression_len = data[pos] as usize;
    pos += 1 + compression_len;

    if pos + 2 > data.len() {
        hello.ja3 = Some(compute_ja3(&hello));
        return Some(hello);
    }
    let extensions_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;

    let extensions_end = (pos + extensions_len).min(data.len());
    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > data.len() {
            break;
        }
        if !is_grease(ext_type) {
            hello.extensions.push(ext_type);
        }

        let ext_data = &data[pos..pos + ext_len];
        match ext_type {
            EXT_SERVER_NAME => hello.sni = parse_sni(ext_data),
            EXT_SUPPORTED_GROUPS => hello.supported_groups = parse_u16_list(ext_data),
            EXT_EC_POINT_FORMATS => hello.ec_point_formats = parse_u8_list(ext_data),
            _ => {}
        }
        pos += ext_len;
    }

    hello.ja3 = Some(compute_ja3(&hello));
    Some(hello)
}

/// Parse a TLS server hello from a TCP payload
pub fn parse_server_hello(payload: &[u8]) -> Option<ServerHello> {
    let data = handshake_body(payload, HANDSHAKE_SERVER_HELLO)?;
    if data.len() < 38 {
        return None;
    }

    let mut hello = ServerHello {
        version: u16::from_be_bytes([data[4], data[5]]),
        ..Default::default()
    };

    let mut pos = 38;
    if pos >= data.len() {
        return None;
    }
    let session_id_len = data[pos] as usize;
    pos += 1 + session_id_len;

    if pos + 2 > data.len() {
        return None;
    }
    hello.cipher_suite = u16::from_be_bytes([data[pos], data[pos + 1]]);
    pos += 2;

    // compression method
    pos += 1;

    if pos + 2 <= data.len() {
        let extensions_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        let extensions_end = (pos + extensions_len).min(data.len());
        while pos + 4 <= extensions_end {
            let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 4;
            if pos + ext_len > data.len() {
                break;
            }
            if !is_grease(ext_type) {
                hello.extensions.push(ext_type);
            }
            pos += ext_len;
        }
    }

    hello.ja3s = Some(compute_ja3s(&hello));
    Some(hello)
}

fn parse_sni(data: &[u8]) -> Option<String> {
    // server name list length (2), name type (1), name length (2)
    if data.len() < 5 {
        return None;
    }
    let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() < 5 + name_len {
        return None;
    }
    String::from_utf8(data[5..5 + name_len].to_vec()).ok()
}

fn parse_u16_list(data: &[u8]) -> Vec<u16> {
    let mut out = Vec::new();
    if data.len() < 2 {
        return out;
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let mut i = 2;
    while i + 1 < (2 + len).min(data.len()) {
        let v = u16::from_be_bytes([data[i], data[i + 1]]);
        if !is_grease(v) {
            out.push(v);
        }
        i += 2;
    }
    out
}

fn parse_u8_list(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let len = data[0] as usize;
    data[1..(1 + len).min(data.len())].to_vec()
}

/// JA3: md5 over "version,ciphers,extensions,groups,formats"
pub fn compute_ja3(hello: &ClientHello) -> Ja3Fingerprint {
    let string = format!(
        "{},{},{},{},{}",
        hello.version,
        join_u16(&hello.cipher_suites),
        join_u16(&hello.extensions),
        join_u16(&hello.supported_groups),
        join_u8(&hello.ec_point_formats),
    );
    let hash = format!("{:x}", md5::compute(&string));
    Ja3Fingerprint { string, hash }
}

/// JA3S: md5 over "version,cipher,extensions"
pub fn compute_ja3s(hello: &ServerHello) -> Ja3Fingerprint {
    let string = format!(
        "{},{},{}",
        hello.version,
        hello.cipher_suite,
        join_u16(&hello.extensions),
    );
    let hash = format!("{:x}", md5::compute(&string));
    Ja3Fingerprint { string, hash }
}

#[cfg(test)]
pub(crate) fn build_client_hello(sni: &str, ciphers: &[u16]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes()); // client version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id length

    body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
    for c in ciphers {
        body.extend_from_slice(&c.to_be_bytes());
    }
    body.push(1); // compression methods length
    body.push(0); // null compression

    // server_name extension
    let host = sni.as_bytes();
    let mut ext = Vec::new();
    ext.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    ext.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    ext.push(0); // host_name type
    ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
    ext.extend_from_slice(host);

    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![TLS_HANDSHAKE, 0x03, 0x03];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grease_detection() {
        assert!(is_grease(0x0A0A));
        assert!(is_grease(0x5A5A));
        assert!(!is_grease(0x1301));
        assert!(!is_grease(0x0A1A));
    }

    #[test]
    fn test_parse_client_hello_sni() {
        let payload = build_client_hello("example.com", &[0x1301, 0x1302]);
        let hello = parse_client_hello(&payload).unwrap();

        assert_eq!(hello.version, 0x0303);
        assert_eq!(hello.sni.as_deref(), Some("example.com"));
        assert_eq!(hello.cipher_suites, vec![0x1301, 0x1302]);
        assert!(hello.ja3.is_some());
    }

    #[test]
    fn test_grease_excluded_from_ja3() {
        let with_grease = build_client_hello("example.com", &[0x0A0A, 0x1301]);
        let without = build_client_hello("example.com", &[0x1301]);

        let a = parse_client_hello(&with_grease).unwrap();
        let b = parse_client_hello(&without).unwrap();
        assert_eq!(a.ja3.unwrap().hash, b.ja3.unwrap().hash);
    }

    #[test]
    fn test_ja3_stable() {
        let payload = build_client_hello("host", &[0x1301]);
        let a = parse_client_hello(&payload).unwrap().ja3.unwrap();
        let b = parse_client_hello(&payload).unwrap().ja3.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), 32);
    }

    #[test]
    fn test_not_tls() {
        assert!(parse_client_hello(b"GET / HTTP/1.1\r\n").is_none());
        assert!(parse_client_hello(&[]).is_none());
        assert!(parse_server_hello(b"SSH-2.0-OpenSSH_8.9").is_none());
    }
}
