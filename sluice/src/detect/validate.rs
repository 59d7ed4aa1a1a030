//! Byte-level protocol validators. Every validator is total over arbitrary
//! input: out-of-bounds data means "no match", never an error.

use byteorder::{BigEndian, ByteOrder};

/// HTTP request methods recognized in a request line.
pub const HTTP_METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "TRACE ", "CONNECT ",
];

/// Header names accepted as evidence when the request line is absent.
const HTTP_HEADERS: [&str; 6] = [
    "Host:", "Content-Type:", "Content-Length:", "User-Agent:", "Accept:", "Connection:",
];

/// QUIC versions the detector recognizes: version negotiation, the Google
/// Q0xx drafts, and v1.
const QUIC_VERSIONS: [u32; 6] = [
    0x0000_0000,
    0x5130_3339, // Q039
    0x5130_3433, // Q043
    0x5130_3436, // Q046
    0x5130_3530, // Q050
    0x0000_0001,
];

/// Outcome of one protocol validation pass.
#[derive(Debug, Copy, Clone)]
pub struct Validation {
    pub matched: bool,
    /// 0-100 score accumulated from the individual checks. The validator
    /// passes iff the score reaches 50.
    pub sub_confidence: u8,
    pub checks_passed: u32,
    pub checks_total: u32,
    /// The payload is a syntactically valid prefix of a longer message.
    pub streaming: bool,
}

impl Validation {
    #[inline]
    fn no_match() -> Validation {
        Validation {
            matched: false,
            sub_confidence: 0,
            checks_passed: 0,
            checks_total: 1,
            streaming: false,
        }
    }

    #[inline]
    fn from_score(score: i32, passed: u32, total: u32, streaming: bool) -> Validation {
        let clamped = score.max(0).min(100) as u8;
        Validation {
            matched: clamped >= 50,
            sub_confidence: clamped,
            checks_passed: passed,
            checks_total: total,
            streaming,
        }
    }
}

/// Decoded MQTT fixed header.
pub struct MqttHeader {
    pub packet_type: u8,
    pub flags: u8,
    pub remaining_length: usize,
    /// Fixed header size: type byte plus the variable length encoding.
    pub header_len: usize,
}

/// Decode the MQTT fixed header. Returns `Err(true)` when the variable
/// length integer is still incomplete (more bytes needed) and
/// `Err(false)` when it is malformed.
pub fn mqtt_header(payload: &[u8]) -> Result<MqttHeader, bool> {
    if payload.len() < 2 {
        return Err(true);
    }

    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;

    for i in 0..4 {
        let index = 1 + i;
        if index >= payload.len() {
            return Err(true);
        }

        let byte = payload[index];
        remaining += (byte & 0x7F) as usize * multiplier;

        if byte & 0x80 == 0 {
            return Ok(MqttHeader {
                packet_type: payload[0] >> 4,
                flags: payload[0] & 0x0F,
                remaining_length: remaining,
                header_len: 2 + i,
            });
        }

        multiplier *= 128;
    }

    // A fifth continuation byte is illegal.
    Err(false)
}

/// Flag nibble rules per packet type (MQTT 3.1.1 §2.2.2).
#[inline]
fn mqtt_flags_valid(packet_type: u8, flags: u8) -> bool {
    match packet_type {
        // PUBLISH: QoS bits must not both be set.
        3 => (flags >> 1) & 0x3 != 0x3,
        // SUBSCRIBE, UNSUBSCRIBE, PUBREL carry mandatory bit 1.
        6 | 8 | 10 => flags == 0x02,
        _ => flags == 0,
    }
}

pub fn validate_mqtt(payload: &[u8]) -> Validation {
    if payload.len() < 2 {
        return Validation::no_match();
    }

    let packet_type = payload[0] >> 4;
    if packet_type == 0 || packet_type == 15 {
        return Validation::no_match();
    }

    let mut score: i32 = 25;
    let mut passed = 1;
    let mut total = 4;
    let mut streaming = false;

    let flags = payload[0] & 0x0F;
    if !mqtt_flags_valid(packet_type, flags) {
        return Validation::from_score(score - 25, 0, total, false);
    }
    score += 20;
    passed += 1;

    let header = match mqtt_header(payload) {
        Ok(header) => header,
        Err(true) => return Validation::from_score(score, passed, total, true),
        Err(false) => return Validation::from_score(0, passed, total, false),
    };
    score += 20;
    passed += 1;

    let expected = header.header_len + header.remaining_length;
    if payload.len() == expected {
        score += 15;
        passed += 1;
    } else if payload.len() < expected {
        // A valid prefix of a longer packet; accepted with reduced
        // confidence.
        streaming = true;
        score += 5;
    } else {
        // Trailing bytes belong to a pipelined packet.
        score += 10;
        passed += 1;
    }

    match header.packet_type {
        // CONNECT must carry a known protocol name.
        1 => {
            total += 1;
            match mqtt_connect_name(payload, header.header_len) {
                Some(_) => {
                    score += 35;
                    passed += 1;
                }
                _ if streaming && payload.len() < header.header_len + 8 => {
                    // Not enough bytes yet to see the name.
                }
                _ => return Validation::from_score(0, passed, total, streaming),
            }
        }
        // PINGREQ, PINGRESP, DISCONNECT have empty bodies.
        12 | 13 | 14 => {
            total += 1;
            match header.remaining_length == 0 {
                true => {
                    score += 15;
                    passed += 1;
                }
                _ => score -= 10,
            }
        }
        _ => (),
    }

    Validation::from_score(score, passed, total, streaming)
}

/// Extracts the CONNECT protocol name when it is one of the two legal
/// values ("MQTT" for 3.1.1/5.0, "MQIsdp" for 3.1).
pub fn mqtt_connect_name(payload: &[u8], header_len: usize) -> Option<&'static str> {
    if payload.len() < header_len + 2 {
        return None;
    }

    let name_len = BigEndian::read_u16(&payload[header_len..]) as usize;
    let name = payload.get(header_len + 2..header_len + 2 + name_len)?;

    match name {
        b"MQTT" => Some("MQTT"),
        b"MQIsdp" => Some("MQIsdp"),
        _ => None,
    }
}

pub fn validate_coap(payload: &[u8], strict: bool) -> Validation {
    if payload.len() < 4 {
        return Validation::no_match();
    }

    let version = payload[0] >> 6;
    if version != 1 {
        return Validation::no_match();
    }

    let mut score: i32 = 25;
    let mut passed = 1;
    let total = 4;

    let token_length = (payload[0] & 0x0F) as usize;
    if token_length > 8 {
        return Validation::from_score(0, passed, total, false);
    }
    score += 25;
    passed += 1;

    let class = payload[1] >> 5;
    let class_ok = match class {
        1 | 3 | 6 | 7 => !strict,
        _ => true,
    };
    if !class_ok {
        return Validation::from_score(score - 25, passed, total, false);
    }
    score += 25;
    passed += 1;

    match payload.len() >= 4 + token_length {
        true => {
            score += 25;
            passed += 1;
        }
        _ => return Validation::from_score(score - 30, passed, total, true),
    }

    Validation::from_score(score, passed, total, false)
}

pub fn validate_http(payload: &[u8]) -> Validation {
    if payload.len() < 5 {
        return Validation::no_match();
    }

    let mut score: i32 = 0;
    let mut passed = 0;
    let total = 4;

    let has_method = HTTP_METHODS.iter().any(|m| payload.starts_with(m.as_bytes()));
    let is_response = payload.starts_with(b"HTTP/");

    if has_method || is_response {
        score += 40;
        passed += 1;
    }

    // A version token somewhere in the first line.
    let line_end = payload
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(payload.len());
    if find_subsequence(&payload[..line_end], b"HTTP/").is_some() {
        score += 25;
        passed += 1;
    }

    // Header material in the early bytes.
    let head = &payload[..payload.len().min(128)];
    if HTTP_HEADERS
        .iter()
        .any(|h| find_subsequence(head, h.as_bytes()).is_some())
    {
        score += 20;
        passed += 1;
    }

    if find_subsequence(payload, b"\r\n").is_some() {
        score += 15;
        passed += 1;
    }

    Validation::from_score(score, passed, total, false)
}

pub fn validate_dns(payload: &[u8], is_tcp: bool) -> Validation {
    // DNS over TCP prefixes the message with its length.
    let message = match dns_strip_tcp_prefix(payload, is_tcp) {
        Some(message) => message,
        _ => payload,
    };

    if message.len() < 12 {
        return Validation::no_match();
    }

    let mut score: i32 = 20;
    let mut passed = 1;
    let total = 5;

    if message.as_ptr() != payload.as_ptr() {
        // The TCP length prefix matched exactly.
        score += 10;
    }

    let flags = BigEndian::read_u16(&message[2..4]);
    let qr = flags >> 15;
    let opcode = (flags >> 11) & 0xF;
    let rcode = flags & 0xF;

    if opcode > 5 {
        return Validation::from_score(0, passed, total, false);
    }
    score += 20;
    passed += 1;

    if rcode > 5 {
        return Validation::from_score(0, passed, total, false);
    }
    score += 15;
    passed += 1;

    // A query cannot carry a response code.
    if qr == 0 && rcode != 0 {
        return Validation::from_score(0, passed, total, false);
    }
    score += 15;
    passed += 1;

    let qdcount = BigEndian::read_u16(&message[4..6]) as u32;
    let ancount = BigEndian::read_u16(&message[6..8]) as u32;
    let nscount = BigEndian::read_u16(&message[8..10]) as u32;
    let arcount = BigEndian::read_u16(&message[10..12]) as u32;

    let counts_ok = qdcount <= 1000 && ancount <= 10_000 && nscount <= 10_000 && arcount <= 10_000;
    match counts_ok {
        true => {
            score += 20;
            passed += 1;
        }
        _ => return Validation::from_score(0, passed, total, false),
    }

    Validation::from_score(score, passed, total, false)
}

#[inline]
pub fn dns_strip_tcp_prefix(payload: &[u8], is_tcp: bool) -> Option<&[u8]> {
    if !is_tcp || payload.len() < 2 {
        return None;
    }

    let declared = BigEndian::read_u16(&payload[..2]) as usize;
    match declared == payload.len() - 2 {
        true => Some(&payload[2..]),
        _ => None,
    }
}

pub fn validate_tls(payload: &[u8]) -> Validation {
    if payload.len() < 5 {
        return Validation::no_match();
    }

    let content_type = payload[0];
    if content_type < 20 || content_type > 23 {
        return Validation::no_match();
    }

    let mut score: i32 = 30;
    let mut passed = 1;
    let mut total = 3;
    let mut streaming = false;

    let version = BigEndian::read_u16(&payload[1..3]);
    if version < 0x0300 || version > 0x0304 {
        return Validation::from_score(0, passed, total, false);
    }
    score += 30;
    passed += 1;

    let declared = BigEndian::read_u16(&payload[3..5]) as usize;
    if declared + 5 <= payload.len() {
        score += 20;
        passed += 1;
    } else {
        // A record split across reads is still a plausible TLS prefix.
        streaming = true;
        score += 5;
    }

    if content_type == 22 {
        total += 1;
        if payload.len() >= 6 {
            match payload[5] <= 20 {
                true => {
                    score += 15;
                    passed += 1;
                }
                _ => return Validation::from_score(0, passed, total, streaming),
            }
        }
    }

    Validation::from_score(score, passed, total, streaming)
}

pub fn validate_quic(payload: &[u8]) -> Validation {
    if payload.len() < 5 {
        return Validation::no_match();
    }

    if payload[0] & 0x80 == 0 {
        return Validation::no_match();
    }

    let mut score: i32 = 30;
    let mut passed = 1;
    let total = 2;

    let version = BigEndian::read_u32(&payload[1..5]);
    match QUIC_VERSIONS.contains(&version) {
        true => {
            score += 45;
            passed += 1;
        }
        _ => return Validation::from_score(0, passed, total, false),
    }

    Validation::from_score(score, passed, total, false)
}

#[inline]
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    haystack.windows(needle.len()).position(|w| w == needle)
}
