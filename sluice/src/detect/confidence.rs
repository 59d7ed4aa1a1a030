//! The dynamic confidence model. Ten normalized features are extracted
//! for the winning protocol and folded through a fixed weighting, scaled
//! by the adaptive calibration factor.

use crate::detect::validate::{
    self, dns_strip_tcp_prefix, find_subsequence, mqtt_connect_name, mqtt_header, Validation,
};
use crate::detect::Protocol;
use byteorder::{BigEndian, ByteOrder};

pub const MIN_CONFIDENCE: u8 = 30;
pub const MAX_CONFIDENCE: u8 = 100;

/// The feature vector, every component in [0, 1].
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub entropy: f64,
    pub pattern_strength: f64,
    pub validation_depth: f64,
    pub header_consistency: f64,
    pub payload_structure: f64,
    pub transport_compatibility: f64,
    pub context_relevance: f64,
    pub historical_accuracy: f64,
    pub false_positive_risk: f64,
    pub specificity: f64,
}

impl Features {
    /// The fixed feature weighting. The false-positive risk enters
    /// inverted: low risk raises confidence.
    pub fn weighted_sum(&self) -> f64 {
        0.15 * self.entropy
            + 0.20 * self.pattern_strength
            + 0.15 * self.validation_depth
            + 0.10 * self.header_consistency
            + 0.10 * self.payload_structure
            + 0.05 * self.transport_compatibility
            + 0.05 * self.context_relevance
            + 0.10 * self.historical_accuracy
            + 0.05 * (1.0 - self.false_positive_risk)
            + 0.05 * self.specificity
    }
}

/// Extract the feature vector for a protocol that passed validation.
pub fn extract(
    protocol: Protocol,
    payload: &[u8],
    is_tcp: bool,
    validation: &Validation,
    historical: f64,
) -> Features {
    Features {
        entropy: entropy_score(payload),
        pattern_strength: pattern_strength(protocol, payload, is_tcp),
        validation_depth: validation.checks_passed as f64 / validation.checks_total.max(1) as f64,
        header_consistency: header_consistency(protocol, payload, is_tcp),
        payload_structure: payload_structure(protocol, payload, is_tcp, validation),
        transport_compatibility: transport_compatibility(protocol, is_tcp),
        context_relevance: context_relevance(protocol),
        historical_accuracy: historical,
        false_positive_risk: false_positive_risk(protocol, payload),
        specificity: specificity(protocol, payload),
    }
}

/// Fold the features into the final 0-100 percentage.
pub fn score(features: &Features, calibration: f64) -> u8 {
    let raw = features.weighted_sum() * calibration * 100.0;
    let clamped = raw.max(f64::from(MIN_CONFIDENCE)).min(f64::from(MAX_CONFIDENCE));

    clamped.round() as u8
}

/// Shannon entropy over the payload bytes, normalized against the 8-bit
/// maximum. Too-short payloads carry no signal and sit at the midpoint.
pub fn entropy_score(payload: &[u8]) -> f64 {
    if payload.len() < 4 {
        return 0.5;
    }

    let mut histogram = [0u32; 256];
    for &byte in payload {
        histogram[byte as usize] += 1;
    }

    let len = payload.len() as f64;
    let mut entropy = 0.0;

    for &count in histogram.iter() {
        if count > 0 {
            let p = f64::from(count) / len;
            entropy -= p * p.log2();
        }
    }

    entropy / 8.0
}

fn pattern_strength(protocol: Protocol, payload: &[u8], is_tcp: bool) -> f64 {
    let mut strength: f64 = 0.0;

    match protocol {
        Protocol::Mqtt => {
            strength += 0.3;
            if let Ok(header) = mqtt_header(payload) {
                if header.remaining_length <= 4 || payload.len() == header.header_len + header.remaining_length {
                    strength += 0.2;
                }
                if header.packet_type == 1 && mqtt_connect_name(payload, header.header_len).is_some() {
                    strength += 0.3;
                }
                if header.header_len == 2 {
                    strength += 0.1;
                }
            }
        }
        Protocol::Coap => {
            strength += 0.3;
            let token_length = (payload[0] & 0x0F) as usize;
            if token_length > 0 && payload.len() >= 4 + token_length {
                strength += 0.2;
            }
            if find_subsequence(payload, &[0xFF]).is_some() {
                strength += 0.3;
            }
        }
        Protocol::Http => {
            if validate::HTTP_METHODS.iter().any(|m| payload.starts_with(m.as_bytes())) {
                strength += 0.4;
            }
            if find_subsequence(payload, b"HTTP/").is_some() {
                strength += 0.3;
            }
            if find_subsequence(payload, b"\r\n").is_some() {
                strength += 0.2;
            }
        }
        Protocol::Dns => {
            let message = dns_strip_tcp_prefix(payload, is_tcp).unwrap_or(payload);
            strength += 0.3;
            if message.len() >= 12 {
                let qdcount = BigEndian::read_u16(&message[4..6]);
                if qdcount >= 1 && qdcount <= 10 {
                    strength += 0.3;
                }
                // Root-terminated name right after the header.
                if message.len() > 12 && message[12] > 0 && message[12] <= 63 {
                    strength += 0.2;
                }
            }
        }
        Protocol::Tls => {
            strength += 0.3;
            if payload.len() >= 3 {
                let version = BigEndian::read_u16(&payload[1..3]);
                if version >= 0x0300 && version <= 0x0304 {
                    strength += 0.3;
                }
            }
            if payload.len() >= 6 && payload[0] == 22 && payload[5] <= 20 {
                strength += 0.2;
            }
        }
        Protocol::Quic => {
            strength += 0.4;
            if payload.len() >= 5 {
                strength += 0.2;
            }
        }
        Protocol::Unknown => (),
    }

    strength.min(1.0)
}

fn header_consistency(protocol: Protocol, payload: &[u8], is_tcp: bool) -> f64 {
    match protocol {
        Protocol::Mqtt => {
            // Flag nibble already validated against the type; a decodable
            // length completes a coherent header.
            match mqtt_header(payload) {
                Ok(_) => 1.0,
                Err(true) => 0.6,
                Err(false) => 0.2,
            }
        }
        Protocol::Dns => {
            let message = dns_strip_tcp_prefix(payload, is_tcp).unwrap_or(payload);
            if message.len() < 12 {
                return 0.3;
            }

            let flags = BigEndian::read_u16(&message[2..4]);
            let qr = flags >> 15;
            let opcode = (flags >> 11) & 0xF;
            let ancount = BigEndian::read_u16(&message[6..8]);

            // Queries carry no answers; responses usually do.
            match (qr, opcode, ancount) {
                (0, 0..=2, 0) => 1.0,
                (1, 0..=2, _) => 0.9,
                _ => 0.5,
            }
        }
        Protocol::Coap => {
            let class = payload[1] >> 5;
            let mtype = (payload[0] >> 4) & 0x3;

            // A CON/NON request pairs with a request class, ACK/RST with a
            // response class.
            match (mtype, class) {
                (0..=1, 0) => 1.0,
                (2..=3, 2..=5) => 1.0,
                _ => 0.6,
            }
        }
        Protocol::Tls | Protocol::Quic | Protocol::Http => 0.9,
        Protocol::Unknown => 0.0,
    }
}

fn payload_structure(protocol: Protocol, payload: &[u8], is_tcp: bool, validation: &Validation) -> f64 {
    if validation.streaming {
        return 0.6;
    }

    match protocol {
        Protocol::Mqtt => match mqtt_header(payload) {
            Ok(header) if payload.len() == header.header_len + header.remaining_length => 1.0,
            Ok(_) => 0.7,
            Err(_) => 0.3,
        },
        Protocol::Coap => {
            let token_length = (payload[0] & 0x0F) as usize;
            let body = &payload[(4 + token_length).min(payload.len())..];

            // Options only, or a marked payload.
            match (body.is_empty(), find_subsequence(body, &[0xFF]).is_some()) {
                (true, _) => 0.8,
                (_, true) => 1.0,
                _ => 0.7,
            }
        }
        Protocol::Http => match find_subsequence(payload, b"\r\n\r\n").is_some() {
            true => 1.0,
            _ => 0.7,
        },
        Protocol::Dns => {
            let message = dns_strip_tcp_prefix(payload, is_tcp).unwrap_or(payload);
            // The question section must fit behind the header.
            match message.len() > 12 {
                true => 1.0,
                _ => 0.6,
            }
        }
        Protocol::Tls => match payload.len() >= 5
            && BigEndian::read_u16(&payload[3..5]) as usize + 5 == payload.len()
        {
            true => 1.0,
            _ => 0.7,
        },
        Protocol::Quic => 0.8,
        Protocol::Unknown => 0.0,
    }
}

fn transport_compatibility(protocol: Protocol, is_tcp: bool) -> f64 {
    match (protocol, is_tcp) {
        (Protocol::Mqtt, true) => 1.0,
        (Protocol::Mqtt, false) => 0.0,
        (Protocol::Http, true) => 1.0,
        (Protocol::Http, false) => 0.0,
        (Protocol::Tls, true) => 1.0,
        (Protocol::Tls, false) => 0.0,
        (Protocol::Coap, false) => 1.0,
        (Protocol::Coap, true) => 0.0,
        (Protocol::Quic, false) => 1.0,
        (Protocol::Quic, true) => 0.0,
        // DNS runs over both transports.
        (Protocol::Dns, _) => 0.5,
        (Protocol::Unknown, _) => 0.0,
    }
}

/// Fixed prior for how strongly each protocol binds to connection state
/// on its transport.
fn context_relevance(protocol: Protocol) -> f64 {
    match protocol {
        Protocol::Mqtt => 0.9,
        Protocol::Tls => 0.9,
        Protocol::Quic => 0.8,
        Protocol::Http => 0.7,
        Protocol::Dns => 0.6,
        Protocol::Coap => 0.6,
        Protocol::Unknown => 0.0,
    }
}

fn false_positive_risk(protocol: Protocol, payload: &[u8]) -> f64 {
    let baseline = match protocol {
        // A bare two-byte header is easy to counterfeit.
        Protocol::Mqtt => 0.3,
        Protocol::Coap => 0.25,
        Protocol::Dns => 0.2,
        Protocol::Quic => 0.15,
        Protocol::Http => 0.1,
        Protocol::Tls => 0.1,
        Protocol::Unknown => 1.0,
    };

    let mut risk: f64 = baseline;
    if payload.len() < 8 {
        risk += 0.1;
    }
    if payload.len() > 2048 {
        risk += 0.05;
    }

    risk.min(1.0)
}

fn specificity(protocol: Protocol, payload: &[u8]) -> f64 {
    let mut points: f64 = 0.0;

    match protocol {
        Protocol::Mqtt => {
            if find_subsequence(payload, b"MQTT").is_some()
                || find_subsequence(payload, b"MQIsdp").is_some()
            {
                points += 0.5;
            }
            if let Ok(header) = mqtt_header(payload) {
                if header.packet_type >= 1 && header.packet_type <= 14 {
                    points += 0.2;
                }
            }
        }
        Protocol::Http => {
            if find_subsequence(payload, b"HTTP/").is_some() {
                points += 0.5;
            }
            if validate::HTTP_METHODS.iter().any(|m| payload.starts_with(m.as_bytes())) {
                points += 0.3;
            }
        }
        Protocol::Tls => {
            points += 0.5;
            if payload.len() >= 6 && payload[0] == 22 && payload[5] == 1 {
                // ClientHello is about as distinctive as TLS gets.
                points += 0.3;
            }
        }
        Protocol::Quic => points += 0.5,
        Protocol::Coap => points += 0.4,
        Protocol::Dns => points += 0.3,
        Protocol::Unknown => (),
    }

    points.min(1.0)
}
