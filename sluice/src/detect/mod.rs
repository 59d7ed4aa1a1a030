//! Protocol detection: byte-pattern classification with a dynamic
//! confidence model, a per-flow result cache, and a learning loop fed by
//! external outcome reports.

pub mod confidence;
pub mod flow;
pub mod stats;
pub mod validate;

use crate::config;
use crate::logging::{self, Logger};
use crate::time::timestamp_secs;
use flow::{FlowCache, FlowKey};
use stats::DetectionStats;
use std::sync::Mutex;
use validate::Validation;

/// The application protocols the gateway recognizes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Protocol {
    Unknown,
    Mqtt,
    Coap,
    Http,
    Dns,
    Tls,
    Quic,
}

impl Protocol {
    pub const COUNT: usize = 7;

    pub const ALL: [Protocol; Protocol::COUNT] = [
        Protocol::Unknown,
        Protocol::Mqtt,
        Protocol::Coap,
        Protocol::Http,
        Protocol::Dns,
        Protocol::Tls,
        Protocol::Quic,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Protocol::Unknown => 0,
            Protocol::Mqtt => 1,
            Protocol::Coap => 2,
            Protocol::Http => 3,
            Protocol::Dns => 4,
            Protocol::Tls => 5,
            Protocol::Quic => 6,
        }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Unknown => "UNKNOWN",
            Protocol::Mqtt => "MQTT",
            Protocol::Coap => "CoAP",
            Protocol::Http => "HTTP",
            Protocol::Dns => "DNS",
            Protocol::Tls => "TLS",
            Protocol::Quic => "QUIC",
        }
    }

    /// Lowercase tag used in synthesized session ids.
    #[inline]
    pub fn tag(self) -> &'static str {
        match self {
            Protocol::Unknown => "unknown",
            Protocol::Mqtt => "mqtt",
            Protocol::Coap => "coap",
            Protocol::Http => "http",
            Protocol::Dns => "dns",
            Protocol::Tls => "tls",
            Protocol::Quic => "quic",
        }
    }
}

/// A classification result.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Detection {
    pub protocol: Protocol,
    pub confidence: u8,
}

impl Detection {
    #[inline]
    pub fn unknown() -> Detection {
        Detection {
            protocol: Protocol::Unknown,
            confidence: 0,
        }
    }

    #[inline]
    pub fn is_known(&self) -> bool {
        self.protocol != Protocol::Unknown
    }
}

/// Full-scan candidate order. Position doubles as the tie-break priority:
/// an earlier protocol wins an equal validation score.
const SCAN_ORDER: [Protocol; 6] = [
    Protocol::Tls,
    Protocol::Quic,
    Protocol::Http,
    Protocol::Dns,
    Protocol::Mqtt,
    Protocol::Coap,
];

/// Short-circuit first-byte classification. Cheap and optimistic; the
/// caller must confirm the candidate with its validator.
pub fn fast_candidate(payload: &[u8], _is_tcp: bool) -> Option<Protocol> {
    let first = *payload.first()?;

    if first >= 20 && first <= 23 {
        return Some(Protocol::Tls);
    }

    if first & 0x80 != 0 {
        return Some(Protocol::Quic);
    }

    if validate::HTTP_METHODS.iter().any(|m| payload.starts_with(m.as_bytes()))
        || payload.starts_with(b"HTTP/")
    {
        return Some(Protocol::Http);
    }

    if payload.len() >= 4 {
        let opcode = (payload[2] >> 3) & 0xF;
        if opcode <= 2 {
            return Some(Protocol::Dns);
        }
    }

    let packet_type = first >> 4;
    if packet_type >= 1 && packet_type <= 14 {
        return Some(Protocol::Mqtt);
    }

    if first >> 6 == 1 {
        return Some(Protocol::Coap);
    }

    None
}

fn run_validator(protocol: Protocol, payload: &[u8], is_tcp: bool) -> Validation {
    match protocol {
        Protocol::Mqtt => validate::validate_mqtt(payload),
        Protocol::Coap => validate::validate_coap(payload, true),
        Protocol::Http => validate::validate_http(payload),
        Protocol::Dns => validate::validate_dns(payload, is_tcp),
        Protocol::Tls => validate::validate_tls(payload),
        Protocol::Quic => validate::validate_quic(payload),
        Protocol::Unknown => Validation {
            matched: false,
            sub_confidence: 0,
            checks_passed: 0,
            checks_total: 1,
            streaming: false,
        },
    }
}

/// The protocol detector. One instance serves the whole process; the
/// reactor and any capture feed share it behind an `Arc`. The contract
/// for external feeds is `detect_with_state` for classification plus
/// `record_outcome` for ground-truth feedback; both are thread safe.
pub struct Detector {
    config: config::Detection,
    inner: Mutex<Inner>,
    log: Logger,
}

struct Inner {
    flows: FlowCache,
    stats: DetectionStats,
}

impl Detector {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: config::Detection, log: L) -> Detector {
        let inner = Inner {
            flows: FlowCache::new(config.flow_cache_size, config.flow_timeout_secs),
            stats: DetectionStats::new(config.history_size),
        };

        Detector {
            config,
            inner: Mutex::new(inner),
            log: logging::child_or_discard(log),
        }
    }

    /// First-byte short circuit only: no validation, no statistics, no
    /// confidence model. Callers confirm the candidate with
    /// `detect_full` before trusting it.
    #[inline]
    pub fn detect_fast(&self, payload: &[u8], is_tcp: bool) -> Option<Protocol> {
        fast_candidate(payload, is_tcp)
    }

    /// Classify a payload, trying the fast path before the exhaustive
    /// scan. Statistics are updated for every call.
    pub fn detect_full(&self, payload: &[u8], is_tcp: bool) -> Detection {
        let mut inner = self.lock();
        let detection = Self::classify(&mut inner, payload, is_tcp);

        inner.stats.record_packet(detection.protocol, detection.confidence);

        logging::trace!(self.log, "classified payload";
                        "context" => "detect_full",
                        "protocol" => detection.protocol.name(),
                        "confidence" => detection.confidence,
                        "size" => payload.len(),
                        "tcp" => is_tcp);

        detection
    }

    /// State-aware classification: a live flow-cache entry short-circuits
    /// detection entirely for TCP traffic.
    pub fn detect_with_state(
        &self,
        is_tcp: bool,
        flow: Option<FlowKey>,
        payload: &[u8],
    ) -> Detection {
        let now = timestamp_secs();
        let mut inner = self.lock();

        if is_tcp {
            if let Some(key) = flow {
                if let Some(entry) = inner.flows.find(&key, now) {
                    let detection = Detection {
                        protocol: entry.protocol,
                        confidence: 100,
                    };
                    inner.stats.record_packet(detection.protocol, detection.confidence);
                    return detection;
                }
            }
        }

        let detection = Self::classify(&mut inner, payload, is_tcp);
        inner.stats.record_packet(detection.protocol, detection.confidence);

        if detection.is_known() && is_tcp {
            if let Some(key) = flow {
                inner
                    .flows
                    .insert(key, detection.protocol, detection.confidence, now);
            }
        }

        detection
    }

    fn classify(inner: &mut Inner, payload: &[u8], is_tcp: bool) -> Detection {
        if payload.is_empty() {
            return Detection::unknown();
        }

        // Hot path: confirm the first-byte candidate before anything else.
        if let Some(candidate) = fast_candidate(payload, is_tcp) {
            let validation = run_validator(candidate, payload, is_tcp);
            if validation.matched {
                return Self::score(inner, candidate, payload, is_tcp, &validation);
            }
        }

        // Exhaustive scan; highest validation score wins, ties resolve by
        // scan order.
        let mut best: Option<(Protocol, Validation)> = None;

        for &protocol in SCAN_ORDER.iter() {
            let validation = run_validator(protocol, payload, is_tcp);

            if !validation.matched {
                continue;
            }

            let better = match &best {
                Some((_, current)) => validation.sub_confidence > current.sub_confidence,
                _ => true,
            };

            if better {
                best = Some((protocol, validation));
            }
        }

        match best {
            Some((protocol, validation)) => Self::score(inner, protocol, payload, is_tcp, &validation),
            _ => Detection::unknown(),
        }
    }

    fn score(
        inner: &Inner,
        protocol: Protocol,
        payload: &[u8],
        is_tcp: bool,
        validation: &Validation,
    ) -> Detection {
        let historical = inner.stats.historical_accuracy(protocol);
        let features = confidence::extract(protocol, payload, is_tcp, validation, historical);
        let confidence = confidence::score(&features, inner.stats.calibration_factor());

        Detection {
            protocol,
            confidence,
        }
    }

    /// Ground-truth feedback from an external collaborator (operator
    /// tooling or an off-line capture feed).
    pub fn record_outcome(&self, protocol: Protocol, predicted: u8, actual: u8, was_correct: bool) {
        self.lock()
            .stats
            .record_outcome(protocol, predicted, actual, was_correct);
    }

    /// Report traffic of a known protocol that the detector failed to
    /// classify.
    pub fn record_missed(&self, protocol: Protocol) {
        self.lock().stats.record_missed(protocol);
    }

    /// Periodic confidence recalibration. Returns the active factor.
    pub fn calibrate(&self) -> f64 {
        let factor = self.lock().stats.calibrate();

        logging::debug!(self.log, "recalibrated confidence";
                        "context" => "calibrate",
                        "factor" => factor);

        factor
    }

    /// Drop flow-cache entries idle past the configured timeout.
    pub fn evict_flows(&self, now: u64) -> usize {
        self.lock().flows.evict_expired(now)
    }

    pub fn stats_summary(&self) -> String {
        self.lock().stats.summary()
    }

    #[inline]
    pub fn flow_count(&self) -> usize {
        self.lock().flows.len()
    }

    #[inline]
    pub fn config(&self) -> &config::Detection {
        &self.config
    }

    #[inline]
    fn lock(&self) -> std::sync::MutexGuard<Inner> {
        self.inner.lock().expect("Detector mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn detector() -> Detector {
        Detector::new(crate::config::GatewayConfig::default().detection, None)
    }

    const MQTT_CONNECT: [u8; 18] = [
        0x10, 0x12, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04, b't',
        b'e', b's', b't',
    ];

    const COAP_REQUEST: [u8; 18] = [
        0x44, 0x01, 0x12, 0x34, 0xAB, 0xCD, 0xEF, 0x01, 0xB3, b'f', b'o', b'o', 0xFF, b'H', b'e',
        b'l', b'l', b'o',
    ];

    #[test]
    fn test_canonical_mqtt_connect() {
        let detection = detector().detect_full(&MQTT_CONNECT, true);

        assert_eq!(detection.protocol, Protocol::Mqtt);
        assert!(detection.confidence >= 70);
    }

    #[test]
    fn test_canonical_mqtt_pingreq() {
        let detection = detector().detect_full(&[0xC0, 0x00], true);

        assert_eq!(detection.protocol, Protocol::Mqtt);
        assert!(detection.confidence >= 70);
    }

    #[test]
    fn test_canonical_coap_request() {
        let detection = detector().detect_full(&COAP_REQUEST, false);

        assert_eq!(detection.protocol, Protocol::Coap);
        assert!(detection.confidence >= 70);
    }

    #[test]
    fn test_canonical_http_get() {
        let detection = detector().detect_full(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", true);

        assert_eq!(detection.protocol, Protocol::Http);
        assert!(detection.confidence >= 70);
    }

    #[test]
    fn test_canonical_tls_client_hello() {
        let mut packet = vec![0x16, 0x03, 0x01, 0x00, 0x2E, 0x01];
        packet.extend(vec![0u8; 0x2E - 1]);

        let detection = detector().detect_full(&packet, true);

        assert_eq!(detection.protocol, Protocol::Tls);
        assert!(detection.confidence >= 70);
    }

    #[test]
    fn test_fast_path_candidates() {
        let detector = detector();

        assert_eq!(detector.detect_fast(&[0x16, 0x03], true), Some(Protocol::Tls));
        assert_eq!(detector.detect_fast(&[0xC3, 0x00], false), Some(Protocol::Quic));
        assert_eq!(detector.detect_fast(b"GET / HTTP/1.1", true), Some(Protocol::Http));
        assert_eq!(detector.detect_fast(&[0xC0, 0x00], true), Some(Protocol::Quic));
        assert_eq!(detector.detect_fast(&[], true), None);

        // The fast path is optimistic: garbage with the long-header bit
        // still nominates QUIC and only fails full validation.
        assert_eq!(detector.detect_fast(&[0xFF; 5], true), Some(Protocol::Quic));
    }

    #[test]
    fn test_garbage_is_unknown() {
        let detection = detector().detect_full(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF], true);

        assert_eq!(detection.protocol, Protocol::Unknown);
        assert_eq!(detection.confidence, 0);
    }

    #[test]
    fn test_empty_payload_is_unknown() {
        assert!(!detector().detect_full(&[], true).is_known());
    }

    #[test]
    fn test_detection_is_deterministic() {
        let detector = detector();

        let first = detector.detect_full(&MQTT_CONNECT, true);
        let second = detector.detect_full(&MQTT_CONNECT, true);

        assert_eq!(first, second);
    }

    #[test]
    fn test_quic_long_header() {
        let packet = [0xC3, 0x00, 0x00, 0x00, 0x01, 0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let detection = detector().detect_full(&packet, false);

        assert_eq!(detection.protocol, Protocol::Quic);
    }

    #[test]
    fn test_dns_query_over_udp() {
        let mut packet = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        packet.extend(b"\x07example\x03com\x00");
        packet.extend(&[0x00, 0x01, 0x00, 0x01]);

        let detection = detector().detect_full(&packet, false);

        assert_eq!(detection.protocol, Protocol::Dns);
        assert!(detection.confidence >= 50);
    }

    #[test]
    fn test_flow_cache_short_circuits() {
        let detector = detector();
        let flow = FlowKey {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 50_000,
            dst_port: 8080,
        };

        let first = detector.detect_with_state(true, Some(flow), &MQTT_CONNECT);
        assert_eq!(first.protocol, Protocol::Mqtt);

        // Even unclassifiable bytes resolve through the cached flow.
        let second = detector.detect_with_state(true, Some(flow), &[0xC0, 0x00]);
        assert_eq!(second.protocol, Protocol::Mqtt);
        assert_eq!(second.confidence, 100);
    }

    #[test]
    fn test_udp_flows_are_not_cached() {
        let detector = detector();
        let flow = FlowKey {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 50_000,
            dst_port: 8080,
        };

        detector.detect_with_state(false, Some(flow), &COAP_REQUEST);

        assert_eq!(detector.flow_count(), 0);
    }

    #[test]
    fn test_stats_accumulate() {
        let detector = detector();

        detector.detect_full(&MQTT_CONNECT, true);
        detector.detect_full(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF], true);

        let summary = detector.stats_summary();

        assert!(summary.contains("total=2"));
        assert!(summary.contains("identified=1"));
    }

    #[test]
    fn test_learning_loop_shifts_calibration() {
        let detector = detector();

        for _ in 0..20 {
            detector.record_outcome(Protocol::Mqtt, 95, 30, false);
        }

        let factor = detector.calibrate();
        assert!(factor < 1.0);

        // Feedback lowers the historical accuracy and with it the score.
        let detection = detector.detect_full(&MQTT_CONNECT, true);
        assert!(detection.confidence < 72);
    }
}
