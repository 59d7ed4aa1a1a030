//! Per connection session records and the fixed-capacity session table.

use crate::congestion::CongestionControl;
use crate::detect::Protocol;
use crate::error::{Error, Result};
use crate::logging::{self, Logger};
use crate::net::buffer::{Buffer, BUFFER_SIZE};
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub type Fd = i32;

/// Socket-level connection state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Listening,
    Connected,
    Reading,
    Writing,
    Throttled,
    Closing,
}

/// Application-level session state. Transitions into `Disconnecting` and
/// `Closed` are one way.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Connected,
    Authenticated,
    Active,
    Disconnecting,
    Closed,
}

impl SessionState {
    #[inline]
    fn is_terminal(self) -> bool {
        match self {
            SessionState::Disconnecting | SessionState::Closed => true,
            _ => false,
        }
    }
}

/// Session flag bitset. The eight constants below are the only legal bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct SessionFlags(u8);

impl SessionFlags {
    pub const ACTIVE: SessionFlags = SessionFlags(0x01);
    pub const AUTHENTICATED: SessionFlags = SessionFlags(0x02);
    pub const KEEP_ALIVE: SessionFlags = SessionFlags(0x04);
    pub const CLEAN_SESSION: SessionFlags = SessionFlags(0x08);
    pub const OBSERVE_ACTIVE: SessionFlags = SessionFlags(0x10);
    pub const HTTP_KEEPALIVE: SessionFlags = SessionFlags(0x20);
    pub const DNS_RECURSIVE: SessionFlags = SessionFlags(0x40);
    pub const TLS_ESTABLISHED: SessionFlags = SessionFlags(0x80);

    #[inline]
    pub fn set(&mut self, flag: SessionFlags) {
        self.0 |= flag.0;
    }

    #[inline]
    pub fn clear(&mut self, flag: SessionFlags) {
        self.0 &= !flag.0;
    }

    #[inline]
    pub fn contains(self, flag: SessionFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// MQTT per session state.
#[derive(Debug, Clone)]
pub struct MqttData {
    pub keepalive_secs: u16,
    pub qos: u8,
    pub client_id: String,
    pub protocol_level: u8,
}

/// CoAP per session state.
#[derive(Debug, Clone)]
pub struct CoapData {
    pub next_message_id: u16,
    pub token: [u8; 8],
    pub token_len: u8,
    pub observe_seq: u32,
}

/// HTTP per session state.
#[derive(Debug, Clone)]
pub struct HttpData {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub host: String,
    pub content_length: usize,
    pub close: bool,
}

/// DNS per session state.
#[derive(Debug, Clone)]
pub struct DnsData {
    pub txn_id: u16,
    pub flags: u16,
    pub query_name: String,
    pub query_type: u16,
}

/// TLS per session state.
#[derive(Debug, Clone)]
pub struct TlsData {
    pub content_type: u8,
    pub version: u16,
    pub handshake_type: u8,
}

/// QUIC per session state.
#[derive(Debug, Clone)]
pub struct QuicData {
    pub version: u32,
    pub packet_type: u8,
    pub connection_id: u64,
}

/// Protocol-specific session state, one variant per protocol.
#[derive(Debug, Clone)]
pub enum ProtocolData {
    None,
    Mqtt(MqttData),
    Coap(CoapData),
    Http(HttpData),
    Dns(DnsData),
    Tls(TlsData),
    Quic(QuicData),
}

impl ProtocolData {
    /// Initial per protocol defaults applied when a session is classified.
    pub fn defaults_for(protocol: Protocol) -> ProtocolData {
        match protocol {
            Protocol::Mqtt => ProtocolData::Mqtt(MqttData {
                keepalive_secs: 60,
                qos: 0,
                client_id: String::new(),
                protocol_level: 4,
            }),
            Protocol::Coap => ProtocolData::Coap(CoapData {
                next_message_id: 1,
                token: [0; 8],
                token_len: 0,
                observe_seq: 0,
            }),
            Protocol::Http => ProtocolData::Http(HttpData {
                method: String::new(),
                uri: String::new(),
                version: "HTTP/1.1".to_string(),
                host: String::new(),
                content_length: 0,
                close: false,
            }),
            Protocol::Dns => ProtocolData::Dns(DnsData {
                txn_id: 0,
                flags: 0,
                query_name: String::new(),
                query_type: 1,
            }),
            Protocol::Tls => ProtocolData::Tls(TlsData {
                content_type: 0,
                version: 0,
                handshake_type: 0,
            }),
            Protocol::Quic => ProtocolData::Quic(QuicData {
                version: 0,
                packet_type: 0,
                connection_id: 0,
            }),
            Protocol::Unknown => ProtocolData::None,
        }
    }
}

/// One live connection. Created on accept, reclaimed on close.
pub struct ConnectionRecord {
    pub fd: Fd,
    pub remote_addr: SocketAddr,
    pub conn_state: ConnState,
    session_state: SessionState,
    pub flags: SessionFlags,
    pub protocol: Protocol,
    pub detection_confidence: u8,
    pub detection_attempts: u32,
    pub read_buffer: Buffer,
    pub write_buffer: Buffer,
    pub protocol_data: ProtocolData,
    pub congestion: CongestionControl,
    pub created_at: u64,
    pub last_activity: Instant,
    pub message_count: u32,
    pub total_messages: u64,
    pub error_count: u32,
    pub session_id: String,
}

impl ConnectionRecord {
    fn new(
        fd: Fd,
        remote_addr: SocketAddr,
        protocol: Protocol,
        ssthresh: u32,
        created_at: u64,
        now: Instant,
    ) -> ConnectionRecord {
        let mut flags = SessionFlags::default();
        flags.set(SessionFlags::ACTIVE);

        ConnectionRecord {
            fd,
            remote_addr,
            conn_state: ConnState::Connected,
            session_state: SessionState::Connected,
            flags,
            protocol,
            detection_confidence: 0,
            detection_attempts: 0,
            read_buffer: Buffer::new(BUFFER_SIZE),
            write_buffer: Buffer::new(BUFFER_SIZE),
            protocol_data: ProtocolData::defaults_for(protocol),
            congestion: CongestionControl::new(ssthresh, now),
            created_at,
            last_activity: now,
            message_count: 0,
            total_messages: 0,
            error_count: 0,
            session_id: format!("{}_{}_{}", protocol.tag(), fd, created_at),
        }
    }

    #[inline]
    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    /// Advance the session state. Transitions out of a terminal state are
    /// rejected, keeping the progression monotonic.
    pub fn set_session_state(&mut self, next: SessionState) -> Result<()> {
        if self.session_state.is_terminal() && !next.is_terminal() {
            return Err(Error::InvalidParam);
        }

        if self.session_state == SessionState::Closed && next == SessionState::Disconnecting {
            return Err(Error::InvalidParam);
        }

        self.session_state = next;
        Ok(())
    }

    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    #[inline]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    /// Record the detector verdict and install protocol defaults.
    pub fn classify(&mut self, protocol: Protocol, confidence: u8) {
        self.protocol = protocol;
        self.detection_confidence = confidence;
        self.protocol_data = ProtocolData::defaults_for(protocol);
        self.session_id = format!("{}_{}_{}", protocol.tag(), self.fd, self.created_at);
    }
}

/// Fixed-capacity table of connection records keyed by socket fd. Slot
/// indices are stable for the lifetime of a record and double as reactor
/// tokens. The reactor owns all mutation; the periodic sweeps run inside
/// its loop, so slot access needs no further synchronization.
pub struct SessionTable {
    slots: Vec<Option<ConnectionRecord>>,
    free: Vec<usize>,
    index: HashMap<Fd, usize>,
    ssthresh: u32,
    log: Logger,
}

impl SessionTable {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        capacity: usize,
        ssthresh: u32,
        log: L,
    ) -> SessionTable {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        SessionTable {
            slots,
            // LIFO free list; the lowest slot comes out first.
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
            ssthresh,
            log: logging::child_or_discard(log),
        }
    }

    /// Create a record for a freshly accepted connection. Duplicate fds
    /// and a full table are rejected.
    pub fn create(
        &mut self,
        fd: Fd,
        remote_addr: SocketAddr,
        protocol: Protocol,
        created_at: u64,
        now: Instant,
    ) -> Result<usize> {
        if fd <= 0 {
            return Err(Error::InvalidParam);
        }

        if self.index.contains_key(&fd) {
            return Err(Error::DuplicateSession);
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            _ => return Err(Error::TableFull),
        };

        let record = ConnectionRecord::new(fd, remote_addr, protocol, self.ssthresh, created_at, now);

        logging::debug!(self.log, "session created";
                        "context" => "create",
                        "fd" => fd,
                        "slot" => slot,
                        "peer" => %remote_addr,
                        "session_id" => %record.session_id);

        self.slots[slot] = Some(record);
        self.index.insert(fd, slot);

        Ok(slot)
    }

    #[inline]
    pub fn get(&self, fd: Fd) -> Option<&ConnectionRecord> {
        let slot = *self.index.get(&fd)?;
        self.slots[slot].as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut ConnectionRecord> {
        let slot = *self.index.get(&fd)?;
        self.slots[slot].as_mut()
    }

    #[inline]
    pub fn slot(&self, slot: usize) -> Option<&ConnectionRecord> {
        self.slots.get(slot)?.as_ref()
    }

    #[inline]
    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut ConnectionRecord> {
        self.slots.get_mut(slot)?.as_mut()
    }

    #[inline]
    pub fn slot_of(&self, fd: Fd) -> Option<usize> {
        self.index.get(&fd).copied()
    }

    /// Remove a record, returning it for final inspection. The slot goes
    /// back on the free list.
    pub fn remove(&mut self, fd: Fd) -> Option<ConnectionRecord> {
        let slot = self.index.remove(&fd)?;
        let mut record = self.slots[slot].take()?;

        record.flags.clear(SessionFlags::ACTIVE);
        drop(record.set_session_state(SessionState::Closed));
        self.free.push(slot);

        logging::debug!(self.log, "session removed";
                        "context" => "remove",
                        "fd" => fd,
                        "slot" => slot,
                        "total_messages" => record.total_messages,
                        "errors" => record.error_count);

        Some(record)
    }

    pub fn update_protocol(&mut self, fd: Fd, protocol: Protocol, confidence: u8) -> Result<()> {
        match self.get_mut(fd) {
            Some(record) => {
                record.classify(protocol, confidence);
                Ok(())
            }
            _ => Err(Error::NoSuchSession),
        }
    }

    pub fn update_activity(&mut self, fd: Fd, now: Instant) -> Result<()> {
        match self.get_mut(fd) {
            Some(record) => {
                record.touch(now);
                Ok(())
            }
            _ => Err(Error::NoSuchSession),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Walk all active records: idle connections are marked `Closing` for
    /// the reactor to reclaim, and throttled connections that have gone
    /// quiet are released back to `Connected` with a fresh rate window.
    /// Returns the number of records marked for closure.
    pub fn sweep_stale(
        &mut self,
        now: Instant,
        idle_timeout: Duration,
        throttle_idle: Duration,
    ) -> usize {
        let mut marked = 0;

        for record in self.slots.iter_mut().filter_map(|slot| slot.as_mut()) {
            let idle = record.idle_for(now);

            if idle > idle_timeout {
                if record.conn_state != ConnState::Closing {
                    logging::debug!(self.log, "session idle timeout";
                                    "context" => "sweep",
                                    "fd" => record.fd,
                                    "idle_secs" => idle.as_secs());
                    record.conn_state = ConnState::Closing;
                    marked += 1;
                }
                continue;
            }

            if record.conn_state == ConnState::Throttled && idle > throttle_idle {
                record.conn_state = ConnState::Connected;
                record.congestion.reset_window(now);

                logging::debug!(self.log, "session released from throttle";
                                "context" => "sweep",
                                "fd" => record.fd);
            }
        }

        marked
    }

    /// Slots currently marked `Closing`, for reclamation by the reactor.
    pub fn closing_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, record)| match record {
                Some(record) if record.conn_state == ConnState::Closing => Some(slot),
                _ => None,
            })
            .collect()
    }

    /// Log one line per active session.
    pub fn dump(&self) {
        for record in self.slots.iter().filter_map(|slot| slot.as_ref()) {
            logging::info!(self.log, "session";
                           "id" => %record.session_id,
                           "peer" => %record.remote_addr,
                           "protocol" => record.protocol.name(),
                           "confidence" => record.detection_confidence,
                           "state" => ?record.conn_state,
                           "messages" => record.total_messages);
        }
    }
}
