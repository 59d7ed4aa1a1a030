//! The connection reactor: a single-threaded readiness loop multiplexing
//! one TCP listener, one UDP socket, and every accepted connection.
//!
//! Per connection the pipeline is strictly ordered: drain the socket into
//! the read buffer, admit through congestion control, classify if the
//! protocol is still unknown, dispatch to the protocol handler, then
//! flush whatever the handler queued. Periodic maintenance (stale sweep,
//! flow-cache eviction, statistics) runs between poll rounds.

use crate::config::GatewayConfig;
use crate::congestion::Admission;
use crate::detect::flow::FlowKey;
use crate::detect::{Detector, Protocol};
use crate::logging::{self, Logger};
use crate::net::buffer::{Fill, BUFFER_SIZE};
use crate::net::support::NetError;
use crate::proto;
use crate::session::{ConnState, SessionState, SessionTable};
use crate::time::timestamp_secs;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const UDP: Token = Token(1);
const CONN_BASE: usize = 2;

enum ReadOutcome {
    /// Bytes landed in the read buffer.
    Data,
    /// A throttled connection was drained and the bytes discarded.
    Discarded,
    /// The peer closed its end.
    Closed,
    /// The socket failed.
    Failed,
}

/// Drain a socket into a scratch sink, discarding everything read.
fn drain_discard(stream: &mut TcpStream, sink: &mut [u8]) -> ReadOutcome {
    loop {
        match stream.read(sink) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(_) => continue,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome::Discarded;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return ReadOutcome::Failed,
        }
    }
}

/// Payloads shorter than this may still grow into something
/// classifiable; anything longer that matches nothing is hostile.
const MIN_DETECT_LEN: usize = 5;
const MAX_DETECT_ATTEMPTS: u32 = 3;

pub struct Reactor {
    config: GatewayConfig,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    udp: UdpSocket,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    streams: Vec<Option<TcpStream>>,
    table: SessionTable,
    detector: Arc<Detector>,
    scratch: Box<[u8]>,
    last_sweep: Instant,
    last_stats: Instant,
    log: Logger,
}

impl Reactor {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: GatewayConfig,
        detector: Arc<Detector>,
        log: L,
    ) -> io::Result<Reactor> {
        let log = logging::child_or_discard(log);
        let address: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(address)?;
        let mut udp = UdpSocket::bind(address)?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        poll.registry().register(&mut udp, UDP, Interest::READABLE)?;

        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;
        let max_clients = config.server.max_clients;
        let max_events = config.server.max_events;
        let ssthresh = config.limits.slow_start_threshold;

        let mut streams = Vec::with_capacity(max_clients);
        streams.resize_with(max_clients, || None);

        let now = Instant::now();

        Ok(Reactor {
            table: SessionTable::new(max_clients, ssthresh, &log),
            config,
            poll,
            events: Events::with_capacity(max_events),
            listener,
            udp,
            tcp_addr,
            udp_addr,
            streams,
            detector,
            scratch: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            last_sweep: now,
            last_stats: now,
            log,
        })
    }

    #[inline]
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    #[inline]
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    #[inline]
    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    /// Run until the flag clears. Every socket and session is released on
    /// the way out.
    pub fn run(&mut self, running: &AtomicBool) -> io::Result<()> {
        logging::info!(self.log, "gateway listening";
                       "tcp" => %self.tcp_addr,
                       "udp" => %self.udp_addr);

        let timeout = Duration::from_millis(self.config.server.poll_timeout_ms);

        while running.load(Ordering::Relaxed) {
            self.turn(timeout)?;
        }

        self.shutdown();

        Ok(())
    }

    /// One poll round: dispatch readiness, then run due maintenance.
    pub fn turn(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER => self.accept_ready(),
                UDP => self.udp_ready(),
                Token(value) => {
                    let slot = value - CONN_BASE;
                    if writable {
                        self.conn_flush(slot);
                    }
                    if readable {
                        self.conn_read(slot);
                    }
                }
            }
        }

        self.periodic();

        Ok(())
    }

    /// Accept every pending connection. Beyond capacity the stream is
    /// dropped on the spot, which closes the peer's socket.
    fn accept_ready(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            };

            let fd = stream.as_raw_fd();
            let slot = match self.table.create(
                fd,
                peer,
                Protocol::Unknown,
                timestamp_secs(),
                Instant::now(),
            ) {
                Ok(slot) => slot,
                Err(err) => {
                    logging::warn!(self.log, "connection rejected";
                                   "context" => "accept",
                                   "peer" => %peer,
                                   "reason" => %err);
                    continue;
                }
            };

            let token = Token(slot + CONN_BASE);
            if let Err(err) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                logging::error!(self.log, "stream registration failed"; "error" => %err);
                self.table.remove(fd);
                continue;
            }

            logging::debug!(self.log, "accepted connection";
                            "context" => "accept",
                            "fd" => fd,
                            "slot" => slot,
                            "peer" => %peer);

            self.streams[slot] = Some(stream);
        }
    }

    /// Serve one UDP datagram per loop iteration: classify, synthesize a
    /// reply, send. UDP keeps no session state.
    fn udp_ready(&mut self) {
        loop {
            let (size, peer) = match self.udp.recv_from(&mut self.scratch) {
                Ok(received) => received,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "udp receive failed"; "error" => %err);
                    break;
                }
            };

            let payload = &self.scratch[..size];
            let detection = self.detector.detect_full(payload, false);

            logging::info!(
                self.log,
                "Detected {protocol}: {src} -> {dst} (size={size}, confidence={confidence}%)",
                protocol = detection.protocol.name(),
                src = peer,
                dst = self.udp_addr,
                size = size,
                confidence = detection.confidence
            );

            let reply = proto::udp_reply(detection.protocol, payload, detection.confidence);

            match self.udp.send_to(&reply, peer) {
                Ok(_) => (),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Datagram replies are fire and forget.
                    logging::debug!(self.log, "udp reply dropped"; "peer" => %peer);
                }
                Err(err) => {
                    logging::warn!(self.log, "udp send failed"; "peer" => %peer, "error" => %err);
                }
            }
        }
    }

    fn conn_read(&mut self, slot: usize) {
        let outcome = {
            let stream = match self.streams.get_mut(slot).and_then(|s| s.as_mut()) {
                Some(stream) => stream,
                _ => return,
            };
            let record = match self.table.slot_mut(slot) {
                Some(record) => record,
                _ => return,
            };

            // Throttled connections are drained so the peer's kernel
            // buffer keeps moving, but nothing is processed.
            if record.conn_state == ConnState::Throttled {
                drain_discard(stream, &mut self.scratch)
            } else {
                record.conn_state = ConnState::Reading;

                match record.read_buffer.ingress(&mut *stream) {
                    Ok((_, Fill::Eof)) => ReadOutcome::Closed,
                    Ok((_, _)) => ReadOutcome::Data,
                    Err(err) => {
                        logging::debug!(self.log, "read failed";
                                        "fd" => record.fd,
                                        "error" => %err);
                        ReadOutcome::Failed
                    }
                }
            }
        };

        match outcome {
            ReadOutcome::Closed => {
                self.teardown(slot, "peer closed");
                return;
            }
            ReadOutcome::Failed => {
                self.teardown(slot, "read error");
                return;
            }
            ReadOutcome::Discarded => return,
            ReadOutcome::Data => (),
        }

        if !self.process(slot) {
            return;
        }

        // A full buffer that processing could not shrink, with nothing in
        // flight that could unblock it, holds a message larger than the
        // buffer itself; it can never complete.
        if let Some(record) = self.table.slot_mut(slot) {
            if record.read_buffer.free_capacity() == 0
                && record.write_buffer.is_empty()
                && record.congestion.queue_depth() == 0
            {
                record.error_count += 1;
                self.teardown(slot, "oversize message");
                return;
            }

            if record.conn_state == ConnState::Reading {
                record.conn_state = ConnState::Connected;
            }
        }

        self.conn_flush(slot);
    }

    /// Process every complete buffered message on the connection.
    /// Returns false when the connection was torn down.
    fn process(&mut self, slot: usize) -> bool {
        let detector = self.detector.clone();
        let local_addr = self.tcp_addr;
        let window = Duration::from_secs(self.config.limits.rate_window_secs);
        let max_msgs = self.config.limits.max_msgs_per_window;
        let max_depth = self.config.limits.max_queue_depth;

        loop {
            let now = Instant::now();
            let log = self.log.clone();

            let record = match self.table.slot_mut(slot) {
                Some(record) => record,
                _ => return false,
            };

            if record.read_buffer.is_empty() || record.conn_state == ConnState::Closing {
                return true;
            }

            match record.congestion.admit(now, window, max_msgs, max_depth) {
                Admission::Admit => (),
                Admission::Defer => return true,
                Admission::Drop => {
                    logging::debug!(log, "connection throttled";
                                    "fd" => record.fd,
                                    "drops" => record.congestion.consecutive_drops());
                    record.conn_state = ConnState::Throttled;
                    // Everything still buffered is dropped with the
                    // message that tripped the limit.
                    record.read_buffer.clear();
                    record.touch(now);
                    return true;
                }
            }

            if record.protocol == Protocol::Unknown {
                record.detection_attempts += 1;

                let flow = FlowKey::from_addrs(record.remote_addr, local_addr);
                let detection =
                    detector.detect_with_state(true, flow, record.read_buffer.read_slice());

                if !detection.is_known() {
                    if record.read_buffer.len() >= MIN_DETECT_LEN
                        || record.detection_attempts >= MAX_DETECT_ATTEMPTS
                    {
                        record.error_count += 1;
                        self.teardown(slot, "unidentified protocol");
                        return false;
                    }

                    // Too few bytes to condemn the peer yet.
                    return true;
                }

                record.classify(detection.protocol, detection.confidence);

                logging::info!(
                    log,
                    "Detected {protocol}: {src} -> {dst} (size={size}, confidence={confidence}%)",
                    protocol = detection.protocol.name(),
                    src = record.remote_addr,
                    dst = local_addr,
                    size = record.read_buffer.len(),
                    confidence = detection.confidence
                );
            }

            // Handlers parse out of a stable copy of the buffered bytes;
            // the buffer itself only shrinks by what the handler reports
            // consumed, so pipelined and partial packets survive intact.
            let length = record.read_buffer.len();
            let payload = record.read_buffer.read_slice();
            self.scratch[..length].copy_from_slice(payload);

            let pending_before = record.write_buffer.len();

            let verdict = proto::dispatch(record, &self.scratch[..length]);

            match verdict {
                Ok(dispatch) => {
                    record.read_buffer.consume(dispatch.consumed.min(length));
                    record.touch(now);
                    record.message_count += 1;
                    record.total_messages += 1;

                    // Messages with no queued reply complete immediately.
                    if record.write_buffer.len() == pending_before {
                        record.congestion.on_ack();
                    }

                    if dispatch.close_after_flush {
                        record.conn_state = ConnState::Closing;
                        return true;
                    }

                    if dispatch.consumed == 0 {
                        return true;
                    }
                }
                Err(NetError::Wait) => return true,
                Err(NetError::Fatal(kind)) => {
                    record.error_count += 1;
                    logging::debug!(log, "handler failed";
                                    "fd" => record.fd,
                                    "protocol" => record.protocol.name(),
                                    "kind" => ?kind);
                    self.teardown(slot, "protocol error");
                    return false;
                }
            }
        }
    }

    /// Push buffered replies out and manage write interest. On a complete
    /// drain, pending acks are released and deferred messages get another
    /// chance; connections marked for closure are reclaimed.
    fn conn_flush(&mut self, slot: usize) {
        let flushed_empty = {
            let stream = match self.streams.get_mut(slot).and_then(|s| s.as_mut()) {
                Some(stream) => stream,
                _ => return,
            };
            let record = match self.table.slot_mut(slot) {
                Some(record) => record,
                _ => return,
            };

            if !record.write_buffer.is_empty() {
                record.conn_state = match record.conn_state {
                    ConnState::Closing => ConnState::Closing,
                    ConnState::Throttled => ConnState::Throttled,
                    _ => ConnState::Writing,
                };

                let result = record.write_buffer.egress(&mut *stream);

                if let Err(err) = result {
                    logging::debug!(self.log, "write failed";
                                    "fd" => record.fd,
                                    "error" => %err);
                    self.teardown(slot, "write error");
                    return;
                }
            }

            if record.write_buffer.is_empty() {
                while record.congestion.queue_depth() > 0 {
                    record.congestion.on_ack();
                }
                if record.conn_state == ConnState::Writing {
                    record.conn_state = ConnState::Connected;
                }
                true
            } else {
                false
            }
        };

        let (closing, has_backlog) = match self.table.slot(slot) {
            Some(record) => (
                record.conn_state == ConnState::Closing
                    || record.session_state() == SessionState::Disconnecting,
                !record.read_buffer.is_empty(),
            ),
            _ => return,
        };

        if flushed_empty && closing {
            self.teardown(slot, "session complete");
            return;
        }

        if flushed_empty && has_backlog {
            // Acks released deferred messages; run them now.
            if !self.process(slot) {
                return;
            }
        }

        self.update_interest(slot);
    }

    fn update_interest(&mut self, slot: usize) {
        let wants_write = match self.table.slot(slot) {
            Some(record) => !record.write_buffer.is_empty(),
            _ => return,
        };

        let stream = match self.streams.get_mut(slot).and_then(|s| s.as_mut()) {
            Some(stream) => stream,
            _ => return,
        };

        let token = Token(slot + CONN_BASE);
        let interest = match wants_write {
            true => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        };

        let result = self.poll.registry().reregister(stream, token, interest);

        if let Err(err) = result {
            logging::error!(self.log, "reregistration failed"; "error" => %err);
            self.teardown(slot, "registration error");
        }
    }

    /// Close the socket and release the session slot.
    fn teardown(&mut self, slot: usize, reason: &'static str) {
        if let Some(mut stream) = self.streams.get_mut(slot).and_then(|s| s.take()) {
            drop(self.poll.registry().deregister(&mut stream));
        }

        let fd = match self.table.slot(slot) {
            Some(record) => record.fd,
            _ => return,
        };

        if let Some(record) = self.table.remove(fd) {
            logging::debug!(self.log, "connection closed";
                            "context" => "teardown",
                            "fd" => fd,
                            "reason" => reason,
                            "protocol" => record.protocol.name(),
                            "total_messages" => record.total_messages);
        }
    }

    /// Stale sweep, flow-cache eviction and the statistics tick.
    fn periodic(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_sweep)
            >= Duration::from_secs(self.config.server.sweep_interval_secs)
        {
            let idle = Duration::from_secs(self.config.limits.idle_timeout_secs);
            let throttle_idle = Duration::from_secs(self.config.limits.throttle_idle_secs);

            self.table.sweep_stale(now, idle, throttle_idle);

            for slot in self.table.closing_slots() {
                self.teardown(slot, "idle timeout");
            }

            self.detector.evict_flows(timestamp_secs());
            self.last_sweep = now;
        }

        if now.duration_since(self.last_stats)
            >= Duration::from_secs(self.config.server.stats_interval_secs)
        {
            self.detector.calibrate();

            for line in self.detector.stats_summary().lines() {
                logging::info!(self.log, "stats"; "line" => line);
            }
            logging::info!(self.log, "sessions"; "active" => self.table.len());
            self.table.dump();

            self.last_stats = now;
        }
    }

    fn shutdown(&mut self) {
        logging::info!(self.log, "gateway stopping"; "active_sessions" => self.table.len());

        for slot in 0..self.streams.len() {
            if self.streams[slot].is_some() {
                self.teardown(slot, "shutdown");
            }
        }
    }
}
