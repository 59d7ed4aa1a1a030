//! Per protocol message handlers. Handlers never touch a socket: each one
//! parses the buffered message, updates the session's protocol state, and
//! appends any reply to the connection's write buffer for the reactor to
//! flush.

pub mod coap;
pub mod dns;
pub mod http;
pub mod mqtt;
pub mod quic;
pub mod tls;

use crate::detect::Protocol;
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::session::ConnectionRecord;

/// Handler verdict for one parsed message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Dispatch {
    /// Bytes of the read buffer covered by this message.
    pub consumed: usize,
    /// Close the connection once the write buffer drains.
    pub close_after_flush: bool,
}

impl Dispatch {
    #[inline]
    pub fn consume(consumed: usize) -> Dispatch {
        Dispatch {
            consumed,
            close_after_flush: false,
        }
    }

    #[inline]
    pub fn and_close(mut self) -> Dispatch {
        self.close_after_flush = true;
        self
    }
}

/// Route one buffered message to the session's protocol handler.
///
/// `Err(Wait)` means the message is incomplete; the caller leaves the
/// bytes in place and retries after the next read. Fatal errors close
/// the connection.
pub fn dispatch(record: &mut ConnectionRecord, payload: &[u8]) -> NetResult<Dispatch> {
    match record.protocol {
        Protocol::Mqtt => mqtt::handle(record, payload),
        Protocol::Coap => coap::handle(record, payload),
        Protocol::Http => http::handle(record, payload),
        Protocol::Dns => dns::handle(record, payload),
        Protocol::Tls => tls::handle(record, payload),
        Protocol::Quic => quic::handle(record, payload),
        Protocol::Unknown => Err(NetError::Fatal(ErrorKind::Unidentified)),
    }
}

/// Synthesize the reply for one UDP datagram. UDP is sessionless: the
/// reply depends only on the payload and the detection verdict.
pub fn udp_reply(protocol: Protocol, payload: &[u8], confidence: u8) -> Vec<u8> {
    let canned = match protocol {
        Protocol::Coap => coap::udp_reply(payload),
        Protocol::Dns => dns::udp_reply(payload),
        Protocol::Mqtt => mqtt::udp_reply(payload),
        Protocol::Unknown => return b"ERR unknown protocol\n".to_vec(),
        _ => None,
    };

    match canned {
        Some(reply) => reply,
        _ => format!("DETECTED {} confidence={}%\n", protocol.name(), confidence).into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionTable;
    use std::time::Instant;

    pub(crate) fn record(protocol: Protocol) -> (SessionTable, i32) {
        let mut table = SessionTable::new(4, 64, None);
        let addr = "10.0.0.2:40000".parse().unwrap();

        table.create(9, addr, protocol, 42, Instant::now()).unwrap();
        table.get_mut(9).unwrap().detection_confidence = 80;

        (table, 9)
    }

    #[test]
    fn test_unknown_protocol_is_fatal() {
        let (mut table, fd) = record(Protocol::Unknown);
        let record = table.get_mut(fd).unwrap();

        let result = dispatch(record, &[0xFF, 0xFF]);

        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorKind::Unidentified));
    }

    #[test]
    fn test_udp_reply_for_unknown() {
        let reply = udp_reply(Protocol::Unknown, &[0xFF], 0);

        assert_eq!(reply, b"ERR unknown protocol\n");
    }

    #[test]
    fn test_udp_reply_canned_text() {
        let reply = udp_reply(Protocol::Tls, &[0x16, 0x03, 0x01, 0x00, 0x05], 85);

        assert!(String::from_utf8(reply).unwrap().contains("TLS"));
    }
}
