//! MQTT 3.1.1 control packet handling: enough of CONNECT, PUBLISH,
//! SUBSCRIBE, PINGREQ and DISCONNECT to drive a client through a session.

use super::Dispatch;
use crate::detect::validate::mqtt_header;
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::session::{ConnectionRecord, ProtocolData, SessionFlags, SessionState};
use byteorder::{BigEndian, ByteOrder};

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const UNSUBSCRIBE: u8 = 10;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const PINGRESP: [u8; 2] = [0xD0, 0x00];

pub fn handle(record: &mut ConnectionRecord, payload: &[u8]) -> NetResult<Dispatch> {
    let header = match mqtt_header(payload) {
        Ok(header) => header,
        Err(true) => return Err(NetError::Wait),
        Err(false) => return Err(NetError::Fatal(ErrorKind::Malformed)),
    };

    let total = header.header_len + header.remaining_length;
    if payload.len() < total {
        // Some clients mis-encode the remaining length. A CONNECT whose
        // fields all parse out of the buffered bytes is accepted as is;
        // anything else waits for the rest of the packet.
        if header.packet_type == CONNECT {
            if let Some(body_len) = connect_len(&payload[header.header_len..]) {
                let body = &payload[header.header_len..header.header_len + body_len];
                on_connect(record, body)?;
                return Ok(Dispatch::consume(header.header_len + body_len));
            }
        }

        return Err(NetError::Wait);
    }

    let body = &payload[header.header_len..total];

    match header.packet_type {
        CONNECT => on_connect(record, body)?,
        PUBLISH => on_publish(record, header.flags, body)?,
        SUBSCRIBE => on_subscribe(record, body)?,
        UNSUBSCRIBE => on_unsubscribe(record, body)?,
        PINGREQ => append(record, &PINGRESP)?,
        DISCONNECT => {
            record
                .set_session_state(SessionState::Disconnecting)
                .map_err(|_| NetError::Fatal(ErrorKind::Invariant))?;
            return Ok(Dispatch::consume(total).and_close());
        }
        // Remaining client-legal packets (PUBACK and friends) carry no
        // reply at this layer.
        _ => (),
    }

    Ok(Dispatch::consume(total))
}

fn on_connect(record: &mut ConnectionRecord, body: &[u8]) -> NetResult<()> {
    if body.len() < 2 {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let name_len = BigEndian::read_u16(&body[..2]) as usize;
    let name = body
        .get(2..2 + name_len)
        .ok_or(NetError::Fatal(ErrorKind::Malformed))?;

    if name != b"MQTT" && name != b"MQIsdp" {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let rest = &body[2 + name_len..];
    if rest.len() < 4 {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let protocol_level = rest[0];
    let connect_flags = rest[1];
    let keepalive_secs = BigEndian::read_u16(&rest[2..4]);
    let client_id = parse_client_id(&rest[4..]);

    append(record, &CONNACK)?;

    if let ProtocolData::Mqtt(data) = &mut record.protocol_data {
        data.protocol_level = protocol_level;
        data.keepalive_secs = keepalive_secs;
        data.client_id = client_id;
    }

    record.flags.set(SessionFlags::AUTHENTICATED);
    if keepalive_secs > 0 {
        record.flags.set(SessionFlags::KEEP_ALIVE);
    }
    if connect_flags & 0x02 != 0 {
        record.flags.set(SessionFlags::CLEAN_SESSION);
    }

    record
        .set_session_state(SessionState::Authenticated)
        .map_err(|_| NetError::Fatal(ErrorKind::Invariant))?;

    Ok(())
}

/// Actual length of a CONNECT body derived from its own fields: variable
/// header, client id, and the optional will/username/password fields the
/// connect flags announce. `None` while any field is cut off.
fn connect_len(body: &[u8]) -> Option<usize> {
    if body.len() < 2 {
        return None;
    }

    let name_len = BigEndian::read_u16(&body[..2]) as usize;
    let mut pos = 2 + name_len;

    // Level, flags, keepalive.
    if body.len() < pos + 4 {
        return None;
    }
    let connect_flags = body[pos + 1];
    pos += 4;

    pos = sized_field(body, pos)?;

    if connect_flags & 0x04 != 0 {
        pos = sized_field(body, pos)?;
        pos = sized_field(body, pos)?;
    }
    if connect_flags & 0x80 != 0 {
        pos = sized_field(body, pos)?;
    }
    if connect_flags & 0x40 != 0 {
        pos = sized_field(body, pos)?;
    }

    Some(pos)
}

/// Advance past one length-prefixed field.
fn sized_field(body: &[u8], pos: usize) -> Option<usize> {
    if body.len() < pos + 2 {
        return None;
    }

    let len = BigEndian::read_u16(&body[pos..pos + 2]) as usize;
    match body.len() >= pos + 2 + len {
        true => Some(pos + 2 + len),
        _ => None,
    }
}

fn parse_client_id(payload: &[u8]) -> String {
    if payload.len() < 2 {
        return String::new();
    }

    let len = BigEndian::read_u16(&payload[..2]) as usize;
    match payload.get(2..2 + len) {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        _ => String::new(),
    }
}

fn on_publish(record: &mut ConnectionRecord, flags: u8, body: &[u8]) -> NetResult<()> {
    if body.len() < 2 {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let topic_len = BigEndian::read_u16(&body[..2]) as usize;
    let qos = (flags >> 1) & 0x3;

    if body.len() < 2 + topic_len {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    if qos == 1 {
        let id_offset = 2 + topic_len;
        if body.len() < id_offset + 2 {
            return Err(NetError::Fatal(ErrorKind::Malformed));
        }

        let puback = [0x40, 0x02, body[id_offset], body[id_offset + 1]];
        append(record, &puback)?;
    }

    if let ProtocolData::Mqtt(data) = &mut record.protocol_data {
        data.qos = qos;
    }

    activate(record)
}

fn on_subscribe(record: &mut ConnectionRecord, body: &[u8]) -> NetResult<()> {
    if body.len() < 2 {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    // Grant QoS 0 on the single requested filter.
    let suback = [0x90, 0x03, body[0], body[1], 0x00];
    append(record, &suback)?;

    activate(record)
}

fn on_unsubscribe(record: &mut ConnectionRecord, body: &[u8]) -> NetResult<()> {
    if body.len() < 2 {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let unsuback = [0xB0, 0x02, body[0], body[1]];
    append(record, &unsuback)?;

    Ok(())
}

/// Data traffic promotes an authenticated session to `Active`.
fn activate(record: &mut ConnectionRecord) -> NetResult<()> {
    match record.session_state() {
        SessionState::Connected | SessionState::Authenticated => record
            .set_session_state(SessionState::Active)
            .map_err(|_| NetError::Fatal(ErrorKind::Invariant)),
        _ => Ok(()),
    }
}

#[inline]
fn append(record: &mut ConnectionRecord, reply: &[u8]) -> NetResult<()> {
    record
        .write_buffer
        .append(reply)
        .map_err(|_| NetError::Wait)
}

/// Stateless handling for MQTT datagrams arriving over UDP. Only the
/// packets with a fixed reply make sense without a session.
pub fn udp_reply(payload: &[u8]) -> Option<Vec<u8>> {
    let header = mqtt_header(payload).ok()?;

    match header.packet_type {
        CONNECT => Some(CONNACK.to_vec()),
        PINGREQ => Some(PINGRESP.to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Protocol;
    use crate::proto::tests::record;
    use crate::proto::dispatch;

    const CONNECT_PACKET: [u8; 20] = [
        0x10, 0x12, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04, b't',
        b'e', b's', b't', 0x00, 0x00,
    ];

    #[test]
    fn test_connect_yields_connack() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        // Well-formed CONNECT: remaining length 16 covers the variable
        // header and the client id.
        let packet = [
            0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04,
            b't', b'e', b's', b't',
        ];

        let result = dispatch(conn, &packet).unwrap();

        assert_eq!(result.consumed, packet.len());
        assert!(!result.close_after_flush);
        assert_eq!(conn.write_buffer.read_slice(), &CONNACK);
        assert_eq!(conn.session_state(), SessionState::Authenticated);
        assert!(conn.flags.contains(SessionFlags::AUTHENTICATED));
        assert!(conn.flags.contains(SessionFlags::KEEP_ALIVE));
        assert!(conn.flags.contains(SessionFlags::CLEAN_SESSION));

        match &conn.protocol_data {
            ProtocolData::Mqtt(data) => {
                assert_eq!(data.keepalive_secs, 60);
                assert_eq!(data.protocol_level, 4);
                assert_eq!(data.client_id, "test");
            }
            other => panic!("Unexpected protocol data {:?}", other),
        }
    }

    #[test]
    fn test_connect_with_inflated_remaining_length() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        // Declares 18 body bytes but carries 16; the fields themselves are
        // complete, so the packet is accepted as is.
        let packet = [
            0x10, 0x12, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04,
            b't', b'e', b's', b't',
        ];

        let result = dispatch(conn, &packet).unwrap();

        assert_eq!(result.consumed, packet.len());
        assert_eq!(conn.write_buffer.read_slice(), &CONNACK);
        assert_eq!(conn.session_state(), SessionState::Authenticated);
    }

    #[test]
    fn test_partial_connect_waits() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        let result = dispatch(conn, &CONNECT_PACKET[..10]);

        assert_eq!(result.unwrap_err(), NetError::Wait);
        assert!(conn.write_buffer.is_empty());
    }

    #[test]
    fn test_connect_bad_name_is_fatal() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        let packet = [
            0x10, 0x0A, 0x00, 0x04, b'X', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C,
        ];

        assert!(dispatch(conn, &packet).unwrap_err() != NetError::Wait);
    }

    #[test]
    fn test_pingreq_yields_pingresp() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        let result = dispatch(conn, &[0xC0, 0x00]).unwrap();

        assert_eq!(result.consumed, 2);
        assert_eq!(conn.write_buffer.read_slice(), &PINGRESP);
    }

    #[test]
    fn test_publish_qos1_yields_puback() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        // QoS 1 PUBLISH to "t" with packet id 0x0102.
        let packet = [
            0x32, 0x09, 0x00, 0x01, b't', 0x01, 0x02, b'd', b'a', b't', b'a',
        ];

        let result = dispatch(conn, &packet).unwrap();

        assert_eq!(result.consumed, packet.len());
        assert_eq!(conn.write_buffer.read_slice(), &[0x40, 0x02, 0x01, 0x02]);
        assert_eq!(conn.session_state(), SessionState::Active);
    }

    #[test]
    fn test_publish_qos0_is_silent() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        let packet = [0x30, 0x07, 0x00, 0x01, b't', b'd', b'a', b't', b'a'];

        dispatch(conn, &packet).unwrap();

        assert!(conn.write_buffer.is_empty());
    }

    #[test]
    fn test_subscribe_yields_suback() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        // SUBSCRIBE packet id 0x000A, one filter "t" QoS 0.
        let packet = [0x82, 0x06, 0x00, 0x0A, 0x00, 0x01, b't', 0x00];

        dispatch(conn, &packet).unwrap();

        assert_eq!(conn.write_buffer.read_slice(), &[0x90, 0x03, 0x00, 0x0A, 0x00]);
    }

    #[test]
    fn test_disconnect_marks_session() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        let result = dispatch(conn, &[0xE0, 0x00]).unwrap();

        assert!(result.close_after_flush);
        assert_eq!(conn.session_state(), SessionState::Disconnecting);
        assert!(conn.write_buffer.is_empty());
    }

    #[test]
    fn test_pipelined_packets_consume_exactly() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        // PINGREQ followed by the first byte of another packet.
        let buffered = [0xC0, 0x00, 0xE0];

        let result = dispatch(conn, &buffered).unwrap();

        assert_eq!(result.consumed, 2);
    }

    #[test]
    fn test_full_write_buffer_defers() {
        let (mut table, fd) = record(Protocol::Mqtt);
        let conn = table.get_mut(fd).unwrap();

        let fill = vec![0u8; conn.write_buffer.free_capacity()];
        conn.write_buffer.append(&fill).unwrap();

        let result = dispatch(conn, &[0xC0, 0x00]);

        assert_eq!(result.unwrap_err(), NetError::Wait);
    }

    #[test]
    fn test_udp_pingreq() {
        assert_eq!(udp_reply(&[0xC0, 0x00]).unwrap(), PINGRESP.to_vec());
        assert!(udp_reply(&[0x30, 0x02, 0x00, 0x00]).is_none());
    }
}
