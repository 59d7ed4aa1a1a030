//! TLS record inspection. The gateway terminates nothing: records are
//! consumed, the handshake is observed, and no reply is generated.

use super::Dispatch;
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::session::{ConnectionRecord, ProtocolData, SessionFlags};
use byteorder::{BigEndian, ByteOrder};

const CONTENT_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;

pub fn handle(record: &mut ConnectionRecord, payload: &[u8]) -> NetResult<Dispatch> {
    if payload.len() < 5 {
        return Err(NetError::Wait);
    }

    let content_type = payload[0];
    if content_type < 20 || content_type > 23 {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let version = BigEndian::read_u16(&payload[1..3]);
    let declared = BigEndian::read_u16(&payload[3..5]) as usize;
    let total = declared + 5;

    if payload.len() < total {
        return Err(NetError::Wait);
    }

    let handshake_type = match content_type == CONTENT_HANDSHAKE && declared > 0 {
        true => payload[5],
        _ => 0,
    };

    if let ProtocolData::Tls(data) = &mut record.protocol_data {
        data.content_type = content_type;
        data.version = version;
        data.handshake_type = handshake_type;
    }

    if content_type == CONTENT_HANDSHAKE && handshake_type == HANDSHAKE_CLIENT_HELLO {
        record.flags.set(SessionFlags::TLS_ESTABLISHED);
    }

    Ok(Dispatch::consume(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Protocol;
    use crate::proto::dispatch;
    use crate::proto::tests::record;

    fn client_hello() -> Vec<u8> {
        let mut packet = vec![0x16, 0x03, 0x01, 0x00, 0x2E, 0x01];
        packet.extend(vec![0u8; 0x2E - 1]);
        packet
    }

    #[test]
    fn test_client_hello_sets_established() {
        let (mut table, fd) = record(Protocol::Tls);
        let conn = table.get_mut(fd).unwrap();

        let packet = client_hello();
        let result = dispatch(conn, &packet).unwrap();

        assert_eq!(result.consumed, packet.len());
        assert!(conn.flags.contains(SessionFlags::TLS_ESTABLISHED));
        assert!(conn.write_buffer.is_empty());

        match &conn.protocol_data {
            ProtocolData::Tls(data) => {
                assert_eq!(data.content_type, 22);
                assert_eq!(data.version, 0x0301);
                assert_eq!(data.handshake_type, 1);
            }
            other => panic!("Unexpected protocol data {:?}", other),
        }
    }

    #[test]
    fn test_partial_record_waits() {
        let (mut table, fd) = record(Protocol::Tls);
        let conn = table.get_mut(fd).unwrap();

        let result = dispatch(conn, &[0x16, 0x03, 0x01, 0x00, 0x2E, 0x01]);

        assert_eq!(result.unwrap_err(), NetError::Wait);
    }

    #[test]
    fn test_application_data_passes_without_flag() {
        let (mut table, fd) = record(Protocol::Tls);
        let conn = table.get_mut(fd).unwrap();

        let packet = [0x17, 0x03, 0x03, 0x00, 0x02, 0xAA, 0xBB];
        dispatch(conn, &packet).unwrap();

        assert!(!conn.flags.contains(SessionFlags::TLS_ESTABLISHED));
    }

    #[test]
    fn test_bad_content_type_is_fatal() {
        let (mut table, fd) = record(Protocol::Tls);
        let conn = table.get_mut(fd).unwrap();

        let result = dispatch(conn, &[0x55, 0x03, 0x01, 0x00, 0x00]);

        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorKind::Malformed));
    }
}
