//! QUIC long-header inspection: version and connection id are recorded,
//! nothing is answered.

use super::Dispatch;
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::session::{ConnectionRecord, ProtocolData};
use byteorder::{BigEndian, ByteOrder};

pub fn handle(record: &mut ConnectionRecord, payload: &[u8]) -> NetResult<Dispatch> {
    if payload.len() < 6 {
        return Err(NetError::Wait);
    }

    if payload[0] & 0x80 == 0 {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let version = BigEndian::read_u32(&payload[1..5]);
    let packet_type = (payload[0] >> 4) & 0x3;

    // Destination connection id: length byte, then up to eight id bytes
    // folded into the stored handle.
    let dcid_len = payload[5] as usize;
    let dcid = payload.get(6..6 + dcid_len).unwrap_or(&[]);

    let mut connection_id: u64 = 0;
    for &byte in dcid.iter().take(8) {
        connection_id = (connection_id << 8) | u64::from(byte);
    }

    if let ProtocolData::Quic(data) = &mut record.protocol_data {
        data.version = version;
        data.packet_type = packet_type;
        data.connection_id = connection_id;
    }

    // Everything buffered belongs to this datagram.
    Ok(Dispatch::consume(payload.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Protocol;
    use crate::proto::dispatch;
    use crate::proto::tests::record;

    #[test]
    fn test_long_header_recorded() {
        let (mut table, fd) = record(Protocol::Quic);
        let conn = table.get_mut(fd).unwrap();

        // Initial packet, version 1, 8 byte dcid.
        let packet = [
            0xC3, 0x00, 0x00, 0x00, 0x01, 0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];

        let result = dispatch(conn, &packet).unwrap();

        assert_eq!(result.consumed, packet.len());
        assert!(conn.write_buffer.is_empty());

        match &conn.protocol_data {
            ProtocolData::Quic(data) => {
                assert_eq!(data.version, 1);
                assert_eq!(data.packet_type, 0);
                assert_eq!(data.connection_id, 0x0102_0304_0506_0708);
            }
            other => panic!("Unexpected protocol data {:?}", other),
        }
    }

    #[test]
    fn test_short_header_is_fatal() {
        let (mut table, fd) = record(Protocol::Quic);
        let conn = table.get_mut(fd).unwrap();

        let result = dispatch(conn, &[0x43, 0x00, 0x00, 0x00, 0x01, 0x00]);

        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorKind::Malformed));
    }
}
