//! DNS (RFC 1035) query handling: the question is echoed back with a
//! single static A record answer.

use super::Dispatch;
use crate::detect::validate::dns_strip_tcp_prefix;
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::session::{ConnectionRecord, ProtocolData, SessionFlags};
use byteorder::{BigEndian, ByteOrder};

const ANSWER_TTL: u32 = 300;
const ANSWER_ADDR: [u8; 4] = [127, 0, 0, 1];
const FLAG_RD: u16 = 0x0100;

struct Query {
    txn_id: u16,
    flags: u16,
    name: String,
    qtype: u16,
    /// Length of the header plus question section.
    question_end: usize,
}

fn parse(message: &[u8]) -> Option<Query> {
    if message.len() < 12 {
        return None;
    }

    let txn_id = BigEndian::read_u16(&message[..2]);
    let flags = BigEndian::read_u16(&message[2..4]);
    let qdcount = BigEndian::read_u16(&message[4..6]);

    if qdcount == 0 {
        return None;
    }

    // Walk the first QNAME.
    let mut pos = 12;
    let mut name = String::new();

    loop {
        let len = *message.get(pos)? as usize;
        pos += 1;

        if len == 0 {
            break;
        }

        if len > 63 {
            return None;
        }

        let label = message.get(pos..pos + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos += len;
    }

    let qtype = BigEndian::read_u16(message.get(pos..pos + 2)?);
    let question_end = pos + 4;

    if message.len() < question_end {
        return None;
    }

    Some(Query {
        txn_id,
        flags,
        name,
        qtype,
        question_end,
    })
}

/// Build the response: the original question echoed, one A record.
fn build_response(message: &[u8], query: &Query) -> Vec<u8> {
    let question = &message[12..query.question_end];
    let mut reply = Vec::with_capacity(query.question_end + 16);

    reply.push((query.txn_id >> 8) as u8);
    reply.push((query.txn_id & 0xFF) as u8);
    // Standard response, recursion desired + available, no error.
    reply.extend_from_slice(&[0x81, 0x80]);
    // qd=1 an=1 ns=0 ar=0
    reply.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    reply.extend_from_slice(question);

    // Answer: pointer to the question name.
    reply.extend_from_slice(&[0xC0, 0x0C]);
    // TYPE A, CLASS IN.
    reply.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    reply.extend_from_slice(&ANSWER_TTL.to_be_bytes());
    reply.extend_from_slice(&[0x00, 0x04]);
    reply.extend_from_slice(&ANSWER_ADDR);

    reply
}

pub fn handle(record: &mut ConnectionRecord, payload: &[u8]) -> NetResult<Dispatch> {
    // DNS over TCP prefixes each message with its length.
    let (message, prefixed) = match dns_strip_tcp_prefix(payload, true) {
        Some(message) => (message, true),
        _ => (payload, false),
    };

    let query = match parse(message) {
        Some(query) => query,
        _ => {
            // A declared length beyond the buffered bytes means the
            // prefixed message is still in flight.
            if !prefixed && payload.len() >= 2 {
                let declared = BigEndian::read_u16(&payload[..2]) as usize;
                // A message that cannot fit the read buffer will never
                // complete, so only plausible lengths wait.
                if declared >= 12
                    && declared > payload.len() - 2
                    && declared + 2 <= crate::net::buffer::BUFFER_SIZE
                {
                    return Err(NetError::Wait);
                }
            }
            return Err(NetError::Fatal(ErrorKind::Malformed));
        }
    };

    let response = build_response(message, &query);

    if prefixed {
        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        record
            .write_buffer
            .append(&framed)
            .map_err(|_| NetError::Wait)?;
    } else {
        record
            .write_buffer
            .append(&response)
            .map_err(|_| NetError::Wait)?;
    }

    if let ProtocolData::Dns(data) = &mut record.protocol_data {
        data.txn_id = query.txn_id;
        data.flags = query.flags;
        data.query_name = query.name;
        data.query_type = query.qtype;
    }

    if query.flags & FLAG_RD != 0 {
        record.flags.set(SessionFlags::DNS_RECURSIVE);
    }

    let consumed = match prefixed {
        true => message.len() + 2,
        _ => payload.len(),
    };

    Ok(Dispatch::consume(consumed))
}

/// Stateless response synthesis for the UDP path.
pub fn udp_reply(payload: &[u8]) -> Option<Vec<u8>> {
    let query = parse(payload)?;

    // Only questions are answered.
    match query.flags >> 15 {
        0 => Some(build_response(payload, &query)),
        _ => None,
    }
}
