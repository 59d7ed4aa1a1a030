//! CoAP (RFC 7252) request handling: piggybacked 2.05 ACKs for requests,
//! with enough option parsing to notice observe registrations.

use super::Dispatch;
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::session::{ConnectionRecord, ProtocolData, SessionFlags};
use byteorder::{BigEndian, ByteOrder};
use serde_json::json;

const ACK_CONTENT: [u8; 2] = [0x60, 0x45];
const PAYLOAD_MARKER: u8 = 0xFF;
const OPTION_OBSERVE: u32 = 6;

struct Message {
    mtype: u8,
    token_len: usize,
    code: u8,
    message_id: u16,
    observe: Option<u32>,
}

fn parse(payload: &[u8]) -> Option<Message> {
    if payload.len() < 4 {
        return None;
    }

    if payload[0] >> 6 != 1 {
        return None;
    }

    let token_len = (payload[0] & 0x0F) as usize;
    if token_len > 8 || payload.len() < 4 + token_len {
        return None;
    }

    Some(Message {
        mtype: (payload[0] >> 4) & 0x3,
        token_len,
        code: payload[1],
        message_id: BigEndian::read_u16(&payload[2..4]),
        observe: parse_observe(&payload[4 + token_len..]),
    })
}

/// Walk the option TLVs looking for an observe registration. Malformed
/// options simply end the walk.
fn parse_observe(mut options: &[u8]) -> Option<u32> {
    let mut number: u32 = 0;

    while let Some((&first, rest)) = options.split_first() {
        if first == PAYLOAD_MARKER {
            break;
        }

        let (delta, rest) = option_field(first >> 4, rest)?;
        let (length, rest) = option_field(first & 0x0F, rest)?;

        number += delta;
        let length = length as usize;

        if rest.len() < length {
            return None;
        }

        if number == OPTION_OBSERVE {
            let mut value: u32 = 0;
            for &byte in &rest[..length.min(3)] {
                value = (value << 8) | u32::from(byte);
            }
            return Some(value);
        }

        options = &rest[length..];
    }

    None
}

/// Decode one option nibble with its extended forms.
fn option_field(nibble: u8, rest: &[u8]) -> Option<(u32, &[u8])> {
    match nibble {
        0..=12 => Some((u32::from(nibble), rest)),
        13 => {
            let (&ext, rest) = rest.split_first()?;
            Some((u32::from(ext) + 13, rest))
        }
        14 => {
            if rest.len() < 2 {
                return None;
            }
            Some((u32::from(BigEndian::read_u16(&rest[..2])) + 269, &rest[2..]))
        }
        _ => None,
    }
}

fn build_ack(message: &Message) -> Vec<u8> {
    let body = json!({ "status": "ok", "observe": message.observe.is_some() }).to_string();

    let mut reply = Vec::with_capacity(5 + body.len());
    reply.extend_from_slice(&ACK_CONTENT);
    reply.push((message.message_id >> 8) as u8);
    reply.push((message.message_id & 0xFF) as u8);
    reply.push(PAYLOAD_MARKER);
    reply.extend_from_slice(body.as_bytes());

    reply
}

pub fn handle(record: &mut ConnectionRecord, payload: &[u8]) -> NetResult<Dispatch> {
    let message = match parse(payload) {
        Some(message) => message,
        _ => return Err(NetError::Fatal(ErrorKind::Malformed)),
    };

    // Requests carry code 0.01-0.31.
    if message.code >= 1 && message.code <= 31 {
        let reply = build_ack(&message);
        record
            .write_buffer
            .append(&reply)
            .map_err(|_| NetError::Wait)?;
    }

    if let ProtocolData::Coap(data) = &mut record.protocol_data {
        data.next_message_id = message.message_id.wrapping_add(1);
        data.token_len = message.token_len as u8;
        data.token[..message.token_len].copy_from_slice(&payload[4..4 + message.token_len]);

        if let Some(sequence) = message.observe {
            data.observe_seq = sequence;
        }
    }

    if message.observe.is_some() {
        record.flags.set(SessionFlags::OBSERVE_ACTIVE);
    }

    // CoAP is datagram shaped; one buffer fill carries one message.
    Ok(Dispatch::consume(payload.len()))
}

/// Stateless ACK synthesis for the UDP path.
pub fn udp_reply(payload: &[u8]) -> Option<Vec<u8>> {
    let message = parse(payload)?;

    // Only CON/NON requests are acknowledged.
    match message.mtype <= 1 && message.code >= 1 && message.code <= 31 {
        true => Some(build_ack(&message)),
        _ => None,
    }
}
