//! Minimal HTTP/1.1 request handling: every request is answered with a
//! JSON echo of the request line plus the detection verdict, then the
//! connection is shut.

use super::Dispatch;
use crate::detect::validate::find_subsequence;
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::session::{ConnectionRecord, ProtocolData, SessionFlags};
use crate::time::timestamp_secs;
use serde_json::json;

struct Request {
    method: String,
    uri: String,
    version: String,
    host: String,
    content_length: usize,
    keepalive: bool,
    headers_len: usize,
}

fn parse(payload: &[u8]) -> NetResult<Request> {
    let headers_end = match find_subsequence(payload, b"\r\n\r\n") {
        Some(pos) => pos,
        // Headers still incomplete.
        _ => return Err(NetError::Wait),
    };

    let head = std::str::from_utf8(&payload[..headers_end])
        .map_err(|_| NetError::Fatal(ErrorKind::Malformed))?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");

    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("").to_string();
    let uri = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("").to_string();

    if method.is_empty() || uri.is_empty() || !version.starts_with("HTTP/") {
        return Err(NetError::Fatal(ErrorKind::Malformed));
    }

    let mut host = String::new();
    let mut content_length = 0;
    let mut keepalive = version == "HTTP/1.1";

    for line in lines {
        let (name, value) = match line.find(':') {
            Some(pos) => (&line[..pos], line[pos + 1..].trim()),
            _ => continue,
        };

        if name.eq_ignore_ascii_case("Host") {
            host = value.to_string();
        } else if name.eq_ignore_ascii_case("Content-Length") {
            content_length = value
                .parse()
                .map_err(|_| NetError::Fatal(ErrorKind::Malformed))?;
        } else if name.eq_ignore_ascii_case("Connection") {
            keepalive = value.eq_ignore_ascii_case("keep-alive");
        }
    }

    Ok(Request {
        method,
        uri,
        version,
        host,
        content_length,
        keepalive,
        headers_len: headers_end + 4,
    })
}

pub fn handle(record: &mut ConnectionRecord, payload: &[u8]) -> NetResult<Dispatch> {
    let request = parse(payload)?;

    let total = request.headers_len + request.content_length;
    if payload.len() < total {
        // The body has not fully arrived.
        return Err(NetError::Wait);
    }

    let body = json!({
        "method": request.method,
        "uri": request.uri,
        "detection_confidence": record.detection_confidence,
        "timestamp": timestamp_secs(),
    })
    .to_string();

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    record
        .write_buffer
        .append(response.as_bytes())
        .map_err(|_| NetError::Wait)?;

    if request.keepalive {
        record.flags.set(SessionFlags::HTTP_KEEPALIVE);
    }

    if let ProtocolData::Http(data) = &mut record.protocol_data {
        data.method = request.method;
        data.uri = request.uri;
        data.version = request.version;
        data.host = request.host;
        data.content_length = request.content_length;
        data.close = true;
    }

    // One response per connection; close once it drains.
    Ok(Dispatch::consume(total).and_close())
}
