//! SSE (Server-Sent Events) formatting.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::event::StreamEvent;
use crate::error::EncodingError;

#[derive(Serialize)]
struct ContentPayload<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    error: &'a str,
}

/// Encode an event as one SSE frame.
///
/// `End` has no wire representation and yields `None`: completion is
/// signaled by closing the transport.
pub fn encode(event: &StreamEvent) -> Result<Option<Bytes>, EncodingError> {
    match event {
        StreamEvent::Token(token) => data_frame(&ContentPayload {
            content: token.as_str(),
        })
        .map(Some),
        StreamEvent::Error { message } => data_frame(&ErrorPayload { error: message }).map(Some),
        StreamEvent::End => Ok(None),
    }
}

/// `data: <json>\n\n`, with no other SSE fields.
fn data_frame<T: Serialize>(payload: &T) -> Result<Bytes, EncodingError> {
    let json = serde_json::to_vec(payload)?;
    let mut buf = BytesMut::with_capacity(json.len() + 8);
    buf.put_slice(b"data: ");
    buf.put_slice(&json);
    buf.put_slice(b"\n\n");
    Ok(buf.freeze())
}

/// HTTP headers for SSE response.
pub const SSE_HEADERS: &str = "\
HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Connection: close\r\n\
X-Accel-Buffering: no\r\n\
\r\n";

/// Format an HTTP error response for failures before the stream starts.
/// The reason is sanitized to prevent HTTP response splitting.
pub fn format_error_response(status: u16, reason: &str) -> String {
    let status_text = match status {
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Internal Server Error",
    };
    let safe_reason: String = reason.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let body = format!("{}: {}\n", status_text, safe_reason);
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body
    )
}
