//! HTTP/1.1 response head and wire encoding.
//!
//! The response writer stages status and headers into a [`ResponseHead`];
//! [`encode`] serializes head plus accumulated body into the HTTP/1.1 wire
//! format for transmission over TCP.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// Status line and headers of an outgoing response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Headers,
}

impl ResponseHead {
    /// Creates a head with the given status and no headers.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
        }
    }
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Serializes a response into a `BytesMut` buffer using HTTP/1.1 wire format.
///
/// Automatically adds:
/// - `Content-Length: <n>` (always written, last before the blank line).
/// - `Connection: keep-alive` or `Connection: close`.
pub fn encode(head: &ResponseHead, body: &[u8], keep_alive: bool) -> BytesMut {
    let content_length = body.len();

    let estimated_size = 128 + head.headers.len() * 64 + content_length;
    let mut buf = BytesMut::with_capacity(estimated_size);

    // Status line
    buf.put(
        format!(
            "HTTP/1.1 {} {}\r\n",
            head.status.as_u16(),
            head.status.reason()
        )
        .as_bytes(),
    );

    // Headers, in insertion order with names verbatim
    for (name, value) in head.headers.iter() {
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }

    let connection = if keep_alive { "keep-alive" } else { "close" };
    buf.put(format!("Connection: {connection}\r\n").as_bytes());

    // Content-Length is always the last header before the blank line
    buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

    buf.put(&b"\r\n"[..]);

    if !body.is_empty() {
        buf.put(body);
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let head = ResponseHead::new(StatusCode::Ok);
        let s = to_string(encode(&head, b"Hello", true));
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn headers_emitted_verbatim() {
        let mut head = ResponseHead::new(StatusCode::Ok);
        head.headers.append("x-smoke-request-id", "abc-123");
        let s = to_string(encode(&head, b"ok", true));
        assert!(s.contains("x-smoke-request-id: abc-123\r\n"));
    }

    #[test]
    fn empty_body_still_has_length() {
        let head = ResponseHead::new(StatusCode::NoContent);
        let s = to_string(encode(&head, b"", true));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let head = ResponseHead::new(StatusCode::Ok);
        let s = to_string(encode(&head, b"", false));
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn custom_status_code() {
        let head = ResponseHead::new(StatusCode::from_u16(418));
        let s = to_string(encode(&head, b"", true));
        assert!(s.starts_with("HTTP/1.1 418 Unknown\r\n"));
    }
}
