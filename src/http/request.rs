//! HTTP/1.1 request head parsing using the [`httparse`] crate.

use thiserror::Error;

use super::{Body, Headers, Method, Version};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request head is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request head exceeds maximum allowed size of {max_bytes} bytes")]
    HeadTooLarge { max_bytes: usize },
}

/// The head of an HTTP/1.1 request: method, version, URI, headers.
///
/// The URI keeps the raw `path?query` form as received; the request handler
/// splits it at the first `?`. Header names are preserved verbatim.
///
/// # Examples
///
/// ```
/// use opserve::http::RequestHead;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (head, offset) = RequestHead::parse(raw).unwrap();
///
/// assert_eq!(head.method.as_str(), "GET");
/// assert_eq!(head.uri, "/hello?name=world");
/// assert_eq!(head.headers.get("host"), Some("localhost"));
/// assert_eq!(offset, raw.len());
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub version: Version,
    pub uri: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Maximum number of headers supported per request.
    const MAX_HEADERS: usize = 64;

    /// Parses a raw HTTP/1.1 request head from a byte slice.
    ///
    /// Returns the parsed head and the byte offset at which the body begins
    /// in `buf` (immediately after the `\r\n\r\n` terminator).
    ///
    /// # Errors
    ///
    /// - [`HeadError::Incomplete`] — more data is needed to complete the head.
    /// - [`HeadError::Parse`] — the data is malformed.
    /// - [`HeadError::MissingField`] — method, path, or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(HeadError::Incomplete),
        };

        let method: Method = raw
            .method
            .ok_or(HeadError::MissingField { field: "method" })?
            .parse()
            .unwrap(); // Infallible

        let uri = raw
            .path
            .ok_or(HeadError::MissingField { field: "path" })?
            .to_owned();

        let version = Version::from_minor(
            raw.version
                .ok_or(HeadError::MissingField { field: "version" })?,
        );

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        Ok((
            Self {
                method,
                version,
                uri,
                headers: header_map,
            },
            body_offset,
        ))
    }

    /// Splits the URI at the first `?` into `(path, query-string)`.
    pub fn split_uri(&self) -> (&str, Option<&str>) {
        match self.uri.find('?') {
            Some(pos) => (&self.uri[..pos], Some(&self.uri[pos + 1..])),
            None => (self.uri.as_str(), None),
        }
    }

    /// Returns the value of the `Content-Length` header parsed as `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == Version::Http11,
        }
    }
}

/// A complete request: parsed head plus lazy body.
#[derive(Debug)]
pub struct Request {
    pub head: RequestHead,
    pub body: Body,
}

impl Request {
    /// Pairs a parsed head with its body stream.
    pub fn new(head: RequestHead, body: Body) -> Self {
        Self { head, body }
    }

    /// Splits the request into head and body.
    pub fn into_parts(self) -> (RequestHead, Body) {
        (self.head, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, offset) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.uri, "/");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.headers.get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn uri_keeps_query_until_split() {
        let raw = b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: x\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.uri, "/search?q=rust&page=2");
        let (path, query) = head.split_uri();
        assert_eq!(path, "/search");
        assert_eq!(query, Some("q=rust&page=2"));
    }

    #[test]
    fn split_uri_without_query() {
        let raw = b"GET /plain HTTP/1.1\r\nHost: x\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.split_uri(), ("/plain", None));
    }

    #[test]
    fn incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(
            RequestHead::parse(raw),
            Err(HeadError::Incomplete)
        ));
    }

    #[test]
    fn keep_alive_defaults() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert!(head.is_keep_alive());

        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert!(!head.is_keep_alive());

        let raw = b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert!(!head.is_keep_alive());
    }

    #[test]
    fn content_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let (head, body_offset) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.content_length(), Some(5));
        assert_eq!(&raw[body_offset..], b"hello");
    }
}
