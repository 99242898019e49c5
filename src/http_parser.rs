//! A minimal HTTP/1.1 response parser for bytes arriving over a
//! multiplexed stream ([`crate::stream_mux`]).
//!
//! This is not a general-purpose HTTP client: it exists to let a host
//! tunnel a single request/response through an opened `MuxStream`
//! without depending on a full HTTP stack. Request serialization is
//! equally minimal — headers and a body, nothing about connection
//! pooling or redirects.

use std::collections::HashMap;

use crate::error::TransportError;

/// How the response body is framed, determined from response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    /// `Content-Length` header present; read exactly that many bytes.
    ContentLength(usize),
    /// `Transfer-Encoding: chunked`; read chunk-size-prefixed segments
    /// until a zero-size chunk.
    Chunked,
    /// Neither header present; the body runs until the stream closes.
    UntilClose,
    /// No body at all (e.g. `204 No Content`, `HEAD` response).
    Empty,
}

/// A parsed HTTP/1.1 response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code (e.g. `200`).
    pub status: u16,
    /// Reason phrase (e.g. `"OK"`).
    pub reason: String,
    /// Headers in wire order, names as received (not lower-cased).
    pub headers: Vec<(String, String)>,
    /// Fully assembled body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the hub declared the connection should close after this
    /// response (`Connection: close`, or an HTTP/1.0 response without a
    /// `Connection: keep-alive`).
    #[must_use]
    pub fn should_close_connection(&self, http_version_1_0: bool) -> bool {
        match self.header("connection") {
            Some(value) => value.eq_ignore_ascii_case("close"),
            None => http_version_1_0,
        }
    }
}

/// Incrementally feeds bytes from a `MuxStream` and yields a complete
/// [`HttpResponse`] once the framing strategy says the body is done.
pub struct HttpResponseParser {
    buffer: Vec<u8>,
    headers_done: bool,
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    http_version_1_0: bool,
    framing: Option<BodyFraming>,
    body: Vec<u8>,
    chunk_remaining: usize,
}

impl Default for HttpResponseParser {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            headers_done: false,
            status: 0,
            reason: String::new(),
            headers: Vec::new(),
            http_version_1_0: false,
            framing: None,
            body: Vec::new(),
            chunk_remaining: 0,
        }
    }
}

impl HttpResponseParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes read from the stream. Returns `Some` once
    /// the full response (headers and body) has been parsed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownContentType` if the status line or
    /// a chunk-size line is malformed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<HttpResponse>, TransportError> {
        self.buffer.extend_from_slice(bytes);

        if !self.headers_done {
            if !self.try_parse_headers()? {
                return Ok(None);
            }
        }

        self.drain_body()
    }

    /// Signal that the underlying stream closed. Only meaningful for
    /// `UntilClose` framing, where end-of-stream is how the body ends.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownContentType` if headers were never
    /// completed before the stream closed.
    pub fn finish(mut self) -> Result<HttpResponse, TransportError> {
        if !self.headers_done {
            return Err(TransportError::UnknownContentType(0));
        }
        if matches!(self.framing, Some(BodyFraming::UntilClose) | None) {
            self.body.extend_from_slice(&self.buffer);
            self.buffer.clear();
        }
        Ok(HttpResponse {
            status: self.status,
            reason: self.reason,
            headers: self.headers,
            body: self.body,
        })
    }

    fn try_parse_headers(&mut self) -> Result<bool, TransportError> {
        let Some(header_end) = find_double_crlf(&self.buffer) else {
            return Ok(false);
        };

        let header_bytes = self.buffer[..header_end].to_vec();
        self.buffer.drain(..header_end + 4);

        let text = String::from_utf8_lossy(&header_bytes);
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(TransportError::UnknownContentType(0))?;
        let reason = parts.next().unwrap_or_default().to_string();

        self.http_version_1_0 = version.ends_with("1.0");
        self.status = status;
        self.reason = reason;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        self.headers = headers;
        self.headers_done = true;
        self.framing = Some(self.determine_framing());
        Ok(true)
    }

    fn determine_framing(&self) -> BodyFraming {
        if matches!(self.status, 204 | 304) {
            return BodyFraming::Empty;
        }

        let headers: HashMap<String, String> = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();

        if headers
            .get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return BodyFraming::Chunked;
        }

        if let Some(length) = headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            return BodyFraming::ContentLength(length);
        }

        BodyFraming::UntilClose
    }

    fn drain_body(&mut self) -> Result<Option<HttpResponse>, TransportError> {
        match self.framing {
            Some(BodyFraming::Empty) => Ok(Some(self.finish_ready())),
            Some(BodyFraming::ContentLength(total)) => {
                if self.body.len() + self.buffer.len() >= total {
                    let needed = total - self.body.len();
                    self.body.extend_from_slice(&self.buffer[..needed]);
                    self.buffer.drain(..needed);
                    Ok(Some(self.finish_ready()))
                } else {
                    self.body.append(&mut self.buffer);
                    Ok(None)
                }
            }
            Some(BodyFraming::Chunked) => self.drain_chunked(),
            Some(BodyFraming::UntilClose) | None => Ok(None),
        }
    }

    fn drain_chunked(&mut self) -> Result<Option<HttpResponse>, TransportError> {
        loop {
            if self.chunk_remaining > 0 {
                let take = self.chunk_remaining.min(self.buffer.len());
                self.body.extend_from_slice(&self.buffer[..take]);
                self.buffer.drain(..take);
                self.chunk_remaining -= take;
                if self.chunk_remaining > 0 {
                    return Ok(None);
                }
                // Trailing CRLF after the chunk data.
                if self.buffer.len() < 2 {
                    return Ok(None);
                }
                self.buffer.drain(..2);
                continue;
            }

            let Some(line_end) = find_crlf(&self.buffer) else {
                return Ok(None);
            };
            let size_line = String::from_utf8_lossy(&self.buffer[..line_end]).to_string();
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16).map_err(|_| TransportError::UnknownContentType(0))?;
            self.buffer.drain(..line_end + 2);

            if size == 0 {
                // Trailing headers (if any) end with an empty line; we
                // don't surface trailers, just consume up through them.
                if let Some(end) = find_double_crlf(&self.buffer) {
                    self.buffer.drain(..end + 4);
                } else if let Some(end) = find_crlf(&self.buffer) {
                    self.buffer.drain(..end + 2);
                }
                return Ok(Some(self.finish_ready()));
            }

            self.chunk_remaining = size;
        }
    }

    fn finish_ready(&mut self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            reason: std::mem::take(&mut self.reason),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Serialize an outbound HTTP/1.1 request.
#[must_use]
pub fn encode_request(method: &str, path: &str, host: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n").into_bytes();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_length_response_in_one_feed() {
        let mut parser = HttpResponseParser::new();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let response = parser.feed(raw).unwrap().expect("complete in one shot");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn parses_content_length_response_split_across_feeds() {
        let mut parser = HttpResponseParser::new();
        assert!(parser.feed(b"HTTP/1.1 200 OK\r\nContent-Len").unwrap().is_none());
        assert!(parser.feed(b"gth: 5\r\n\r\nhel").unwrap().is_none());
        let response = parser.feed(b"lo").unwrap().expect("complete now");
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn parses_chunked_response() {
        let mut parser = HttpResponseParser::new();
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let response = parser.feed(raw).unwrap().expect("complete");
        assert_eq!(response.body, b"hello world");
    }

    #[test]
    fn until_close_framing_completes_on_finish() {
        let mut parser = HttpResponseParser::new();
        assert!(parser
            .feed(b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\nbody without length")
            .unwrap()
            .is_none());
        let response = parser.finish().expect("finishes");
        assert_eq!(response.body, b"body without length");
        assert!(response.should_close_connection(true));
    }

    #[test]
    fn no_content_response_has_empty_body() {
        let mut parser = HttpResponseParser::new();
        let response = parser.feed(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap().expect("complete");
        assert!(response.body.is_empty());
    }

    #[test]
    fn encodes_request_with_content_length() {
        let bytes = encode_request("POST", "/api", "hub.local", &[], b"{}");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /api HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("{}"));
    }

    #[test]
    fn caller_supplied_host_and_connection_headers_are_stripped() {
        let headers = vec![
            ("Host".to_string(), "evil.example".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("X-Custom".to_string(), "yes".to_string()),
        ];
        let bytes = encode_request("GET", "/", "hub.local", &headers, b"");
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.matches("Host:").count(), 1);
        assert_eq!(text.matches("Connection:").count(), 1);
        assert!(text.contains("Host: hub.local\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("X-Custom: yes\r\n"));
    }
}
