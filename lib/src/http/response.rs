//! Response model and serializer.
//!
//! A response head is serialized in one shot; the body is drained into the
//! session's write buffer according to its [`BodySource`]: in-memory bytes
//! are appended directly, files are streamed in bounded increments on
//! writable events, and CGI output is forwarded as it arrives, chunk-framed
//! when the script did not declare a Content-Length.

use std::fs::File;

use crate::http::request::Headers;

/// Statuses without a message body, where Content-Length is omitted.
fn bodyless(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 304)
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[derive(Debug)]
pub enum BodySource {
    None,
    Bytes(Vec<u8>),
    /// an opened file streamed to the client, `remaining` bytes to go
    File { file: File, remaining: u64 },
    /// body bytes arrive from a CGI pipe; when `chunked` the session frames
    /// them with the chunked transfer coding
    CgiStream { chunked: bool },
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: BodySource,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            reason: None,
            headers: Headers::new(),
            body: BodySource::None,
        }
    }

    pub fn with_body<B: Into<Vec<u8>>>(status: u16, content_type: &str, body: B) -> Response {
        let mut response = Response::new(status);
        response.headers.insert("Content-Type", content_type);
        response.body = BodySource::Bytes(body.into());
        response
    }

    pub fn with_file(status: u16, content_type: &str, file: File, length: u64) -> Response {
        let mut response = Response::new(status);
        response.headers.insert("Content-Type", content_type);
        response.body = BodySource::File {
            file,
            remaining: length,
        };
        response
    }

    /// Serialize the status line and header section.
    ///
    /// Framing headers are derived from the body source so that exactly one
    /// of Content-Length and `Transfer-Encoding: chunked` is emitted when a
    /// body is present; any framing header already stored is kept as is
    /// (the CGI path stores the script's own Content-Length).
    pub fn encode_head(&self, keep_alive: bool) -> Vec<u8> {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status));
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason).into_bytes();

        head.extend_from_slice(b"Server: kiln\r\n");
        for (name, value) in self.headers.iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        let framed = self.headers.contains("content-length")
            || self.headers.contains("transfer-encoding");
        if !framed {
            match &self.body {
                BodySource::None => {
                    if !bodyless(self.status) {
                        head.extend_from_slice(b"Content-Length: 0\r\n");
                    }
                }
                BodySource::Bytes(bytes) => {
                    head.extend_from_slice(format!("Content-Length: {}\r\n", bytes.len()).as_bytes());
                }
                BodySource::File { remaining, .. } => {
                    head.extend_from_slice(format!("Content-Length: {remaining}\r\n").as_bytes());
                }
                BodySource::CgiStream { chunked } => {
                    if *chunked {
                        head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                    }
                }
            }
        }

        if keep_alive {
            head.extend_from_slice(b"Connection: keep-alive\r\n");
        } else {
            head.extend_from_slice(b"Connection: close\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head
    }
}

/// Frame one chunk of a body of unknown length.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// The terminal chunk ending a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    fn head_string(response: &Response, keep_alive: bool) -> String {
        String::from_utf8(response.encode_head(keep_alive)).unwrap()
    }

    #[test]
    fn bytes_body_gets_content_length() {
        let response = Response::with_body(200, "text/plain", "hello");
        let head = head_string(&response, true);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn cgi_stream_without_length_is_chunked() {
        let mut response = Response::new(200);
        response.body = BodySource::CgiStream { chunked: true };
        let head = head_string(&response, false);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn stored_framing_header_is_not_duplicated() {
        let mut response = Response::new(200);
        response.headers.insert("Content-Length", "42");
        response.body = BodySource::CgiStream { chunked: false };
        let head = head_string(&response, true);
        assert_eq!(head.matches("Content-Length").count(), 1);
        assert!(!head.contains("Transfer-Encoding"));
    }

    #[test]
    fn empty_body_reports_zero_length_except_bodyless_statuses() {
        assert!(head_string(&Response::new(404), false).contains("Content-Length: 0\r\n"));
        assert!(!head_string(&Response::new(204), false).contains("Content-Length"));
    }

    #[test]
    fn chunk_framing() {
        let mut out = Vec::new();
        encode_chunk(b"Wikipedia", &mut out);
        assert_eq!(out, b"9\r\nWikipedia\r\n");

        let mut out = Vec::new();
        encode_chunk(b"", &mut out);
        assert!(out.is_empty());
        assert_eq!(LAST_CHUNK, b"0\r\n\r\n");
    }
}
