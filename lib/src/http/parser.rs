//! Resumable HTTP/1.1 request parser.
//!
//! The parser consumes bytes from the front of the connection's read buffer
//! and never assumes a full message arrives in one read: every state returns
//! [`ParseStatus::Incomplete`] when it runs out of bytes and picks up where
//! it left off on the next call. Bytes belonging to a subsequent pipelined
//! request are left untouched in the buffer and seed the next parse cycle.

use memchr::memmem;

use crate::http::request::{Headers, Method, Request, Version};

/// Upper bound on the start line plus the header section.
pub const MAX_HEADER_BYTES: usize = 32 * 1024;
/// Upper bound on a single chunk-size line, extensions included.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed start line")]
    MalformedStartLine,
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
    #[error("malformed header line")]
    MalformedHeader,
    #[error("missing Host header on an HTTP/1.1 request")]
    MissingHost,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("both Content-Length and Transfer-Encoding present")]
    ConflictingFraming,
    #[error("unsupported transfer coding {0}")]
    UnsupportedTransferCoding(String),
    #[error("header section exceeds {0} bytes")]
    HeadersTooLarge(usize),
    #[error("request body exceeds the configured limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("malformed chunk size line")]
    MalformedChunkSize,
    #[error("chunk data not terminated by CRLF")]
    MalformedChunk,
}

impl ParseError {
    /// The status code of the synthesized answer for this error.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::UnsupportedMethod(_) => 501,
            ParseError::BodyTooLarge { .. } => 413,
            _ => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    StartLine,
    Headers,
    FixedBody { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkDataEnd,
    Trailers,
    Complete,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// more bytes are needed, every consumed byte has been recorded
    Incomplete,
    /// a full request was parsed, unconsumed bytes remain in the buffer
    Complete(Request),
}

pub struct RequestParser {
    state: ParseState,
    body_limit: usize,
    consumed: usize,
    header_bytes: usize,
    expects_continue: bool,

    method: Option<Method>,
    path: String,
    query: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Vec<u8>,
}

impl RequestParser {
    pub fn new(body_limit: usize) -> RequestParser {
        RequestParser {
            state: ParseState::StartLine,
            body_limit,
            consumed: 0,
            header_bytes: 0,
            expects_continue: false,
            method: None,
            path: String::new(),
            query: None,
            version: None,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// true while no byte of a request has been consumed yet
    pub fn is_initial(&self) -> bool {
        self.state == ParseState::StartLine && self.consumed == 0
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// true once the header section is parsed, whether or not a body follows
    pub fn headers_complete(&self) -> bool {
        !matches!(self.state, ParseState::StartLine | ParseState::Headers)
    }

    /// the client sent `Expect: 100-continue` and a body is pending
    pub fn expects_continue(&self) -> bool {
        self.expects_continue
    }

    /// Advance the state machine over `buffer`, consuming parsed bytes from
    /// its front. Errors are terminal for this parser instance.
    pub fn parse(&mut self, buffer: &mut Vec<u8>) -> Result<ParseStatus, ParseError> {
        loop {
            match self.state {
                ParseState::StartLine => match self.parse_start_line(buffer)? {
                    true => {}
                    false => return Ok(ParseStatus::Incomplete),
                },
                ParseState::Headers => match self.parse_header_line(buffer)? {
                    true => {}
                    false => return Ok(ParseStatus::Incomplete),
                },
                ParseState::FixedBody { remaining } => {
                    let take = remaining.min(buffer.len());
                    self.body.extend(buffer.drain(..take));
                    self.consumed += take;
                    if take == remaining {
                        self.state = ParseState::Complete;
                    } else {
                        self.state = ParseState::FixedBody {
                            remaining: remaining - take,
                        };
                        return Ok(ParseStatus::Incomplete);
                    }
                }
                ParseState::ChunkSize => match self.parse_chunk_size(buffer)? {
                    true => {}
                    false => return Ok(ParseStatus::Incomplete),
                },
                ParseState::ChunkData { remaining } => {
                    let take = remaining.min(buffer.len());
                    self.body.extend(buffer.drain(..take));
                    self.consumed += take;
                    if take == remaining {
                        self.state = ParseState::ChunkDataEnd;
                    } else {
                        self.state = ParseState::ChunkData {
                            remaining: remaining - take,
                        };
                        return Ok(ParseStatus::Incomplete);
                    }
                }
                ParseState::ChunkDataEnd => {
                    if buffer.len() < 2 {
                        return Ok(ParseStatus::Incomplete);
                    }
                    if &buffer[..2] != b"\r\n" {
                        return Err(ParseError::MalformedChunk);
                    }
                    buffer.drain(..2);
                    self.consumed += 2;
                    self.state = ParseState::ChunkSize;
                }
                ParseState::Trailers => match take_line(buffer) {
                    Some(line) => {
                        self.consumed += line.len() + 2;
                        if line.is_empty() {
                            self.state = ParseState::Complete;
                        }
                        // trailer fields are tolerated and discarded
                    }
                    None => {
                        if buffer.len() > MAX_HEADER_BYTES {
                            return Err(ParseError::HeadersTooLarge(MAX_HEADER_BYTES));
                        }
                        return Ok(ParseStatus::Incomplete);
                    }
                },
                ParseState::Complete => {
                    self.expects_continue = false;
                    let request = Request {
                        method: self.method.take().ok_or(ParseError::MalformedStartLine)?,
                        path: std::mem::take(&mut self.path),
                        query: self.query.take(),
                        version: self.version.take().ok_or(ParseError::MalformedStartLine)?,
                        headers: std::mem::take(&mut self.headers),
                        body: std::mem::take(&mut self.body),
                    };
                    return Ok(ParseStatus::Complete(request));
                }
            }
        }
    }

    fn parse_start_line(&mut self, buffer: &mut Vec<u8>) -> Result<bool, ParseError> {
        let line = match take_line(buffer) {
            Some(line) => line,
            None => {
                if buffer.len() > MAX_HEADER_BYTES {
                    return Err(ParseError::HeadersTooLarge(MAX_HEADER_BYTES));
                }
                return Ok(false);
            }
        };
        self.consumed += line.len() + 2;

        // tolerate empty lines before the start line
        if line.is_empty() {
            return Ok(true);
        }

        let mut parts = line.split(|byte| *byte == b' ').filter(|part| !part.is_empty());
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(method), Some(target), Some(version), None) => (method, target, version),
            _ => return Err(ParseError::MalformedStartLine),
        };

        self.method = Some(Method::from_bytes(method).ok_or_else(|| {
            ParseError::UnsupportedMethod(String::from_utf8_lossy(method).into_owned())
        })?);
        self.version = Some(Version::from_bytes(version).ok_or_else(|| {
            ParseError::UnsupportedVersion(String::from_utf8_lossy(version).into_owned())
        })?);

        let target = std::str::from_utf8(target).map_err(|_| ParseError::MalformedStartLine)?;
        if !target.starts_with('/') {
            return Err(ParseError::MalformedStartLine);
        }
        match target.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = Some(query.to_string());
            }
            None => self.path = target.to_string(),
        }

        self.header_bytes = line.len();
        self.state = ParseState::Headers;
        Ok(true)
    }

    fn parse_header_line(&mut self, buffer: &mut Vec<u8>) -> Result<bool, ParseError> {
        let line = match take_line(buffer) {
            Some(line) => line,
            None => {
                if buffer.len() + self.header_bytes > MAX_HEADER_BYTES {
                    return Err(ParseError::HeadersTooLarge(MAX_HEADER_BYTES));
                }
                return Ok(false);
            }
        };
        self.consumed += line.len() + 2;
        self.header_bytes += line.len() + 2;
        if self.header_bytes > MAX_HEADER_BYTES {
            return Err(ParseError::HeadersTooLarge(MAX_HEADER_BYTES));
        }

        if line.is_empty() {
            self.finish_headers()?;
            return Ok(true);
        }

        let line = std::str::from_utf8(&line).map_err(|_| ParseError::MalformedHeader)?;
        let (name, value) = line.split_once(':').ok_or(ParseError::MalformedHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::MalformedHeader);
        }
        self.headers.insert(name, value.trim());
        Ok(true)
    }

    /// Decide the body framing once the blank line after the headers is
    /// reached, per the Content-Length / Transfer-Encoding exclusivity rule.
    fn finish_headers(&mut self) -> Result<(), ParseError> {
        if self.version == Some(Version::V11) && !self.headers.contains("host") {
            return Err(ParseError::MissingHost);
        }

        let content_length = self.headers.get("content-length");
        let transfer_encoding = self.headers.get("transfer-encoding");

        match (content_length, transfer_encoding) {
            (Some(_), Some(_)) => return Err(ParseError::ConflictingFraming),
            (None, Some(coding)) => {
                if !coding.trim().eq_ignore_ascii_case("chunked") {
                    return Err(ParseError::UnsupportedTransferCoding(coding.to_string()));
                }
                self.state = ParseState::ChunkSize;
            }
            (Some(value), None) => {
                let length: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
                if length > self.body_limit {
                    return Err(ParseError::BodyTooLarge {
                        limit: self.body_limit,
                    });
                }
                if length == 0 {
                    self.state = ParseState::Complete;
                } else {
                    self.state = ParseState::FixedBody { remaining: length };
                }
            }
            (None, None) => self.state = ParseState::Complete,
        }

        if self.state != ParseState::Complete {
            self.expects_continue = matches!(
                self.headers.get("expect"),
                Some(value) if value.eq_ignore_ascii_case("100-continue")
            );
        }
        Ok(())
    }

    fn parse_chunk_size(&mut self, buffer: &mut Vec<u8>) -> Result<bool, ParseError> {
        let line = match take_line(buffer) {
            Some(line) => line,
            None => {
                if buffer.len() > MAX_CHUNK_SIZE_LINE {
                    return Err(ParseError::MalformedChunkSize);
                }
                return Ok(false);
            }
        };
        self.consumed += line.len() + 2;

        let line = std::str::from_utf8(&line).map_err(|_| ParseError::MalformedChunkSize)?;
        // chunk extensions after ';' are tolerated and ignored
        let size_token = line.split(';').next().unwrap_or("").trim();
        if size_token.is_empty() {
            return Err(ParseError::MalformedChunkSize);
        }
        let size =
            usize::from_str_radix(size_token, 16).map_err(|_| ParseError::MalformedChunkSize)?;

        if size == 0 {
            self.state = ParseState::Trailers;
        } else {
            if self.body.len() + size > self.body_limit {
                return Err(ParseError::BodyTooLarge {
                    limit: self.body_limit,
                });
            }
            self.state = ParseState::ChunkData { remaining: size };
        }
        Ok(true)
    }
}

/// Remove and return the next CRLF-terminated line, without its CRLF.
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = memmem::find(buffer, b"\r\n")?;
    let line = buffer[..end].to_vec();
    buffer.drain(..end + 2);
    Some(line)
}

#[cfg(test)]
mod tests {
    use quickcheck::{quickcheck, TestResult};

    use super::*;

    const LIMIT: usize = 1024;

    fn parse_all(raw: &[u8]) -> Result<(Request, Vec<u8>), ParseError> {
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = raw.to_vec();
        match parser.parse(&mut buffer)? {
            ParseStatus::Complete(request) => Ok((request, buffer)),
            ParseStatus::Incomplete => panic!("request should be complete"),
        }
    }

    #[test]
    fn simple_get() {
        let (request, rest) = parse_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/a");
        assert_eq!(request.query, None);
        assert_eq!(request.version, Version::V11);
        assert_eq!(request.headers.get("host"), Some("x"));
        assert!(request.body.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn query_component_is_split_off() {
        let (request, _) = parse_all(b"GET /search?q=kiln&page=2 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(request.path, "/search");
        assert_eq!(request.query.as_deref(), Some("q=kiln&page=2"));
    }

    #[test]
    fn fixed_length_body() {
        let (request, rest) =
            parse_all(b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(request.body, b"hello");
        assert!(rest.is_empty());
    }

    #[test]
    fn incremental_feeding_resumes() {
        let raw = b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = Vec::new();
        for chunk in raw.chunks(3) {
            buffer.extend_from_slice(chunk);
            match parser.parse(&mut buffer).unwrap() {
                ParseStatus::Incomplete => {}
                ParseStatus::Complete(request) => {
                    assert_eq!(request.body, b"hello");
                    return;
                }
            }
        }
        panic!("parser never completed");
    }

    #[test]
    fn pipelined_remainder_is_preserved() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let (first, rest) = parse_all(raw).unwrap();
        assert_eq!(first.path, "/a");

        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = rest;
        match parser.parse(&mut buffer).unwrap() {
            ParseStatus::Complete(second) => {
                assert_eq!(second.path, "/b");
                assert!(buffer.is_empty());
            }
            ParseStatus::Incomplete => panic!("second pipelined request lost"),
        }
    }

    #[test]
    fn chunked_body_is_decoded() {
        let raw = b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (request, rest) = parse_all(raw).unwrap();
        assert_eq!(request.body, b"Wikipedia");
        assert!(rest.is_empty());
    }

    #[test]
    fn chunked_with_extension_and_trailers() {
        let raw = b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5;ext=1\r\nhello\r\n0\r\nX-Checksum: abc\r\n\r\n";
        let (request, _) = parse_all(raw).unwrap();
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn malformed_chunk_size_is_rejected() {
        let raw = b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = raw.to_vec();
        let error = parser.parse(&mut buffer).unwrap_err();
        assert_eq!(error, ParseError::MalformedChunkSize);
        assert_eq!(error.status(), 400);
    }

    #[test]
    fn chunk_data_must_end_with_crlf() {
        let raw = b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5\r\nhelloXX";
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = raw.to_vec();
        assert_eq!(
            parser.parse(&mut buffer).unwrap_err(),
            ParseError::MalformedChunk
        );
    }

    #[test]
    fn missing_host_on_http11() {
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        assert_eq!(parser.parse(&mut buffer).unwrap_err(), ParseError::MissingHost);
    }

    #[test]
    fn http10_does_not_require_host() {
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = b"GET / HTTP/1.0\r\n\r\n".to_vec();
        assert!(matches!(
            parser.parse(&mut buffer).unwrap(),
            ParseStatus::Complete(_)
        ));
    }

    #[test]
    fn unsupported_method_is_501() {
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = b"BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let error = parser.parse(&mut buffer).unwrap_err();
        assert_eq!(error.status(), 501);
    }

    #[test]
    fn malformed_start_line_is_400() {
        for raw in [
            &b"GET/HTTP/1.1\r\nHost: x\r\n\r\n"[..],
            &b"GET / HTTP/1.1 extra\r\nHost: x\r\n\r\n"[..],
            &b"GET relative HTTP/1.1\r\nHost: x\r\n\r\n"[..],
        ] {
            let mut parser = RequestParser::new(LIMIT);
            let mut buffer = raw.to_vec();
            let error = parser.parse(&mut buffer).unwrap_err();
            assert_eq!(error.status(), 400, "{:?}", String::from_utf8_lossy(raw));
        }
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\
                    Transfer-Encoding: chunked\r\n\r\n";
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = raw.to_vec();
        assert_eq!(
            parser.parse(&mut buffer).unwrap_err(),
            ParseError::ConflictingFraming
        );
    }

    #[test]
    fn body_limit_boundary() {
        // exactly at the limit: accepted
        let mut raw = format!("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {LIMIT}\r\n\r\n")
            .into_bytes();
        raw.extend(std::iter::repeat(b'a').take(LIMIT));
        let (request, _) = parse_all(&raw).unwrap();
        assert_eq!(request.body.len(), LIMIT);

        // one past the limit: rejected before the body arrives
        let over = LIMIT + 1;
        let raw = format!("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {over}\r\n\r\n");
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = raw.into_bytes();
        let error = parser.parse(&mut buffer).unwrap_err();
        assert_eq!(error, ParseError::BodyTooLarge { limit: LIMIT });
        assert_eq!(error.status(), 413);
    }

    #[test]
    fn chunked_body_limit() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n500\r\n";
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = raw.to_vec();
        buffer.extend(std::iter::repeat(b'a').take(0x500));
        buffer.extend_from_slice(b"\r\n400\r\n");
        buffer.extend(std::iter::repeat(b'a').take(0x400));
        buffer.extend_from_slice(b"\r\n0\r\n\r\n");
        assert_eq!(
            parser.parse(&mut buffer).unwrap_err(),
            ParseError::BodyTooLarge { limit: LIMIT }
        );
    }

    #[test]
    fn expect_continue_is_reported() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n";
        let mut parser = RequestParser::new(LIMIT);
        let mut buffer = raw.to_vec();
        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseStatus::Incomplete);
        assert!(parser.headers_complete());
        assert!(parser.expects_continue());
    }

    quickcheck! {
        /// Chunk-boundary invariance: parsing the same bytes split at
        /// arbitrary points yields the same request as a single pass.
        fn chunk_boundary_invariance(cuts: Vec<usize>) -> TestResult {
            let raw: &[u8] = b"POST /submit?x=1 HTTP/1.1\r\nHost: example\r\n\
                               Accept: */*\r\nContent-Length: 11\r\n\r\nhello=world";
            let (expected, _) = parse_all(raw).unwrap();

            let mut cuts: Vec<usize> = cuts.into_iter().map(|cut| cut % raw.len()).collect();
            cuts.sort_unstable();
            cuts.dedup();

            let mut parser = RequestParser::new(LIMIT);
            let mut buffer = Vec::new();
            let mut previous = 0;
            let mut result = None;
            for cut in cuts.into_iter().chain(std::iter::once(raw.len())) {
                buffer.extend_from_slice(&raw[previous..cut]);
                previous = cut;
                match parser.parse(&mut buffer) {
                    Ok(ParseStatus::Complete(request)) => {
                        result = Some(request);
                        break;
                    }
                    Ok(ParseStatus::Incomplete) => {}
                    Err(error) => panic!("split parse failed: {error}"),
                }
            }
            match result {
                Some(request) => TestResult::from_bool(request == expected),
                None => TestResult::failed(),
            }
        }
    }
}
