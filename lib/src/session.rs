//! Per-client HTTP session.
//!
//! A session owns the client socket, its read and write buffers and the
//! parser state, and consumes its sticky readiness events in a bounded
//! inner loop. It never talks to the registry, the poller or the router:
//! when it needs the server (a request to route, an answer to render), it
//! returns [`SessionResult::Dispatch`] and exposes what it produced.

use std::{
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
    time::Duration,
};

use log::{debug, trace};
use mio::{net::TcpStream, Token};

use crate::{
    answers::DefaultAnswer,
    http::{
        response::{encode_chunk, BodySource, LAST_CHUNK},
        ParseError, ParseStatus, Request, RequestParser, Response,
    },
    ready::{Readiness, Ready},
    timer::TimeoutContainer,
    MAX_LOOP_ITERATIONS, SessionResult,
};

/// One socket read per loop iteration.
const READ_CHUNK: usize = 16 * 1024;
/// One file-body refill per writable pass.
const FILE_CHUNK: usize = 64 * 1024;
/// Flushed prefix length that triggers write buffer compaction.
const COMPACT_THRESHOLD: usize = 64 * 1024;
/// Write backlog above which CGI output draining is paused.
pub const WRITE_BACKPRESSURE: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// reading and parsing request bytes
    ReadingRequest,
    /// a complete request was handed over, its response is being produced
    Dispatched,
    WritingResponse,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketResult {
    Continue,
    WouldBlock,
    Closed,
    Error,
}

pub struct HttpSession {
    socket: TcpStream,
    pub token: Token,
    pub peer: SocketAddr,
    /// index of the virtual server owning the listener this came from
    pub server_index: usize,
    pub readiness: Readiness,
    pub state: SessionState,
    pub idle_timeout: TimeoutContainer,
    /// registry key of the in-flight CGI session, non-owning
    pub cgi: Option<usize>,

    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    write_cursor: usize,
    parser: RequestParser,
    body_limit: usize,

    pending_request: Option<Request>,
    pending_answer: Option<DefaultAnswer>,
    /// body left to stream from disk after the buffered part is flushed
    file_body: Option<(std::fs::File, u64)>,
    /// the current response ends with a chunked terminator from CGI
    cgi_chunked: bool,
    /// every queued byte of the current response is in the buffers
    response_complete: bool,
    keep_alive: bool,
    close_after_response: bool,
    sent_continue: bool,
    requests_served: usize,
}

impl HttpSession {
    pub fn new(
        socket: TcpStream,
        token: Token,
        peer: SocketAddr,
        server_index: usize,
        body_limit: usize,
        idle_timeout: Duration,
    ) -> HttpSession {
        HttpSession {
            socket,
            token,
            peer,
            server_index,
            readiness: Readiness {
                interest: Ready::READABLE | Ready::HUP | Ready::ERROR,
                event: Ready::EMPTY,
            },
            state: SessionState::ReadingRequest,
            idle_timeout: TimeoutContainer::new(idle_timeout),
            cgi: None,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            write_cursor: 0,
            parser: RequestParser::new(body_limit),
            body_limit,
            pending_request: None,
            pending_answer: None,
            file_body: None,
            cgi_chunked: false,
            response_complete: false,
            keep_alive: true,
            close_after_response: false,
            sent_continue: false,
            requests_served: 0,
        }
    }

    pub fn update_readiness(&mut self, events: Ready) {
        self.readiness.event |= events;
    }

    /// Consume readiness until nothing can progress, a request is ready for
    /// routing, or the session must close.
    pub fn ready(&mut self) -> SessionResult {
        if self.state == SessionState::Closing {
            return SessionResult::Close;
        }

        let mut counter = 0;
        while counter < MAX_LOOP_ITERATIONS {
            let interest = self.readiness.filter_interest();

            if interest.is_error() {
                trace!("session {:?} socket error, closing", self.token);
                return SessionResult::Close;
            }

            let mut progressed = false;
            if interest.is_readable() {
                progressed = true;
                match self.readable() {
                    SessionResult::Continue => {}
                    other => return other,
                }
            }

            if interest.is_writable() {
                progressed = true;
                match self.writable() {
                    SessionResult::Continue => {}
                    other => return other,
                }
            }

            if !progressed {
                // a hangup that neither direction can observe anymore
                if interest.is_hup() {
                    trace!("session {:?} hangup, closing", self.token);
                    return SessionResult::Close;
                }
                return SessionResult::Continue;
            }

            counter += 1;
        }

        debug!(
            "session {:?} went through {MAX_LOOP_ITERATIONS} iterations, closing: {:?}",
            self.token, self.readiness
        );
        SessionResult::Close
    }

    fn readable(&mut self) -> SessionResult {
        if self.state != SessionState::ReadingRequest {
            // pipelined bytes stay in the kernel buffer until the current
            // exchange completes
            self.readiness.interest.remove(Ready::READABLE);
            return SessionResult::Continue;
        }

        match self.socket_read() {
            SocketResult::Continue | SocketResult::WouldBlock => {}
            SocketResult::Closed => return self.peer_closed(),
            SocketResult::Error => {
                // transport failure: no response is attempted
                return SessionResult::Close;
            }
        }

        self.advance_parser()
    }

    /// Orderly end of stream from the client. Between requests this is a
    /// plain close; in the middle of one it is a premature stream end,
    /// answered with 400 on the still-open write side.
    fn peer_closed(&mut self) -> SessionResult {
        self.readiness.interest.remove(Ready::READABLE);

        match self.parser.parse(&mut self.read_buffer) {
            Ok(ParseStatus::Complete(request)) => {
                self.keep_alive = false;
                self.pending_request = Some(request);
                self.state = SessionState::Dispatched;
                SessionResult::Dispatch
            }
            Ok(ParseStatus::Incomplete) => {
                if self.parser.is_initial() && self.read_buffer.is_empty() {
                    return SessionResult::Close;
                }
                self.pending_answer = Some(DefaultAnswer::Answer400 {
                    message: "premature end of request stream".to_string(),
                });
                self.state = SessionState::Dispatched;
                self.close_after_response = true;
                SessionResult::Dispatch
            }
            Err(error) => {
                self.pending_answer = Some(answer_for_parse_error(error));
                self.state = SessionState::Dispatched;
                self.close_after_response = true;
                SessionResult::Dispatch
            }
        }
    }

    fn socket_read(&mut self) -> SocketResult {
        let mut chunk = [0u8; READ_CHUNK];
        match self.socket.read(&mut chunk) {
            Ok(0) => SocketResult::Closed,
            Ok(size) => {
                self.read_buffer.extend_from_slice(&chunk[..size]);
                self.idle_timeout.reset();
                SocketResult::Continue
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                self.readiness.event.remove(Ready::READABLE);
                SocketResult::WouldBlock
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => SocketResult::WouldBlock,
            Err(error) => {
                debug!("session {:?} read error: {error}", self.token);
                SocketResult::Error
            }
        }
    }

    fn advance_parser(&mut self) -> SessionResult {
        match self.parser.parse(&mut self.read_buffer) {
            Ok(ParseStatus::Complete(request)) => {
                self.keep_alive = request.keep_alive();
                self.pending_request = Some(request);
                self.state = SessionState::Dispatched;
                self.readiness.interest.remove(Ready::READABLE);
                self.idle_timeout.reset();
                SessionResult::Dispatch
            }
            Ok(ParseStatus::Incomplete) => {
                // interim answer before the client commits the body
                if self.parser.expects_continue() && !self.sent_continue {
                    self.sent_continue = true;
                    self.write_buffer
                        .extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
                    self.arm_writable();
                }
                SessionResult::Continue
            }
            Err(error) => {
                debug!("session {:?} parse error: {error}", self.token);
                self.pending_answer = Some(answer_for_parse_error(error));
                self.state = SessionState::Dispatched;
                self.readiness.interest.remove(Ready::READABLE);
                self.close_after_response = true;
                SessionResult::Dispatch
            }
        }
    }

    fn writable(&mut self) -> SessionResult {
        loop {
            while self.write_cursor < self.write_buffer.len() {
                match self.socket.write(&self.write_buffer[self.write_cursor..]) {
                    Ok(0) => {
                        self.readiness.event.remove(Ready::WRITABLE);
                        return SessionResult::Continue;
                    }
                    Ok(written) => {
                        self.write_cursor += written;
                        self.idle_timeout.reset();
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {
                        self.readiness.event.remove(Ready::WRITABLE);
                        self.compact_write_buffer();
                        return SessionResult::Continue;
                    }
                    Err(error) if error.kind() == ErrorKind::Interrupted => {}
                    Err(error) => {
                        // broken pipe or reset: discard the session silently
                        debug!("session {:?} write error: {error}", self.token);
                        return SessionResult::Close;
                    }
                }
            }
            self.compact_write_buffer();

            // refill from the file body, if any remains
            if let Some((file, remaining)) = &mut self.file_body {
                let mut chunk = vec![0u8; FILE_CHUNK.min(*remaining as usize)];
                match file.read(&mut chunk) {
                    Ok(0) => {
                        // file shrank under us; the framing cannot be
                        // honored anymore
                        debug!("session {:?} file body truncated", self.token);
                        return SessionResult::Close;
                    }
                    Ok(size) => {
                        *remaining -= size as u64;
                        let done = *remaining == 0;
                        self.write_buffer.extend_from_slice(&chunk[..size]);
                        if done {
                            self.file_body = None;
                        }
                        continue;
                    }
                    Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                    Err(error) => {
                        debug!("session {:?} file read error: {error}", self.token);
                        return SessionResult::Close;
                    }
                }
            }
            break;
        }

        // everything queued so far was flushed
        if self.response_complete {
            return self.finish_response();
        }
        // waiting for more CGI output or a response head
        self.readiness.interest.remove(Ready::WRITABLE);
        SessionResult::Continue
    }

    fn compact_write_buffer(&mut self) {
        if self.write_cursor == self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_cursor = 0;
        } else if self.write_cursor > COMPACT_THRESHOLD {
            self.write_buffer.drain(..self.write_cursor);
            self.write_cursor = 0;
        }
    }

    /// The response was fully flushed: reset for keep-alive or close.
    fn finish_response(&mut self) -> SessionResult {
        if !self.keep_alive || self.close_after_response {
            return SessionResult::Close;
        }

        self.requests_served += 1;
        self.state = SessionState::ReadingRequest;
        self.parser = RequestParser::new(self.body_limit);
        self.write_buffer.clear();
        self.write_cursor = 0;
        self.file_body = None;
        self.cgi_chunked = false;
        self.response_complete = false;
        self.sent_continue = false;
        self.readiness.interest = Ready::READABLE | Ready::HUP | Ready::ERROR;
        self.idle_timeout.reset();

        // pipelined bytes already buffered seed the next parse cycle
        if !self.read_buffer.is_empty() {
            self.readiness.event.insert(Ready::READABLE);
            return self.advance_parser();
        }
        SessionResult::Continue
    }

    pub fn take_request(&mut self) -> Option<Request> {
        self.pending_request.take()
    }

    pub fn take_answer(&mut self) -> Option<DefaultAnswer> {
        self.pending_answer.take()
    }

    /// Queue a complete response head and body. `head_only` strips the body
    /// for HEAD requests while keeping the framing headers accurate.
    pub fn queue_response(&mut self, response: Response, head_only: bool) {
        if self.close_after_response {
            self.keep_alive = false;
        }
        self.write_buffer
            .extend_from_slice(&response.encode_head(self.keep_alive));

        match response.body {
            BodySource::None => {
                self.response_complete = true;
            }
            BodySource::Bytes(bytes) => {
                if !head_only {
                    self.write_buffer.extend_from_slice(&bytes);
                }
                self.response_complete = true;
            }
            BodySource::File { file, remaining } => {
                if head_only || remaining == 0 {
                    self.response_complete = true;
                } else {
                    self.file_body = Some((file, remaining));
                    self.response_complete = true;
                }
            }
            BodySource::CgiStream { chunked } => {
                self.cgi_chunked = chunked;
                self.response_complete = false;
            }
        }

        self.state = SessionState::WritingResponse;
        self.arm_writable();
    }

    /// Render and queue a default answer; errors always end the connection
    /// after the response unless the caller says otherwise.
    pub fn queue_answer(&mut self, response: Response, close_after: bool) {
        if close_after {
            self.close_after_response = true;
        }
        self.queue_response(response, false);
    }

    /// Append CGI body bytes, chunk-framed when the script did not declare
    /// a length.
    pub fn queue_cgi_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.cgi_chunked {
            encode_chunk(bytes, &mut self.write_buffer);
        } else {
            self.write_buffer.extend_from_slice(bytes);
        }
        self.arm_writable();
    }

    /// The CGI stream ended: terminate the framing and let the flush path
    /// finish the exchange.
    pub fn finish_cgi_response(&mut self) {
        if self.cgi_chunked {
            self.write_buffer.extend_from_slice(LAST_CHUNK);
        }
        self.response_complete = true;
        self.arm_writable();
    }

    /// Force the connection to close once the current response is flushed,
    /// before its head is encoded.
    pub fn set_close_after(&mut self) {
        self.close_after_response = true;
    }

    fn arm_writable(&mut self) {
        self.readiness.interest.insert(Ready::WRITABLE);
        // attempt the write on this pass; if the socket is full the event
        // bit clears on WouldBlock and the poller re-arms it
        self.readiness.event.insert(Ready::WRITABLE);
    }

    /// Unflushed bytes queued on this session.
    pub fn write_backlog(&self) -> usize {
        self.write_buffer.len() - self.write_cursor
    }

    pub fn requests_served(&self) -> usize {
        self.requests_served
    }

    /// true when the idle sweeper should answer 408 rather than close
    /// silently: the connection is waiting for its first request or has a
    /// partial one buffered
    pub fn deserves_request_timeout_answer(&self) -> bool {
        self.state == SessionState::ReadingRequest
            && (self.requests_served == 0 || !self.parser.is_initial() || !self.read_buffer.is_empty())
    }

    /// Called during graceful shutdown; returns true when the session can
    /// be closed right away.
    pub fn shutting_down(&mut self) -> bool {
        if self.state == SessionState::ReadingRequest
            && self.parser.is_initial()
            && self.read_buffer.is_empty()
            && self.write_backlog() == 0
        {
            return true;
        }
        self.close_after_response = true;
        false
    }

    /// Mark closed; a second close is a no-op handled by the registry.
    pub fn close(&mut self) {
        self.state = SessionState::Closing;
        self.readiness.reset();
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }
}

fn answer_for_parse_error(error: ParseError) -> DefaultAnswer {
    match &error {
        ParseError::UnsupportedMethod(_) => DefaultAnswer::Answer501 {},
        ParseError::BodyTooLarge { limit } => DefaultAnswer::Answer413 { limit: *limit },
        _ => DefaultAnswer::Answer400 {
            message: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_to_answers() {
        assert_eq!(
            answer_for_parse_error(ParseError::UnsupportedMethod("BREW".to_string())),
            DefaultAnswer::Answer501 {}
        );
        assert_eq!(
            answer_for_parse_error(ParseError::BodyTooLarge { limit: 10 }),
            DefaultAnswer::Answer413 { limit: 10 }
        );
        assert!(matches!(
            answer_for_parse_error(ParseError::MissingHost),
            DefaultAnswer::Answer400 { .. }
        ));
    }
}
