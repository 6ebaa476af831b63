//! CGI subprocess sessions.
//!
//! A CGI session owns one spawned interpreter and its two pipes. Both pipe
//! descriptors are registered non-blocking in the same multiplexer as the
//! client sockets, and both directions keep their interest armed at the
//! same time: the request body drains into stdin in bounded increments
//! while stdout is read as the script produces output, in whatever order
//! readiness reports. Writing everything before reading anything would
//! deadlock as soon as both pipe buffers fill up.
//!
//! The subprocess environment is an explicit per-session variable list
//! handed to the child at spawn time; the server's own environment is
//! never mutated.

use std::{
    io::{self, ErrorKind, Read, Write},
    os::{
        fd::{AsRawFd, RawFd},
        unix::process::ExitStatusExt,
    },
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
    time::Duration,
};

use log::{debug, warn};
use memchr::memmem;
use mio::Token;

use crate::{
    http::{request::Headers, response::reason_phrase},
    ready::{Readiness, Ready},
    timer::TimeoutContainer,
};

/// Cap on one pipe read or write, so a fast script cannot monopolize the
/// event loop iteration.
const PIPE_IO_CHUNK: usize = 64 * 1024;
/// Cap on accumulated output while the header section is still missing.
const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiState {
    /// request body bytes remain to be written to the child's stdin
    WritingInput,
    /// stdin is closed, stdout is drained until end of stream
    DrainingOutput,
    /// stdout reached end of stream and the child was reaped
    Done,
    TimedOut,
    Failed,
}

/// The script's response head: CGI header lines up to a blank line, with an
/// optional `Status` header overriding the default 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiHead {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
}

pub struct CgiSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    pub stdin_token: Token,
    pub stdout_token: Token,
    /// registry key of the owning client session, non-owning
    pub owner: usize,
    pub stdin_readiness: Readiness,
    pub stdout_readiness: Readiness,
    pub state: CgiState,
    /// absolute execution deadline, never extended by I/O progress
    pub deadline: TimeoutContainer,

    input: Vec<u8>,
    input_cursor: usize,
    output: Vec<u8>,
    head: Option<CgiHead>,
    /// the head was forwarded to the client, errors can no longer be
    /// converted into a default answer
    pub head_sent: bool,
    /// the response body is forwarded with chunked framing
    pub chunked: bool,
    /// HEAD request: forward the head, discard the body
    pub head_only: bool,
    /// HTTP/1.0 client: chunked framing is unavailable, unknown-length
    /// bodies are close-delimited instead
    pub http10: bool,
    stdout_eof: bool,
    exited: Option<ExitStatus>,
    invalid_output: bool,
}

impl CgiSession {
    /// Spawn the interpreter on the script with the given environment, the
    /// request body queued for its stdin.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        interpreter: &Path,
        script: &Path,
        env: Vec<(String, String)>,
        input: Vec<u8>,
        timeout: Duration,
        owner: usize,
        stdin_token: Token,
        stdout_token: Token,
    ) -> io::Result<CgiSession> {
        let script = script.canonicalize()?;
        let workdir = script.parent().unwrap_or_else(|| Path::new("/"));

        let mut child = Command::new(interpreter)
            .arg(&script)
            .current_dir(workdir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(ErrorKind::Other, "subprocess pipes missing"));
            }
        };
        set_nonblocking(stdin.as_raw_fd())?;
        set_nonblocking(stdout.as_raw_fd())?;

        Ok(CgiSession {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stdin_token,
            stdout_token,
            owner,
            stdin_readiness: Readiness {
                interest: Ready::WRITABLE | Ready::HUP | Ready::ERROR,
                event: Ready::EMPTY,
            },
            stdout_readiness: Readiness {
                interest: Ready::READABLE | Ready::HUP | Ready::ERROR,
                event: Ready::EMPTY,
            },
            state: CgiState::WritingInput,
            deadline: TimeoutContainer::new(timeout),
            input,
            input_cursor: 0,
            output: Vec::new(),
            head: None,
            head_sent: false,
            chunked: false,
            head_only: false,
            http10: false,
            stdout_eof: false,
            exited: None,
            invalid_output: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|stdin| stdin.as_raw_fd())
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(|stdout| stdout.as_raw_fd())
    }

    /// true once input writing is over, successfully or not; the server
    /// then deregisters and closes the stdin pipe
    pub fn input_finished(&self) -> bool {
        matches!(self.state, CgiState::WritingInput) && self.stdin.is_some() && {
            self.input_cursor >= self.input.len()
        }
    }

    /// Drain pending request-body bytes into the child's stdin.
    pub fn writable(&mut self) {
        let stdin = match &mut self.stdin {
            Some(stdin) => stdin,
            None => {
                self.stdin_readiness.interest.remove(Ready::WRITABLE);
                return;
            }
        };

        while self.input_cursor < self.input.len() {
            let end = (self.input_cursor + PIPE_IO_CHUNK).min(self.input.len());
            match stdin.write(&self.input[self.input_cursor..end]) {
                Ok(0) => break,
                Ok(written) => {
                    self.input_cursor += written;
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    self.stdin_readiness.event.remove(Ready::WRITABLE);
                    return;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    // the child exited before consuming its input; the
                    // remaining bytes are discarded and its output drained
                    debug!("cgi {} stdin write failed: {error}", self.child.id());
                    self.input_cursor = self.input.len();
                    break;
                }
            }
        }
    }

    /// Close stdin once all input was written or abandoned. Returns the
    /// descriptor so the caller can deregister it first.
    pub fn close_stdin(&mut self) -> Option<RawFd> {
        let fd = self.stdin_fd()?;
        self.stdin = None;
        self.stdin_readiness.reset();
        if self.state == CgiState::WritingInput {
            self.state = CgiState::DrainingOutput;
        }
        Some(fd)
    }

    /// Accumulate script output; on end of stream, remember the EOF so the
    /// session can complete once the child is reaped.
    pub fn readable(&mut self) {
        let stdout = match &mut self.stdout {
            Some(stdout) => stdout,
            None => {
                self.stdout_readiness.interest.remove(Ready::READABLE);
                return;
            }
        };

        let mut chunk = [0u8; PIPE_IO_CHUNK];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => {
                    self.stdout_eof = true;
                    self.stdout_readiness.interest.remove(Ready::READABLE);
                    break;
                }
                Ok(size) => {
                    self.output.extend_from_slice(&chunk[..size]);
                    if self.head.is_none() && self.output.len() > MAX_HEAD_BYTES {
                        warn!(
                            "cgi {} produced {} bytes without a header section",
                            self.child.id(),
                            self.output.len()
                        );
                        self.invalid_output = true;
                        self.stdout_readiness.interest.remove(Ready::READABLE);
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    self.stdout_readiness.event.remove(Ready::READABLE);
                    break;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    debug!("cgi {} stdout read failed: {error}", self.child.id());
                    self.stdout_eof = true;
                    break;
                }
            }
        }
    }

    /// Try to split the accumulated output into a response head; body bytes
    /// already received stay in the accumulator.
    ///
    /// Returns the head the first time it becomes available.
    pub fn poll_head(&mut self) -> Option<CgiHead> {
        if self.head.is_some() || self.invalid_output {
            return None;
        }

        // scripts may terminate header lines with CRLF or bare LF; the
        // earlier separator wins so a binary body cannot be misread as head
        let crlf = memmem::find(&self.output, b"\r\n\r\n").map(|position| (position, position + 4));
        let lf = memmem::find(&self.output, b"\n\n").map(|position| (position, position + 2));
        let (head_end, body_start) = match (crlf, lf) {
            (Some(crlf), Some(lf)) => {
                if crlf.0 <= lf.0 {
                    crlf
                } else {
                    lf
                }
            }
            (Some(crlf), None) => crlf,
            (None, Some(lf)) => lf,
            (None, None) => return None,
        };

        let head_bytes = self.output[..head_end].to_vec();
        self.output.drain(..body_start);

        match parse_cgi_head(&head_bytes) {
            Some(head) => {
                self.chunked = !head.headers.contains("content-length");
                self.head = Some(head.clone());
                Some(head)
            }
            None => {
                self.invalid_output = true;
                None
            }
        }
    }

    pub fn head(&self) -> Option<&CgiHead> {
        self.head.as_ref()
    }

    /// Body bytes accumulated since the last call, empty until the head
    /// was parsed.
    pub fn take_body(&mut self) -> Vec<u8> {
        if self.head.is_none() {
            return Vec::new();
        }
        std::mem::take(&mut self.output)
    }

    /// Non-blocking reap, polled on every loop iteration and on SIGCHLD.
    pub fn try_reap(&mut self) {
        if self.exited.is_some() {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("cgi {} exited with {status}", self.child.id());
                self.exited = Some(status);
            }
            Ok(None) => {}
            Err(error) => {
                warn!("cgi {} wait failed: {error}", self.child.id());
                self.exited = Some(ExitStatus::from_raw(0));
            }
        }
    }

    /// Declare the terminal state once stdout reached end of stream and the
    /// child was reaped, or invalid output was detected.
    pub fn check_completion(&mut self) {
        if matches!(self.state, CgiState::Done | CgiState::TimedOut | CgiState::Failed) {
            return;
        }
        if self.invalid_output {
            self.state = CgiState::Failed;
            return;
        }
        if self.stdout_eof {
            self.try_reap();
            if self.exited.is_some() {
                self.state = if self.head.is_some() {
                    CgiState::Done
                } else {
                    // end of stream without a valid header section
                    CgiState::Failed
                };
            }
        }
    }

    /// Forcibly terminate and reap the child. Idempotent; no zombie is left
    /// behind.
    pub fn kill_and_reap(&mut self) {
        if self.exited.is_some() {
            return;
        }
        if let Err(error) = self.child.kill() {
            debug!("cgi {} kill failed: {error}", self.child.id());
        }
        match self.child.wait() {
            Ok(status) => self.exited = Some(status),
            Err(error) => {
                warn!("cgi {} could not be reaped: {error}", self.child.id());
                self.exited = Some(ExitStatus::from_raw(0));
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CgiState::Done | CgiState::TimedOut | CgiState::Failed)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl calls on a descriptor we own
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Parse CGI header lines: `Name: value` pairs, `\r\n` or `\n` terminated,
/// with `Status: <code> [reason]` overriding the default 200.
fn parse_cgi_head(raw: &[u8]) -> Option<CgiHead> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut status = 200;
    let mut reason = None;
    let mut headers = Headers::new();

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return None;
        }
        if name.eq_ignore_ascii_case("status") {
            let mut parts = value.splitn(2, ' ');
            status = parts.next()?.parse().ok()?;
            reason = parts.next().map(|reason| reason.trim().to_string());
        } else {
            headers.insert(name, value);
        }
    }

    if reason.is_none() && status != 200 {
        reason = Some(reason_phrase(status).to_string());
    }
    Some(CgiHead {
        status,
        reason,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_defaults_to_200() {
        let head = parse_cgi_head(b"Content-Type: text/html").unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers.get("content-type"), Some("text/html"));
    }

    #[test]
    fn status_header_overrides() {
        let head = parse_cgi_head(b"Status: 404 Gone Missing\r\nContent-Type: text/plain").unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason.as_deref(), Some("Gone Missing"));
        // the Status pseudo-header is not forwarded
        assert!(!head.headers.contains("status"));
    }

    #[test]
    fn bare_lf_lines_are_accepted() {
        let head = parse_cgi_head(b"Content-Type: text/plain\nX-Extra: 1").unwrap();
        assert_eq!(head.headers.get("x-extra"), Some("1"));
    }

    #[test]
    fn invalid_head_is_rejected() {
        assert!(parse_cgi_head(b"no colon here").is_none());
        assert!(parse_cgi_head(b"Status: abc").is_none());
        assert!(parse_cgi_head(b": empty name").is_none());
    }

    #[test]
    fn head_splitting_keeps_body_bytes() {
        // poll_head operates on a session; exercise the separator scan the
        // same way through a minimal fixture
        let output = b"Content-Type: text/plain\r\n\r\nhello".to_vec();
        let position = memmem::find(&output, b"\r\n\r\n").unwrap();
        let head = parse_cgi_head(&output[..position]).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(&output[position + 4..], b"hello");
    }
}
