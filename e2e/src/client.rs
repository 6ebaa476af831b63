//! A blocking test client with a small receive buffer, reading exactly one
//! response at a time so pipelined exchanges can be asserted in order.

use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use crate::http_utils::{parse_response, ParsedResponse};

pub struct Client {
    pub name: String,
    address: SocketAddr,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
    pub requests_sent: usize,
    pub responses_received: usize,
}

impl Client {
    pub fn new<S: Into<String>>(name: S, address: SocketAddr) -> Client {
        Client {
            name: name.into(),
            address,
            stream: None,
            buffer: Vec::new(),
            requests_sent: 0,
            responses_received: 0,
        }
    }

    pub fn connect(&mut self) {
        let stream = TcpStream::connect(self.address).expect("could not connect to the server");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("could not set a read timeout");
        self.stream = Some(stream);
        self.buffer.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn send(&mut self, request: &str) {
        self.send_raw(request.as_bytes());
    }

    pub fn send_raw(&mut self, request: &[u8]) {
        let stream = self.stream.as_mut().expect("client is not connected");
        stream.write_all(request).expect("could not send the request");
        self.requests_sent += 1;
    }

    /// Half-close the sending side, leaving the receiving side open.
    pub fn shutdown_write(&mut self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }

    /// Drop the connection entirely.
    pub fn close(&mut self) {
        self.stream = None;
        self.buffer.clear();
    }

    /// Read raw bytes until the server closes, without framing the body;
    /// used for HEAD exchanges where Content-Length describes a body that
    /// is never sent.
    pub fn receive_until_close(&mut self) -> Vec<u8> {
        let stream = self.stream.as_mut().expect("client is not connected");
        let mut raw = std::mem::take(&mut self.buffer);
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(size) => raw.extend_from_slice(&chunk[..size]),
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => panic!("{}: read failed: {error}", self.name),
            }
        }
        self.stream = None;
        raw
    }

    /// Receive one full response, blocking up to the read timeout.
    /// `None` means the server closed the connection first.
    pub fn receive(&mut self) -> Option<ParsedResponse> {
        loop {
            if let Some((response, consumed)) = parse_response(&self.buffer, false) {
                self.buffer.drain(..consumed);
                self.responses_received += 1;
                return Some(response);
            }

            let stream = self.stream.as_mut()?;
            let mut chunk = [0u8; 16 * 1024];
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.stream = None;
                    // a close-delimited body completes on end of stream
                    if let Some((response, _)) = parse_response(&self.buffer, true) {
                        self.buffer.clear();
                        self.responses_received += 1;
                        return Some(response);
                    }
                    return None;
                }
                Ok(size) => self.buffer.extend_from_slice(&chunk[..size]),
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error)
                    if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    panic!("{}: timed out waiting for a response", self.name);
                }
                Err(error) => {
                    self.stream = None;
                    assert!(
                        self.buffer.is_empty(),
                        "{}: connection broke mid-response: {error}",
                        self.name
                    );
                    return None;
                }
            }
        }
    }

    /// Expect the server to close without sending anything.
    pub fn expect_silent_close(&mut self) {
        let stream = self.stream.as_mut().expect("client is not connected");
        let mut chunk = [0u8; 1024];
        match stream.read(&mut chunk) {
            Ok(0) => {}
            Ok(size) => panic!(
                "{}: expected a silent close, received {size} bytes",
                self.name
            ),
            Err(error) => panic!("{}: expected a silent close, got error {error}", self.name),
        }
        self.stream = None;
    }

    /// A receive attempt bounded by a short deadline, for asserting that no
    /// response arrives yet.
    pub fn try_receive_within(&mut self, timeout: Duration) -> Option<ParsedResponse> {
        let stream = self.stream.as_mut()?;
        stream
            .set_read_timeout(Some(timeout))
            .expect("could not adjust the read timeout");
        let mut chunk = [0u8; 16 * 1024];
        let outcome = match stream.read(&mut chunk) {
            Ok(0) => {
                self.stream = None;
                None
            }
            Ok(size) => {
                self.buffer.extend_from_slice(&chunk[..size]);
                parse_response(&self.buffer, false).map(|(response, consumed)| {
                    self.buffer.drain(..consumed);
                    self.responses_received += 1;
                    response
                })
            }
            Err(_) => None,
        };
        if let Some(stream) = self.stream.as_mut() {
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .expect("could not restore the read timeout");
        }
        outcome
    }
}
