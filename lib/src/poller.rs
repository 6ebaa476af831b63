//! Thin wrapper around `mio::Poll`.
//!
//! Sockets implement `mio::event::Source` and register directly; CGI pipe
//! descriptors go through `SourceFd`. Events are drained into an owned list
//! so the caller can dispatch while mutating the registry.

use std::{
    io::{self, ErrorKind},
    os::fd::RawFd,
    time::Duration,
};

use mio::{event::Source, unix::SourceFd, Events, Interest, Poll, Token};

use crate::ready::Ready;

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
        })
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    pub fn register_fd(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
    }

    pub fn deregister_fd(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Block until readiness events arrive or `timeout` elapses.
    ///
    /// An interrupted wait is not an error: it returns an empty batch so
    /// the event loop observes its signal flags and waits again. Any other
    /// polling error is fatal to the loop and propagated.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Ready)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(error) => return Err(error),
        }

        Ok(self
            .events
            .iter()
            .map(|event| (event.token(), Ready::from(event)))
            .collect())
    }
}
