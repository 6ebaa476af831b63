//! The event loop and its registry.
//!
//! One control flow repeatedly waits on the multiplexer and dispatches
//! ready tokens to the entity owning them. The registry is the sole owner
//! of sessions and CGI sessions; the two sides reference each other only
//! through registry keys, never through direct ownership.
//!
//! Signal handlers never do work here: they set the atomic flags below and
//! the loop observes them on its next iteration, which the bounded poll
//! timeout guarantees to come soon.

use std::{
    collections::HashMap,
    fs, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Once,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};
use mio::{net::TcpListener, Interest, Token};
use nix::sys::signal::{signal, SigHandler, Signal};
use slab::Slab;

use crate::{
    answers::DefaultAnswer,
    cgi::{CgiSession, CgiState},
    config::Config,
    files,
    http::{Method, Request, Response, Version, response::BodySource},
    poller::Poller,
    ready::Ready,
    router::{self, RouteDecision},
    session::{HttpSession, WRITE_BACKPRESSURE},
    SessionResult,
};

/// Set by the binary's SIGINT/SIGTERM handlers, observed by every loop.
pub static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);
/// Set by the binary's SIGCHLD handler to accelerate reaping.
pub static CHILD_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Bound on driving one session per dispatch, over and above the session's
/// own inner loop guard.
const MAX_SESSION_ROUNDS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Listener(usize),
    Session(usize),
    CgiStdin(usize),
    CgiStdout(usize),
}

struct Listener {
    socket: TcpListener,
    token: Token,
    server_index: usize,
    registered: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("could not create the poller: {0}")]
    Poller(io::Error),
    #[error("could not bind {0}: {1}")]
    Bind(SocketAddr, io::Error),
    #[error("could not register a listener: {0}")]
    Register(io::Error),
    #[error("event loop failure: {0}")]
    Poll(io::Error),
}

pub struct Server {
    poller: Poller,
    config: Config,
    listeners: Vec<Listener>,
    tokens: HashMap<Token, TokenKind>,
    sessions: Slab<HttpSession>,
    cgis: Slab<CgiSession>,
    next_token: usize,
    accepting: bool,
    stop: Arc<AtomicBool>,
    drain_deadline: Option<Instant>,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, ServerError> {
        ignore_sigpipe();

        let poller = Poller::new().map_err(ServerError::Poller)?;
        let mut server = Server {
            poller,
            listeners: Vec::new(),
            tokens: HashMap::new(),
            sessions: Slab::with_capacity(config.max_connections),
            cgis: Slab::new(),
            next_token: 0,
            accepting: true,
            stop: Arc::new(AtomicBool::new(false)),
            drain_deadline: None,
            config,
        };

        for index in 0..server.config.servers.len() {
            let address = server.config.servers[index].listen;
            let mut socket =
                bind_listener(address).map_err(|error| ServerError::Bind(address, error))?;
            let token = server.alloc_token();
            server
                .poller
                .register(&mut socket, token, Interest::READABLE)
                .map_err(ServerError::Register)?;
            server.tokens.insert(token, TokenKind::Listener(index));
            server.listeners.push(Listener {
                socket,
                token,
                server_index: index,
                registered: true,
            });
        }
        Ok(server)
    }

    /// Flag that makes `run` start a graceful shutdown, usable from another
    /// thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// The actually bound addresses, resolved after binding port 0.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.socket.local_addr().ok())
            .collect()
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        for listener in &self.listeners {
            if let Ok(address) = listener.socket.local_addr() {
                info!("listening on http://{address}");
            }
        }

        loop {
            let shutdown_requested =
                self.stop.load(Ordering::SeqCst) || SHUTDOWN_SIGNAL.swap(false, Ordering::SeqCst);
            if shutdown_requested && self.drain_deadline.is_none() {
                self.begin_shutdown();
            }

            if let Some(deadline) = self.drain_deadline {
                if self.sessions.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(
                        "shutdown grace period elapsed, closing {} sessions",
                        self.sessions.len()
                    );
                    let keys: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
                    for key in keys {
                        self.close_session(key);
                    }
                    break;
                }
            }

            let timeout = self.next_timeout();
            let events = self.poller.wait(Some(timeout)).map_err(ServerError::Poll)?;
            for (token, ready) in events {
                self.dispatch(token, ready);
            }

            CHILD_SIGNAL.swap(false, Ordering::SeqCst);
            self.sweep();
        }

        info!("shutdown complete");
        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Bound the wait so the sweeper runs close to the earliest deadline.
    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = Duration::from_millis(500);
        for (_, session) in self.sessions.iter() {
            if let Some(remaining) = session.idle_timeout.remaining(now) {
                timeout = timeout.min(remaining);
            }
        }
        for (_, cgi) in self.cgis.iter() {
            if let Some(remaining) = cgi.deadline.remaining(now) {
                timeout = timeout.min(remaining);
            }
        }
        if let Some(deadline) = self.drain_deadline {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        timeout.max(Duration::from_millis(10))
    }

    fn dispatch(&mut self, token: Token, ready: Ready) {
        match self.tokens.get(&token).copied() {
            Some(TokenKind::Listener(index)) => {
                if ready.is_readable() {
                    self.accept_loop(index);
                }
            }
            Some(TokenKind::Session(key)) => {
                if let Some(session) = self.sessions.get_mut(key) {
                    session.update_readiness(ready);
                }
                self.run_session(key);
            }
            Some(TokenKind::CgiStdin(key)) => {
                let owner = match self.cgis.get_mut(key) {
                    Some(cgi) => {
                        cgi.stdin_readiness.event |= ready;
                        cgi.owner
                    }
                    None => return,
                };
                self.run_session(owner);
            }
            Some(TokenKind::CgiStdout(key)) => {
                let owner = match self.cgis.get_mut(key) {
                    Some(cgi) => {
                        cgi.stdout_readiness.event |= ready;
                        cgi.owner
                    }
                    None => return,
                };
                self.run_session(owner);
            }
            // stale token from an entity released earlier in this batch
            None => trace!("ignoring event for stale token {token:?}"),
        }
    }

    fn accept_loop(&mut self, listener_index: usize) {
        if self.drain_deadline.is_some() {
            return;
        }
        loop {
            if self.sessions.len() >= self.config.max_connections {
                // explicit backpressure: pending connections stay in the
                // kernel accept queue until a slot frees up
                info!(
                    "connection cap of {} reached, pausing accept",
                    self.config.max_connections
                );
                self.pause_accepting();
                return;
            }

            let listener = &mut self.listeners[listener_index];
            match listener.socket.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(error) =
                        self.poller
                            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                    {
                        error!("could not register accepted socket: {error}");
                        continue;
                    }
                    let server_index = self.listeners[listener_index].server_index;
                    let session = HttpSession::new(
                        stream,
                        token,
                        peer,
                        server_index,
                        self.config.client_body_limit,
                        Duration::from_secs(self.config.idle_timeout),
                    );
                    let key = self.sessions.insert(session);
                    self.tokens.insert(token, TokenKind::Session(key));
                    trace!("accepted {peer} as session {key}");
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error)
                    if matches!(error.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) =>
                {
                    // descriptor exhaustion throttles accepting, it never
                    // brings the loop down
                    error!("out of descriptors while accepting: {error}");
                    self.pause_accepting();
                    return;
                }
                Err(error) => {
                    error!("accept failed: {error}");
                    return;
                }
            }
        }
    }

    fn pause_accepting(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        for listener in &mut self.listeners {
            if listener.registered {
                if let Err(error) = self.poller.deregister(&mut listener.socket) {
                    error!("could not deregister listener: {error}");
                }
                listener.registered = false;
            }
        }
    }

    fn resume_accepting(&mut self) {
        if self.accepting || self.drain_deadline.is_some() {
            return;
        }
        self.accepting = true;
        for listener in &mut self.listeners {
            if !listener.registered {
                if let Err(error) =
                    self.poller
                        .register(&mut listener.socket, listener.token, Interest::READABLE)
                {
                    error!("could not re-register listener: {error}");
                    continue;
                }
                listener.registered = true;
            }
        }
        debug!("resumed accepting connections");
    }

    /// Drive one session until neither it nor its CGI can make progress.
    fn run_session(&mut self, key: usize) {
        let mut rounds = 0;
        while rounds < MAX_SESSION_ROUNDS {
            rounds += 1;
            let result = match self.sessions.get_mut(key) {
                Some(session) => session.ready(),
                None => return,
            };
            match result {
                SessionResult::Close => {
                    self.close_session(key);
                    return;
                }
                SessionResult::Dispatch => {
                    self.handle_dispatch(key);
                }
                SessionResult::Continue => {
                    let cgi_key = match self.sessions.get(key) {
                        Some(session) => session.cgi,
                        None => return,
                    };
                    match cgi_key {
                        Some(cgi_key) => {
                            if !self.pump_cgi(cgi_key) {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
        debug!("session {key} exceeded {MAX_SESSION_ROUNDS} dispatch rounds, closing");
        self.close_session(key);
    }

    /// The single exhaustive dispatcher consuming routing decisions.
    fn handle_dispatch(&mut self, key: usize) {
        let (answer, request, server_index, peer) = match self.sessions.get_mut(key) {
            Some(session) => (
                session.take_answer(),
                session.take_request(),
                session.server_index,
                session.peer,
            ),
            None => return,
        };

        if let Some(answer) = answer {
            self.queue_answer(key, answer, true);
            return;
        }
        let request = match request {
            Some(request) => request,
            None => return,
        };
        let head_only = request.method == Method::Head;

        let decision = router::route(&self.config.servers[server_index], &request, peer);
        debug!(
            "{} {} {} -> {}",
            peer,
            request.method,
            request.path,
            decision_label(&decision)
        );

        match decision {
            RouteDecision::ServeStatic {
                path,
                index,
                autoindex,
            } => match files::serve(&path, &request.path, &index, autoindex) {
                Ok(response) => self.queue_ok_response(key, response, head_only),
                Err(error) => {
                    let answer = match files::error_status(&error) {
                        404 => DefaultAnswer::Answer404 {},
                        403 => DefaultAnswer::Answer403 {},
                        _ => DefaultAnswer::Answer500 {},
                    };
                    self.queue_answer(key, answer, false);
                }
            },
            RouteDecision::Redirect { location, code } => {
                self.queue_answer(key, DefaultAnswer::AnswerRedirect { location, code }, false);
            }
            RouteDecision::Error { status, allow } => {
                let answer = match status {
                    400 => DefaultAnswer::Answer400 {
                        message: "invalid request target".to_string(),
                    },
                    403 => DefaultAnswer::Answer403 {},
                    404 => DefaultAnswer::Answer404 {},
                    405 => DefaultAnswer::Answer405 {
                        allow: allow.unwrap_or_default(),
                    },
                    _ => DefaultAnswer::Answer500 {},
                };
                self.queue_answer(key, answer, status == 400 || status >= 500);
            }
            RouteDecision::Upload { target } => self.handle_upload(key, target, request),
            RouteDecision::Delete { path } => self.handle_delete(key, path),
            RouteDecision::InvokeCgi {
                interpreter,
                script,
                env,
            } => self.start_cgi(key, interpreter, script, env, request, head_only),
        }
    }

    fn queue_ok_response(&mut self, key: usize, response: Response, head_only: bool) {
        if let Some(session) = self.sessions.get_mut(key) {
            session.queue_response(response, head_only);
        }
    }

    fn queue_answer(&mut self, key: usize, answer: DefaultAnswer, close_after: bool) {
        let server_index = match self.sessions.get(key) {
            Some(session) => session.server_index,
            None => return,
        };
        let response = answer.into_response(self.config.servers.get(server_index));
        if let Some(session) = self.sessions.get_mut(key) {
            session.queue_answer(response, close_after);
        }
    }

    fn handle_upload(&mut self, key: usize, target: std::path::PathBuf, request: Request) {
        let stored = target
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::write(&target, &request.body));
        match stored {
            Ok(()) => {
                let mut response = Response::with_body(201, "text/plain", "created\n");
                response.headers.insert("Location", request.path.clone());
                self.queue_ok_response(key, response, false);
            }
            Err(error) => {
                warn!("upload to {} failed: {error}", target.display());
                self.queue_answer(key, DefaultAnswer::Answer500 {}, true);
            }
        }
    }

    fn handle_delete(&mut self, key: usize, path: std::path::PathBuf) {
        let answer = match fs::metadata(&path) {
            Err(_) => Some(DefaultAnswer::Answer404 {}),
            Ok(metadata) if metadata.is_dir() => Some(DefaultAnswer::Answer403 {}),
            Ok(_) => match fs::remove_file(&path) {
                Ok(()) => None,
                Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                    Some(DefaultAnswer::Answer403 {})
                }
                Err(error) => {
                    warn!("delete of {} failed: {error}", path.display());
                    Some(DefaultAnswer::Answer500 {})
                }
            },
        };
        match answer {
            Some(answer) => self.queue_answer(key, answer, false),
            None => self.queue_ok_response(key, Response::new(204), false),
        }
    }

    fn start_cgi(
        &mut self,
        key: usize,
        interpreter: std::path::PathBuf,
        script: std::path::PathBuf,
        env: Vec<(String, String)>,
        request: Request,
        head_only: bool,
    ) {
        match fs::metadata(&script) {
            Ok(metadata) if metadata.is_file() => {}
            _ => {
                self.queue_answer(key, DefaultAnswer::Answer404 {}, false);
                return;
            }
        }

        let stdin_token = self.alloc_token();
        let stdout_token = self.alloc_token();
        let mut cgi = match CgiSession::spawn(
            &interpreter,
            &script,
            env,
            request.body,
            Duration::from_secs(self.config.cgi_timeout),
            key,
            stdin_token,
            stdout_token,
        ) {
            Ok(cgi) => cgi,
            Err(error) => {
                error!("could not spawn {}: {error}", interpreter.display());
                self.queue_answer(key, DefaultAnswer::Answer500 {}, true);
                return;
            }
        };
        cgi.head_only = head_only;
        cgi.http10 = request.version == Version::V10;

        let registered = cgi
            .stdin_fd()
            .map(|fd| self.poller.register_fd(fd, stdin_token, Interest::WRITABLE))
            .unwrap_or(Ok(()))
            .and_then(|_| {
                cgi.stdout_fd()
                    .map(|fd| self.poller.register_fd(fd, stdout_token, Interest::READABLE))
                    .unwrap_or(Ok(()))
            });
        if let Err(error) = registered {
            error!("could not register cgi pipes: {error}");
            cgi.kill_and_reap();
            self.queue_answer(key, DefaultAnswer::Answer500 {}, true);
            return;
        }

        debug!("spawned cgi pid {} for session {key}", cgi.pid());
        // write attempts start on this pass, pipes report an initial edge
        cgi.stdin_readiness.event.insert(Ready::WRITABLE);

        let cgi_key = self.cgis.insert(cgi);
        self.tokens.insert(stdin_token, TokenKind::CgiStdin(cgi_key));
        self.tokens
            .insert(stdout_token, TokenKind::CgiStdout(cgi_key));
        if let Some(session) = self.sessions.get_mut(key) {
            session.cgi = Some(cgi_key);
        }
        self.pump_cgi(cgi_key);
    }

    /// Move bytes between the CGI pipes and the owning session. Returns
    /// true when session-visible work happened (head or body queued, or the
    /// session finished), so the caller re-drives the session.
    fn pump_cgi(&mut self, cgi_key: usize) -> bool {
        let cgi = match self.cgis.get_mut(cgi_key) {
            Some(cgi) => cgi,
            None => return false,
        };
        let owner = cgi.owner;
        let mut progress = false;

        // input direction
        if cgi.stdin_readiness.event.is_hup() || cgi.stdin_readiness.event.is_error() {
            // the child closed its stdin early; remaining input is dropped
            if let Some(fd) = cgi.stdin_fd() {
                let _ = self.poller.deregister_fd(fd);
                self.tokens.remove(&cgi.stdin_token);
                cgi.close_stdin();
            }
        } else if cgi.stdin_readiness.filter_interest().is_writable() {
            cgi.writable();
            if cgi.input_finished() {
                if let Some(fd) = cgi.stdin_fd() {
                    let _ = self.poller.deregister_fd(fd);
                }
                self.tokens.remove(&cgi.stdin_token);
                cgi.close_stdin();
            }
        }

        // output direction, paused while the owner's backlog is high
        let backlog = self
            .sessions
            .get(owner)
            .map(|session| session.write_backlog())
            .unwrap_or(0);
        if backlog > WRITE_BACKPRESSURE {
            cgi.stdout_readiness.interest.remove(Ready::READABLE);
        } else {
            cgi.stdout_readiness.interest.insert(Ready::READABLE);
        }
        if cgi.stdout_readiness.filter_interest().is_readable()
            || cgi.stdout_readiness.event.is_hup()
        {
            cgi.readable();
        }

        // forward the head once it parses
        if let Some(head) = cgi.poll_head() {
            let mut response = Response::new(head.status);
            response.reason = head.reason.clone();
            for (name, value) in head.headers.iter() {
                if name.eq_ignore_ascii_case("connection")
                    || name.eq_ignore_ascii_case("transfer-encoding")
                {
                    continue;
                }
                response.headers.insert(name, value);
            }
            let chunked = cgi.chunked && !cgi.head_only && !cgi.http10;
            if cgi.chunked && cgi.http10 {
                // close-delimited body for HTTP/1.0 clients
                cgi.chunked = false;
                if let Some(session) = self.sessions.get_mut(owner) {
                    session.set_close_after();
                }
            } else {
                cgi.chunked = chunked;
            }
            response.body = BodySource::CgiStream { chunked };
            cgi.head_sent = true;
            let head_only = cgi.head_only;
            if let Some(session) = self.sessions.get_mut(owner) {
                session.queue_response(response, head_only);
            }
            progress = true;
        }

        // forward or discard body bytes
        let cgi = match self.cgis.get_mut(cgi_key) {
            Some(cgi) => cgi,
            None => return progress,
        };
        if cgi.head_sent {
            let bytes = cgi.take_body();
            if !bytes.is_empty() && !cgi.head_only {
                if let Some(session) = self.sessions.get_mut(cgi.owner) {
                    session.queue_cgi_bytes(&bytes);
                }
                progress = true;
            }
        }

        let cgi = match self.cgis.get_mut(cgi_key) {
            Some(cgi) => cgi,
            None => return progress,
        };
        cgi.check_completion();
        if cgi.is_terminal() {
            self.finalize_cgi(cgi_key);
            return true;
        }
        progress
    }

    /// Consume a CGI session that reached a terminal state.
    fn finalize_cgi(&mut self, cgi_key: usize) {
        let (owner, state, head_sent) = match self.cgis.get(cgi_key) {
            Some(cgi) => (cgi.owner, cgi.state, cgi.head_sent),
            None => return,
        };
        self.destroy_cgi(cgi_key, state != CgiState::Done);
        if let Some(session) = self.sessions.get_mut(owner) {
            session.cgi = None;
        }

        match state {
            CgiState::Done => {
                if let Some(session) = self.sessions.get_mut(owner) {
                    session.finish_cgi_response();
                }
            }
            CgiState::TimedOut => {
                if head_sent {
                    // the head is on the wire, the truncated stream cannot
                    // be repaired
                    self.close_session(owner);
                } else {
                    let duration = format!("{}s", self.config.cgi_timeout);
                    self.queue_answer(owner, DefaultAnswer::Answer504 { duration }, true);
                }
            }
            CgiState::Failed => {
                if head_sent {
                    self.close_session(owner);
                } else {
                    self.queue_answer(
                        owner,
                        DefaultAnswer::Answer502 {
                            message: "the gateway process produced no valid output".to_string(),
                        },
                        true,
                    );
                }
            }
            CgiState::WritingInput | CgiState::DrainingOutput => unreachable!(),
        }
    }

    /// Kill (when asked), reap and unregister a CGI session.
    fn destroy_cgi(&mut self, cgi_key: usize, kill: bool) {
        let mut cgi = match self.cgis.try_remove(cgi_key) {
            Some(cgi) => cgi,
            None => return,
        };
        if kill {
            cgi.kill_and_reap();
        } else {
            cgi.try_reap();
        }
        if let Some(fd) = cgi.stdin_fd() {
            let _ = self.poller.deregister_fd(fd);
        }
        if let Some(fd) = cgi.stdout_fd() {
            let _ = self.poller.deregister_fd(fd);
        }
        self.tokens.remove(&cgi.stdin_token);
        self.tokens.remove(&cgi.stdout_token);
    }

    /// Closing an already-released session is a no-op.
    fn close_session(&mut self, key: usize) {
        let mut session = match self.sessions.try_remove(key) {
            Some(session) => session,
            None => return,
        };
        trace!("closing session {key} ({})", session.peer);
        self.tokens.remove(&session.token);
        let _ = self.poller.deregister(session.socket_mut());

        // a client going away mid-CGI must not orphan the subprocess
        if let Some(cgi_key) = session.cgi {
            self.destroy_cgi(cgi_key, true);
        }
        session.close();
        drop(session);

        if !self.accepting {
            self.resume_accepting();
        }
    }

    /// Periodic pass over deadlines: overdue CGI subprocesses are killed
    /// and substituted, idle connections answered with 408 or closed.
    fn sweep(&mut self) {
        let now = Instant::now();

        let cgi_keys: Vec<usize> = self.cgis.iter().map(|(key, _)| key).collect();
        for cgi_key in cgi_keys {
            let owner = {
                let cgi = match self.cgis.get_mut(cgi_key) {
                    Some(cgi) => cgi,
                    None => continue,
                };
                if cgi.deadline.is_expired(now) && !cgi.is_terminal() {
                    warn!("cgi pid {} exceeded its deadline", cgi.pid());
                    cgi.deadline.triggered();
                    cgi.kill_and_reap();
                    cgi.state = CgiState::TimedOut;
                } else {
                    cgi.try_reap();
                    cgi.check_completion();
                }
                if cgi.is_terminal() {
                    Some(cgi.owner)
                } else {
                    None
                }
            };
            if let Some(owner) = owner {
                self.finalize_cgi(cgi_key);
                self.run_session(owner);
            }
        }

        let session_keys: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in session_keys {
            let expired = match self.sessions.get(key) {
                Some(session) => session.cgi.is_none() && session.idle_timeout.is_expired(now),
                None => continue,
            };
            if !expired {
                continue;
            }
            let answer_408 = self
                .sessions
                .get(key)
                .map(|session| session.deserves_request_timeout_answer())
                .unwrap_or(false);
            if answer_408 {
                debug!("session {key} timed out waiting for a request");
                if let Some(session) = self.sessions.get_mut(key) {
                    session.idle_timeout.cancel();
                }
                let duration = format!("{}s", self.config.idle_timeout);
                self.queue_answer(key, DefaultAnswer::Answer408 { duration }, true);
                self.run_session(key);
            } else {
                debug!("closing idle session {key}");
                self.close_session(key);
            }
        }
    }

    fn begin_shutdown(&mut self) {
        info!(
            "shutdown requested, draining {} sessions for {}s",
            self.sessions.len(),
            self.config.shutdown_grace
        );
        self.drain_deadline =
            Some(Instant::now() + Duration::from_secs(self.config.shutdown_grace));
        // stop accepting for good; resume_accepting refuses while draining
        self.accepting = true;
        self.pause_accepting();

        let keys: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in keys {
            let idle = match self.sessions.get_mut(key) {
                Some(session) => session.shutting_down(),
                None => continue,
            };
            if idle {
                self.close_session(key);
            }
        }
    }
}

fn bind_listener(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(address),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// EPIPE on a pipe or socket write must surface as an error, not kill the
/// process.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        if let Err(error) = signal(Signal::SIGPIPE, SigHandler::SigIgn) {
            warn!("could not ignore SIGPIPE: {error}");
        }
    });
}

fn decision_label(decision: &RouteDecision) -> &'static str {
    match decision {
        RouteDecision::ServeStatic { .. } => "static",
        RouteDecision::InvokeCgi { .. } => "cgi",
        RouteDecision::Upload { .. } => "upload",
        RouteDecision::Delete { .. } => "delete",
        RouteDecision::Redirect { .. } => "redirect",
        RouteDecision::Error { .. } => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::parse(
            r#"
            [[server]]
            listen = "127.0.0.1:0"
            [[server.route]]
            path = "/"
            root = "www"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn binds_and_reports_addresses() {
        let server = Server::new(test_config()).unwrap();
        let addrs = server.listen_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
    }

    #[test]
    fn closing_an_unknown_session_is_a_noop() {
        let mut server = Server::new(test_config()).unwrap();
        server.close_session(42);
        server.close_session(42);
        assert!(server.sessions.is_empty());
    }

    #[test]
    fn tokens_are_never_reused() {
        let mut server = Server::new(test_config()).unwrap();
        let first = server.alloc_token();
        let second = server.alloc_token();
        assert_ne!(first, second);
        assert!(second.0 > first.0);
    }

    #[test]
    fn next_timeout_is_bounded() {
        let server = Server::new(test_config()).unwrap();
        let timeout = server.next_timeout();
        assert!(timeout >= Duration::from_millis(10));
        assert!(timeout <= Duration::from_millis(500));
    }
}
