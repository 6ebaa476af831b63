//! # kiln
//!
//! kiln is a persistent, single-process HTTP/1.1 server. It serves many
//! concurrent clients from one event loop, without a thread or process per
//! connection, streams static resources from disk and delegates dynamic
//! content to CGI interpreter subprocesses over non-blocking pipes.
//!
//! The engine is built around three pieces:
//!
//! - a readiness multiplexer ([`poller::Poller`]) wrapping `mio::Poll`,
//! - per-client session state machines ([`session::HttpSession`]) driving a
//!   resumable request parser and a buffered response writer,
//! - CGI subprocess sessions ([`cgi::CgiSession`]) whose stdin/stdout pipes
//!   are registered in the same multiplexer as ordinary descriptors, so
//!   input writing and output draining interleave freely and never deadlock
//!   on a full pipe buffer.
//!
//! The [`server::Server`] owns the registry mapping tokens to all of the
//! above, enforces the connection cap, sweeps timeouts and reaps children.

pub mod answers;
pub mod cgi;
pub mod config;
pub mod files;
pub mod http;
pub mod poller;
pub mod ready;
pub mod router;
pub mod server;
pub mod session;
pub mod timer;

/// What a session asks of the event loop after consuming its readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    /// the session wants to keep running on future events
    Continue,
    /// a complete request was parsed and awaits a routing decision
    Dispatch,
    /// the session is done or broken and must be closed and unregistered
    Close,
}

/// Bound on the inner event consumption loop of a session, to catch
/// interest/event bookkeeping bugs instead of spinning forever.
pub(crate) const MAX_LOOP_ITERATIONS: usize = 100_000;
