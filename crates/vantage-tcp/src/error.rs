//! Error types for the TCP core.
//!
//! The accept loop distinguishes two failure classes: a [`Error::Socket`]
//! describes a single failed accept and is logged without stopping the
//! loop, while a [`Error::Server`] means the listening socket itself is
//! unusable and terminates the loop. Everything else surfaces at the
//! operation that caused it.

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the listener, reactor and transport layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A single accept failed; the accept loop continues.
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    /// The listening socket is invalid; further accepts are meaningless.
    #[error("server error: {0}")]
    Server(#[source] io::Error),

    /// Every resolved candidate address failed to bind; carries the last
    /// system error.
    #[error("could not bind any resolved address: {0}")]
    Bind(#[source] io::Error),

    /// `poll` failed for a reason other than an intentional interruption.
    #[error("polling failed: {0}")]
    Poll(#[source] io::Error),

    /// An I/O error outside the accept path (socket setup, registration).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `bind` was called without a handler.
    #[error("no handler set, call set_handler() before bind()")]
    MissingHandler,

    /// The operation requires a bound listener.
    #[error("listener is not bound, call bind() first")]
    NotBound,

    /// `bind` was called on an already bound listener, or a notifier was
    /// bound twice.
    #[error("already bound")]
    AlreadyBound,

    /// Configuration methods cannot be used once the accept thread runs.
    #[error("listener is running, configuration is frozen")]
    Running,

    /// `Reactor::init` was called twice, or `add_handler` outside the
    /// window between `init` and `run`.
    #[error("reactor is not configurable in this state")]
    ReactorConfig,

    /// Installing the process-wide interrupt handler failed.
    #[error("could not install signal handler: {0}")]
    SignalHandler(#[source] io::Error),

    /// A worker failed to answer a load sample.
    #[error("worker load sampling failed: {0}")]
    Load(#[source] io::Error),

    /// The worker pool needs at least one worker.
    #[error("worker count must be at least one")]
    NoWorkers,

    /// A worker index outside the pool was named.
    #[error("invalid worker index {0}")]
    InvalidWorker(usize),

    /// The accept thread panicked before reporting a result.
    #[error("accept thread panicked")]
    AcceptThread,
}

impl Error {
    /// True for errors the accept loop survives.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Socket(_))
    }
}
