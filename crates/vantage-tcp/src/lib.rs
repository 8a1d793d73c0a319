//! TCP connection acceptance and dispatch core for the vantage framework.
//!
//! This crate is the seam between the operating system and the HTTP
//! layers above it: it binds the listening socket, accepts client
//! connections on a single-threaded accept loop, and fans them out
//! across a fixed pool of I/O worker reactors. Parsing, routing and
//! request handling live in other crates; they reach this one through
//! the [`ConnectionHandler`] trait.
//!
//! # Architecture
//!
//! ```text
//! Listener (accept loop, one thread)
//! ├── Poller          epoll facade; listen socket + shutdown notifier
//! ├── ShutdownNotifier eventfd wakeup for graceful stop
//! └── Reactor          N workers, one event-loop thread each
//!     ├── Transport #0  ← peers with fd % N == 0
//!     ├── Transport #1  ← peers with fd % N == 1
//!     └── ...           (all sharing one ConnectionHandler)
//! ```
//!
//! Peers are dispatched by `fd % N`: cheap, stateless, and even enough
//! in practice because the kernel recycles descriptor numbers over a
//! compact range. Each worker owns its peers exclusively; per-worker CPU
//! usage is sampled on the worker's own thread and aggregated by
//! [`Listener::request_load`].
//!
//! Linux-only: the implementation leans on epoll, eventfd and
//! `RUSAGE_THREAD`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vantage_tcp::{Address, ConnectionHandler, Listener, Options, Peer, MAX_BACKLOG};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_connection(&self, peer: &Peer) {
//!         println!("connected: {peer}");
//!     }
//! }
//!
//! let mut listener = Listener::with_address(Address::new("0.0.0.0", 8080));
//! listener.init(4, Options::REUSE_ADDR | Options::NO_DELAY, MAX_BACKLOG)?;
//! listener.set_handler(Arc::new(Echo))?;
//! listener.bind()?;
//!
//! let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
//! listener.run_threaded(ready_tx)?;
//! ready_rx.recv()?;
//! ```

// Pedantic clippy lints allowed (style suggestions, not correctness issues)
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod addr;
mod error;
mod listener;
mod load;
mod notifier;
mod options;
mod peer;
mod poller;
mod reactor;
mod transport;

pub use addr::{Address, Family};
pub use error::{Error, Result};
pub use listener::Listener;
pub use load::{Load, ResourceUsage};
pub use notifier::ShutdownNotifier;
pub use options::{Options, FAST_OPEN_QUEUE_LEN, LINGER_TIMEOUT};
pub use peer::Peer;
pub use poller::{Event, Interest, Poller, Tag, POLL_BATCH};
pub use reactor::{CpuSet, HandlerKey, Reactor, WorkerHandler};
pub use transport::{ConnectionHandler, LoadFuture, Transport};

/// Default kernel backlog for the listen socket.
pub const MAX_BACKLOG: i32 = 128;

/// Default worker count: the hardware concurrency of the host.
#[must_use]
pub fn default_workers() -> usize {
    num_cpus::get()
}
