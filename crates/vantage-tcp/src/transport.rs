//! Per-worker transport handler.
//!
//! A [`Transport`] is the handler kind this core registers with the
//! reactor: one instance per worker, all sharing the upstream
//! [`ConnectionHandler`]. The accept thread hands peers over through
//! [`Transport::handle_new_peer`] and samples CPU usage through
//! [`Transport::load`]; both enqueue a command on the instance's channel
//! and wake its worker, so the accept thread never blocks and resource
//! usage is always read on the thread that owns it.
//!
//! Anything past hand-off (reading requests, writing responses, peer
//! teardown) belongs to the layers above this crate.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::load::ResourceUsage;
use crate::peer::Peer;
use crate::poller::{Event, EventFd, Interest, Poller, Tag};
use crate::reactor::{HandlerKey, WorkerHandler};

/// Upstream connection handler supplied by the framework layers above.
///
/// Shared by every transport instance; callbacks run on the worker that
/// owns the peer.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A dispatched peer has arrived on its owning worker.
    fn on_connection(&self, peer: &Peer);
}

enum Command {
    Peer(Peer),
    SampleLoad(Sender<io::Result<ResourceUsage>>),
}

/// A pending [`ResourceUsage`] reply from one worker.
///
/// Returned by [`Transport::load`]; resolves once the owning worker has
/// taken the snapshot on its own thread.
#[derive(Debug)]
pub struct LoadFuture {
    reply: Receiver<io::Result<ResourceUsage>>,
}

impl LoadFuture {
    /// Blocks until the worker answers. Fails if the worker is gone or
    /// the usage query failed.
    pub fn wait(self) -> Result<ResourceUsage> {
        match self.reply.recv() {
            Ok(Ok(usage)) => Ok(usage),
            Ok(Err(err)) => Err(Error::Load(err)),
            Err(_) => Err(Error::Load(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker exited before answering",
            ))),
        }
    }
}

/// Per-worker I/O handler owned by the reactor.
pub struct Transport {
    handler: Arc<dyn ConnectionHandler>,
    worker: usize,
    wake: EventFd,
    tx: Sender<Command>,
    rx: Receiver<Command>,
    peers: Mutex<HashMap<RawFd, Peer>>,
}

impl Transport {
    /// Creates the template instance the reactor clones per worker.
    pub fn new(handler: Arc<dyn ConnectionHandler>) -> io::Result<Self> {
        Self::for_worker(handler, 0)
    }

    fn for_worker(handler: Arc<dyn ConnectionHandler>, worker: usize) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        Ok(Self {
            handler,
            worker,
            wake: EventFd::new()?,
            tx,
            rx,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Index of the worker this instance belongs to.
    #[must_use]
    pub fn worker_index(&self) -> usize {
        self.worker
    }

    /// Takes ownership of a peer and schedules it on this instance's
    /// worker. Never blocks the caller.
    pub fn handle_new_peer(&self, peer: Peer) {
        if self.tx.send(Command::Peer(peer)).is_err() {
            tracing::warn!(worker = self.worker, "dropping peer, transport queue is closed");
            return;
        }
        self.wake.notify();
    }

    /// Asks the owning worker for its cumulative CPU usage.
    #[must_use]
    pub fn load(&self) -> LoadFuture {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(Command::SampleLoad(reply_tx)).is_ok() {
            self.wake.notify();
        }
        // A failed send leaves the reply sender dropped and the future
        // resolves to a worker-gone error.
        LoadFuture { reply: reply_rx }
    }

    /// Peers currently owned by this instance.
    #[must_use]
    pub fn active_peers(&self) -> usize {
        self.peers.lock().len()
    }

    /// Commands handed off but not yet drained by the worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

impl WorkerHandler for Transport {
    fn clone_for_worker(&self, worker: usize) -> Result<Arc<dyn WorkerHandler>> {
        Ok(Arc::new(Self::for_worker(Arc::clone(&self.handler), worker)?))
    }

    fn register(&self, poller: &Poller, key: HandlerKey) -> Result<()> {
        poller.add(
            self.wake.as_raw_fd(),
            Interest::READ,
            Tag::for_handler(key.index(), self.wake.as_raw_fd()),
        )?;
        Ok(())
    }

    fn on_ready(&self, _event: &Event) {
        self.wake.drain();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Peer(peer) => {
                    tracing::trace!(worker = self.worker, peer = %peer, "peer delivered");
                    self.handler.on_connection(&peer);
                    self.peers.lock().insert(peer.fd(), peer);
                }
                Command::SampleLoad(reply) => {
                    let _ = reply.send(ResourceUsage::for_current_thread());
                }
            }
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        connections: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connections: AtomicUsize::new(0),
            })
        }
    }

    impl ConnectionHandler for CountingHandler {
        fn on_connection(&self, _peer: &Peer) {
            self.connections.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_peer() -> Peer {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        let addr: SocketAddr = "127.0.0.1:9999".parse().expect("addr");
        Peer::new(addr, fd)
    }

    fn ready_event(transport: &Transport) -> Event {
        Event {
            tag: Tag::for_handler(0, transport.wake.as_raw_fd()),
            readiness: Interest::READ,
        }
    }

    #[test]
    fn peers_queue_until_the_worker_drains() {
        let handler = CountingHandler::new();
        let transport = Transport::new(handler.clone()).expect("transport");

        transport.handle_new_peer(test_peer());
        transport.handle_new_peer(test_peer());
        assert_eq!(transport.pending(), 2);
        assert_eq!(transport.active_peers(), 0);

        let event = ready_event(&transport);
        transport.on_ready(&event);
        assert_eq!(transport.pending(), 0);
        assert_eq!(transport.active_peers(), 2);
        assert_eq!(handler.connections.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn load_replies_with_thread_usage() {
        let transport = Transport::new(CountingHandler::new()).expect("transport");
        let future = transport.load();

        let event = ready_event(&transport);
        transport.on_ready(&event);

        let usage = future.wait().expect("usage");
        assert!(usage.user() + usage.system() < std::time::Duration::from_secs(3600));
    }

    #[test]
    fn clones_share_the_upstream_handler() {
        let handler = CountingHandler::new();
        let template = Transport::new(handler.clone()).expect("transport");
        let clone = template.clone_for_worker(3).expect("clone");

        let clone = clone
            .as_any()
            .downcast::<Transport>()
            .expect("transport kind");
        assert_eq!(clone.worker_index(), 3);

        clone.handle_new_peer(test_peer());
        let event = ready_event(&clone);
        clone.on_ready(&event);
        assert_eq!(handler.connections.load(Ordering::SeqCst), 1);
    }
}
