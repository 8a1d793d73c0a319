//! TCP listener: bind, accept, dispatch.
//!
//! The [`Listener`] owns the listening socket and the reactor lifecycle.
//! Its accept loop is single-threaded, on either the caller's thread
//! ([`run`](Listener::run)) or a dedicated one
//! ([`run_threaded`](Listener::run_threaded)), and blocks only in
//! `poll`. Accepted peers are wrapped and fanned out across the worker
//! pool by `fd % N`; shutdown arrives either through the
//! [`ShutdownNotifier`](crate::ShutdownNotifier) or, when
//! [`Options::INSTALL_SIGNAL_HANDLER`] is set, through a SIGINT handler
//! that closes the listen socket and clears a process-global sentinel.
//!
//! ```ignore
//! use std::sync::Arc;
//! use vantage_tcp::{Address, Listener, Options, MAX_BACKLOG};
//!
//! let mut listener = Listener::with_address(Address::localhost(0));
//! listener.init(4, Options::REUSE_ADDR, MAX_BACKLOG)?;
//! listener.set_handler(Arc::new(MyHandler))?;
//! listener.bind()?;
//!
//! let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
//! listener.run_threaded(ready_tx)?;
//! ready_rx.recv()?;
//! println!("listening on port {}", listener.get_port());
//! ```

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::addr::Address;
use crate::error::{Error, Result};
use crate::load::Load;
use crate::notifier::ShutdownNotifier;
use crate::options::{apply_socket_options, Options};
use crate::peer::Peer;
use crate::poller::{Interest, Poller, Tag, POLL_BATCH};
use crate::reactor::{CpuSet, HandlerKey, Reactor, WorkerHandler};
use crate::transport::{ConnectionHandler, Transport};
use crate::{default_workers, MAX_BACKLOG};

/// Process-global mirror of the listen descriptor, shared with the SIGINT
/// handler. `-1` means no live listen socket. When several listeners
/// coexist the sentinel tracks the most recent bind.
static GLOBAL_LISTEN_FD: AtomicI32 = AtomicI32::new(-1);

/// Closes the sentinel descriptor. Runs in async-signal context, so it is
/// limited to a lock-free swap and a `close(2)`.
extern "C" fn handle_sigint(_signum: libc::c_int) {
    let fd = GLOBAL_LISTEN_FD.swap(-1, Ordering::AcqRel);
    if fd != -1 {
        unsafe { libc::close(fd) };
    }
}

fn install_signal_handler() -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handle_sigint as libc::sighandler_t;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    // No SA_RESTART: the accept loop relies on observing EINTR to notice
    // that the sentinel was cleared.
    action.sa_flags = 0;
    let rc = unsafe { libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Worker index an accepted descriptor is dispatched to.
fn dispatch_index(fd: RawFd, worker_count: usize) -> usize {
    fd as usize % worker_count
}

fn socket_addr_from_storage(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let v4 = unsafe { &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(v4.sin_port)))
        }
        libc::AF_INET6 => {
            let v6 = unsafe { &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(v6.sin6_port)))
        }
        _ => None,
    }
}

struct Inner {
    addr: Address,
    backlog: i32,
    workers: usize,
    options: Options,
    handler: Option<Arc<dyn ConnectionHandler>>,
    poller: Option<Poller>,
    notifier: ShutdownNotifier,
    reactor: Reactor,
    transport_key: Option<HandlerKey>,
    listen_fd: AtomicI32,
    shutting_down: AtomicBool,
}

impl Inner {
    fn is_bound(&self) -> bool {
        self.listen_fd.load(Ordering::Acquire) != -1
    }

    fn run_loop(&self, ready: &Sender<()>) -> Result<()> {
        let poller = self.poller.as_ref().ok_or(Error::NotBound)?;
        self.notifier.bind(poller)?;
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(());
        }
        self.reactor.run()?;
        let _ = ready.send(());

        let mut events = Vec::with_capacity(POLL_BATCH);
        loop {
            match poller.poll(&mut events, POLL_BATCH, None) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if GLOBAL_LISTEN_FD.load(Ordering::Acquire) == -1 {
                        // The signal handler closed the listen socket;
                        // this is our own cancellation, not a failure.
                        self.listen_fd.store(-1, Ordering::Release);
                        return Ok(());
                    }
                    return Err(Error::Poll(err));
                }
                Err(err) => return Err(Error::Poll(err)),
            }

            // The batch may pair accept readiness with the stop signal;
            // stop wins, the socket is about to close anyway.
            if events.iter().any(|event| event.tag == self.notifier.tag()) {
                return Ok(());
            }

            let listen_tag = Tag::from_fd(self.listen_fd.load(Ordering::Acquire));
            for event in &events {
                if event.tag != listen_tag || !event.is_readable() {
                    continue;
                }
                match self.handle_new_connection() {
                    Ok(()) => {}
                    Err(err @ Error::Socket(_)) => {
                        tracing::error!(error = %err, "accept failed");
                    }
                    Err(err) => {
                        if !self.is_bound() {
                            // shutdown() closed the socket while the
                            // event was in flight.
                            return Ok(());
                        }
                        tracing::error!(error = %err, "listener failed");
                        return Err(err);
                    }
                }
            }
        }
    }

    fn handle_new_connection(&self) -> Result<()> {
        let listen_fd = self.listen_fd.load(Ordering::Acquire);
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client = unsafe {
            libc::accept4(
                listen_fd,
                std::ptr::addr_of_mut!(storage).cast(),
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if client < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EBADF | libc::ENOTSOCK) => Error::Server(err),
                _ => Error::Socket(err),
            });
        }

        let addr = socket_addr_from_storage(&storage)
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let peer = Peer::new(addr, client);
        tracing::debug!(peer = %peer, "accepted connection");
        self.dispatch_peer(peer)
    }

    fn dispatch_peer(&self, peer: Peer) -> Result<()> {
        let key = self.transport_key.ok_or(Error::NotBound)?;
        let handlers = self.reactor.handlers(key);
        if handlers.is_empty() {
            return Err(Error::NotBound);
        }
        let index = dispatch_index(peer.fd(), handlers.len());
        let transport = Arc::clone(&handlers[index])
            .as_any()
            .downcast::<Transport>()
            .map_err(|_| {
                Error::Server(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unexpected handler kind under the transport key",
                ))
            })?;
        transport.handle_new_peer(peer);
        Ok(())
    }
}

/// Owns the listening socket, its configuration, and the reactor
/// lifecycle.
///
/// A listener is not reusable: once shut down (or closed by the signal
/// handler), rebinding requires a fresh instance.
pub struct Listener {
    inner: Arc<Inner>,
    accept_thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Listener {
    /// An unbound listener on the default (loopback, ephemeral-port)
    /// address.
    #[must_use]
    pub fn new() -> Self {
        Self::with_address(Address::default())
    }

    /// An unbound listener that will bind to `addr`.
    #[must_use]
    pub fn with_address(addr: Address) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr,
                backlog: MAX_BACKLOG,
                workers: default_workers(),
                options: Options::empty(),
                handler: None,
                poller: None,
                notifier: ShutdownNotifier::new(),
                reactor: Reactor::new(),
                transport_key: None,
                listen_fd: AtomicI32::new(-1),
                shutting_down: AtomicBool::new(false),
            }),
            accept_thread: Mutex::new(None),
        }
    }

    fn inner_mut(&mut self) -> Result<&mut Inner> {
        Arc::get_mut(&mut self.inner).ok_or(Error::Running)
    }

    /// Overwrites worker count, options and backlog. Must be called
    /// before [`bind`](Listener::bind). Installing the signal handler is
    /// fallible and reported here.
    pub fn init(&mut self, workers: usize, options: Options, backlog: i32) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.is_bound() {
            return Err(Error::AlreadyBound);
        }
        if workers == 0 {
            return Err(Error::NoWorkers);
        }
        let cores = num_cpus::get();
        if workers > cores {
            tracing::warn!(workers, cores, "more workers than available cores");
        }
        if options.contains(Options::INSTALL_SIGNAL_HANDLER) {
            install_signal_handler().map_err(Error::SignalHandler)?;
        }
        inner.workers = workers;
        inner.options = options;
        inner.backlog = backlog;
        Ok(())
    }

    /// Stores the upstream connection handler shared by every transport
    /// instance.
    pub fn set_handler(&mut self, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        self.inner_mut()?.handler = Some(handler);
        Ok(())
    }

    /// Binds to the address supplied at construction.
    pub fn bind(&mut self) -> Result<()> {
        let addr = self.inner.addr.clone();
        self.bind_to(addr)
    }

    /// Resolves `addr` and binds the first candidate that accepts a
    /// `bind` + `listen`, then initializes the worker pool and registers
    /// the transport kind.
    pub fn bind_to(&mut self, addr: Address) -> Result<()> {
        let inner = self.inner_mut()?;
        if inner.is_bound() {
            return Err(Error::AlreadyBound);
        }
        let handler = inner.handler.clone().ok_or(Error::MissingHandler)?;

        let candidates = addr.resolve().map_err(Error::Bind)?;
        let mut last_err: Option<io::Error> = None;
        let mut bound: Option<Socket> = None;
        for candidate in candidates {
            let domain = if candidate.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
                Ok(socket) => socket,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            apply_socket_options(&socket, inner.options)?;
            if let Err(err) = socket.bind(&candidate.into()) {
                last_err = Some(err);
                continue;
            }
            // A listen failure on a bound socket is not a candidate
            // problem; it aborts the whole bind.
            socket.listen(inner.backlog)?;
            bound = Some(socket);
            break;
        }
        let socket = match bound {
            Some(socket) => socket,
            None => {
                let err = last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address candidate")
                });
                return Err(Error::Bind(err));
            }
        };

        socket.set_nonblocking(true)?;
        let poller = Poller::new()?;
        poller.add(
            socket.as_raw_fd(),
            Interest::READ,
            Tag::from_fd(socket.as_raw_fd()),
        )?;
        inner.reactor.init(inner.workers)?;
        let transport = Transport::new(handler)?;
        let key = inner.reactor.add_handler(&transport)?;

        // Every fallible step is behind us; only now does the listener
        // become bound, so a failed bind never leaves it half-bound.
        inner.transport_key = Some(key);
        inner.poller = Some(poller);
        let fd = socket.into_raw_fd();
        inner.listen_fd.store(fd, Ordering::Release);
        GLOBAL_LISTEN_FD.store(fd, Ordering::Release);
        inner.addr = addr;
        tracing::debug!(addr = %inner.addr, workers = inner.workers, "listener bound");
        Ok(())
    }

    /// True once `bind` has succeeded and until `shutdown` (or the signal
    /// handler) closes the socket.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.inner.is_bound()
    }

    /// The kernel-assigned port, or `0` when unbound. Only meaningful
    /// from a thread other than the one running the accept loop, since
    /// `run` does not return until shutdown.
    #[must_use]
    pub fn get_port(&self) -> u16 {
        let fd = self.inner.listen_fd.load(Ordering::Acquire);
        if fd == -1 {
            return 0;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        socket2::SockRef::from(&borrowed)
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .map_or(0, |addr| addr.port())
    }

    /// The configured address (not the resolved candidate).
    #[must_use]
    pub fn address(&self) -> Address {
        self.inner.addr.clone()
    }

    #[must_use]
    pub fn options(&self) -> Options {
        self.inner.options
    }

    /// Runs the accept loop on the calling thread until shutdown. `ready`
    /// is fulfilled once the reactor is running and the loop is about to
    /// poll.
    pub fn run(&self, ready: Sender<()>) -> Result<()> {
        self.inner.run_loop(&ready)
    }

    /// Runs the accept loop on a dedicated thread; the join handle is
    /// kept and joined on drop (or through [`join`](Listener::join)).
    pub fn run_threaded(&self, ready: Sender<()>) -> Result<()> {
        let mut slot = self.accept_thread.lock();
        if slot.is_some() {
            return Err(Error::Running);
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("vantage-accept".into())
            .spawn(move || inner.run_loop(&ready))
            .map_err(Error::Io)?;
        *slot = Some(handle);
        Ok(())
    }

    /// Joins the accept thread, if any, and returns the accept loop's
    /// result.
    pub fn join(&self) -> Result<()> {
        let handle = self.accept_thread.lock().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| Error::AcceptThread)?,
            None => Ok(()),
        }
    }

    /// Wakes the accept loop, stops the reactor, and closes the listen
    /// socket. Idempotent; the listener is not reusable afterwards.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        if self.inner.notifier.is_bound() {
            self.inner.notifier.notify();
        }
        self.inner.reactor.shutdown();

        let fd = self.inner.listen_fd.swap(-1, Ordering::AcqRel);
        if fd != -1 {
            match GLOBAL_LISTEN_FD.compare_exchange(fd, -1, Ordering::AcqRel, Ordering::Acquire) {
                // The signal handler got there first and closed it.
                Err(-1) => {}
                // Either we still own the sentinel, or a later bind took
                // it over; our descriptor is ours to close either way.
                _ => {
                    unsafe { libc::close(fd) };
                }
            }
        }
    }

    /// Samples per-worker CPU usage against `previous` and derives
    /// utilization percentages. The first sample (empty `previous`)
    /// reports zeros.
    pub fn request_load(&self, previous: &Load) -> Result<Load> {
        let key = self.inner.transport_key.ok_or(Error::NotBound)?;
        let handlers = self.inner.reactor.handlers(key);

        let mut pending = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let transport = handler.as_any().downcast::<Transport>().map_err(|_| {
                Error::Server(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unexpected handler kind under the transport key",
                ))
            })?;
            pending.push(transport.load());
        }

        let mut usages = Vec::with_capacity(pending.len());
        for future in pending {
            usages.push(future.wait()?);
        }
        Ok(Load::next(previous, usages, Instant::now()))
    }

    /// Reserved: per-worker CPU affinity. Validates the worker index and
    /// otherwise does nothing yet.
    pub fn pin_worker(&self, worker: usize, _cpus: &CpuSet) -> Result<()> {
        let count = self.inner.reactor.worker_count();
        if count == 0 {
            return Err(Error::NotBound);
        }
        if worker >= count {
            return Err(Error::InvalidWorker(worker));
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.is_bound() {
            self.shutdown();
        }
        if let Err(err) = self.join() {
            tracing::error!(error = %err, "accept loop exited with an error");
        }
    }
}
