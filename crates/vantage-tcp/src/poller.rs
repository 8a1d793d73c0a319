//! Readiness notification.
//!
//! [`Poller`] is a thin facade over level-triggered epoll: descriptors are
//! registered with an interest mask and an opaque 64-bit [`Tag`], and
//! [`Poller::poll`] yields `(tag, readiness)` pairs. The listener tags its
//! listen socket with the raw descriptor number; the reactor additionally
//! encodes the owning handler kind into the tag's upper bits so one worker
//! loop can route events to several handler kinds.
//!
//! `EINTR` deliberately surfaces as [`std::io::ErrorKind::Interrupted`]
//! instead of being retried here: the accept loop distinguishes its own
//! cancellation from stray interruptions and must see it.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;

/// Largest number of events a single `poll` call can yield.
pub const POLL_BATCH: usize = 128;

/// Upper bits of a [`Tag`] reserved for the reactor's handler-kind index.
const HANDLER_KEY_SHIFT: u32 = 56;

bitflags! {
    /// Readiness interests and reported readiness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Interest {
    fn epoll_bits(self) -> u32 {
        let mut bits = 0;
        if self.contains(Self::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Self::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn from_epoll_bits(bits: u32) -> Self {
        let mut interest = Self::empty();
        // Hangup and error conditions surface as readable so a blocked
        // accept loop wakes and observes the failure on the descriptor.
        if bits & (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            interest |= Self::READ;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            interest |= Self::WRITE;
        }
        interest
    }
}

/// Opaque value attached to a registration and returned with its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The conventional tag for a registration identified by its own
    /// descriptor.
    #[must_use]
    pub fn from_fd(fd: RawFd) -> Self {
        Self(fd as u64)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Tag for a descriptor owned by handler kind `key` on a reactor
    /// worker.
    pub(crate) fn for_handler(key: usize, fd: RawFd) -> Self {
        Self(((key as u64) << HANDLER_KEY_SHIFT) | fd as u64)
    }

    /// Handler-kind index encoded by [`Tag::for_handler`].
    pub(crate) fn handler_key(self) -> usize {
        (self.0 >> HANDLER_KEY_SHIFT) as usize
    }
}

/// One readiness record produced by [`Poller::poll`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub tag: Tag,
    pub readiness: Interest,
}

impl Event {
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.readiness.contains(Interest::READ)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.readiness.contains(Interest::WRITE)
    }
}

/// Level-triggered epoll instance.
#[derive(Debug)]
pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    /// Registers `fd`; subsequent events on it carry `tag`.
    pub fn add(&self, fd: RawFd, interest: Interest, tag: Tag) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.epoll_bits(),
            u64: tag.value(),
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deregisters `fd`.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        // The event argument is ignored for EPOLL_CTL_DEL on any kernel
        // this crate supports, but must be non-null before Linux 2.6.9.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks up to `timeout` (`None` blocks indefinitely) and fills
    /// `events` with up to `max_events` records, capped at [`POLL_BATCH`].
    ///
    /// Returns the number of records, `Ok(0)` on timeout, and an error of
    /// kind [`io::ErrorKind::Interrupted`] when a signal cut the wait
    /// short.
    pub fn poll(
        &self,
        events: &mut Vec<Event>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();
        let max = max_events.clamp(1, POLL_BATCH);
        let timeout_ms = timeout.map_or(-1, |t| {
            t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
        });

        let mut buf = [libc::epoll_event { events: 0, u64: 0 }; POLL_BATCH];
        let ready = unsafe {
            libc::epoll_wait(self.epoll_fd, buf.as_mut_ptr(), max as libc::c_int, timeout_ms)
        };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }

        for raw in &buf[..ready as usize] {
            let bits = raw.events;
            let tag = raw.u64;
            events.push(Event {
                tag: Tag::new(tag),
                readiness: Interest::from_epoll_bits(bits),
            });
        }
        Ok(ready as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

/// A nonblocking `eventfd` used as an in-process wakeup.
///
/// Both the shutdown notifier and per-worker transports use one of these:
/// a writer thread calls [`EventFd::notify`] and the poll loop that
/// registered the descriptor wakes with its tag.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Makes the descriptor readable. Idempotent: a saturated counter
    /// still reads as ready.
    pub(crate) fn notify(&self) {
        notify_fd(self.fd);
    }

    /// Consumes pending notifications so a level-triggered poll quiets
    /// down again.
    pub(crate) fn drain(&self) {
        let mut value: u64 = 0;
        loop {
            let rc = unsafe {
                libc::read(
                    self.fd,
                    std::ptr::addr_of_mut!(value).cast(),
                    mem::size_of::<u64>(),
                )
            };
            if rc <= 0 {
                return;
            }
        }
    }

    /// Releases ownership of the descriptor without closing it.
    pub(crate) fn into_raw(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Write-one on a raw eventfd; shared with owners that hold only the
/// descriptor number.
pub(crate) fn notify_fd(fd: RawFd) {
    let value: u64 = 1;
    let _ = unsafe {
        libc::write(
            fd,
            std::ptr::addr_of!(value).cast(),
            mem::size_of::<u64>(),
        )
    };
}
