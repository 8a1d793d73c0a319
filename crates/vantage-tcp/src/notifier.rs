//! In-process shutdown wakeup.
//!
//! A [`ShutdownNotifier`] owns an eventfd registered with a poller; once
//! [`notify`](ShutdownNotifier::notify) is called, the next poll on that
//! poller surfaces an event carrying the notifier's tag. This is how
//! `Listener::shutdown` unblocks the accept loop from another thread, and
//! how the reactor stops its workers.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};
use crate::poller::{notify_fd, EventFd, Interest, Poller, Tag};

const UNBOUND: i32 = -1;

/// One-shot wakeup registerable with a [`Poller`].
#[derive(Debug)]
pub struct ShutdownNotifier {
    event_fd: AtomicI32,
}

impl ShutdownNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_fd: AtomicI32::new(UNBOUND),
        }
    }

    /// Acquires the wakeup descriptor and registers it read-interested
    /// with its own tag. Binding twice is a usage error.
    pub fn bind(&self, poller: &Poller) -> Result<()> {
        if self.is_bound() {
            return Err(Error::AlreadyBound);
        }
        let event_fd = EventFd::new()?;
        poller.add(
            event_fd.as_raw_fd(),
            Interest::READ,
            Tag::from_fd(event_fd.as_raw_fd()),
        )?;
        self.event_fd.store(event_fd.into_raw(), Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.event_fd.load(Ordering::Acquire) != UNBOUND
    }

    /// Wakes the bound poller. Idempotent; a no-op when unbound.
    pub fn notify(&self) {
        let fd = self.event_fd.load(Ordering::Acquire);
        if fd != UNBOUND {
            notify_fd(fd);
        }
    }

    /// The tag the bound poller reports for this notifier.
    #[must_use]
    pub fn tag(&self) -> Tag {
        Tag::from_fd(self.event_fd.load(Ordering::Acquire))
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShutdownNotifier {
    fn drop(&mut self) {
        let fd = self.event_fd.load(Ordering::Acquire);
        if fd != UNBOUND {
            unsafe { libc::close(fd) };
        }
    }
}
