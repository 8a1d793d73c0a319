//! Accepted connections awaiting dispatch.

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// An accepted client connection: remote address plus owned descriptor.
///
/// Created by the accept loop; ownership passes to the transport instance
/// selected by the dispatcher. The descriptor is closed when the peer is
/// dropped.
#[derive(Debug)]
pub struct Peer {
    addr: SocketAddr,
    fd: RawFd,
}

impl Peer {
    /// Wraps a connected descriptor. Takes ownership: the descriptor is
    /// closed on drop.
    #[must_use]
    pub fn new(addr: SocketAddr, fd: RawFd) -> Self {
        Self { addr, fd }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for Peer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (fd {})", self.addr, self.fd)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}
