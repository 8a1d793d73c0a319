//! Listener socket options.
//!
//! [`Options`] is a bitset configured through `Listener::init`. Each flag is
//! independent and maps to one socket-level knob, applied to every
//! candidate socket during the bind loop. `INSTALL_SIGNAL_HANDLER` is the
//! exception: it is a process-level switch handled by the listener itself.

use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use bitflags::bitflags;
use socket2::Socket;

/// Linger interval applied when [`Options::LINGER`] is set.
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue-length hint passed to `TCP_FASTOPEN` when [`Options::FAST_OPEN`]
/// is set.
pub const FAST_OPEN_QUEUE_LEN: i32 = 5;

bitflags! {
    /// Socket and listener behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Options: u32 {
        /// Allow rebinding an address still in `TIME_WAIT` (`SO_REUSEADDR`).
        const REUSE_ADDR = 1 << 0;
        /// Bounded linger on close (`SO_LINGER`, one second).
        const LINGER = 1 << 1;
        /// TCP Fast Open with a queue hint of five (`TCP_FASTOPEN`).
        const FAST_OPEN = 1 << 2;
        /// Disable Nagle's algorithm (`TCP_NODELAY`).
        const NO_DELAY = 1 << 3;
        /// Install a process-wide SIGINT handler that closes the listen
        /// socket and terminates the accept loop.
        const INSTALL_SIGNAL_HANDLER = 1 << 4;
    }
}

/// Applies the socket-level flags to a candidate listen socket.
pub(crate) fn apply_socket_options(socket: &Socket, options: Options) -> io::Result<()> {
    if options.contains(Options::REUSE_ADDR) {
        socket.set_reuse_address(true)?;
    }
    if options.contains(Options::LINGER) {
        socket.set_linger(Some(LINGER_TIMEOUT))?;
    }
    if options.contains(Options::FAST_OPEN) {
        // socket2 has no TCP_FASTOPEN accessor; set it directly.
        let hint = FAST_OPEN_QUEUE_LEN;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_FASTOPEN,
                std::ptr::addr_of!(hint).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if options.contains(Options::NO_DELAY) {
        socket.set_nodelay(true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    fn tcp_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).expect("socket")
    }

    fn fastopen_queue_len(socket: &Socket) -> libc::c_int {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_FASTOPEN,
                std::ptr::addr_of_mut!(value).cast(),
                &mut len,
            )
        };
        assert_eq!(rc, 0, "getsockopt(TCP_FASTOPEN)");
        value
    }

    #[test]
    fn empty_options_touch_nothing() {
        let socket = tcp_socket();
        apply_socket_options(&socket, Options::empty()).expect("apply");
        assert!(!socket.reuse_address().expect("getsockopt"));
        assert!(socket.linger().expect("getsockopt").is_none());
        assert!(!socket.nodelay().expect("getsockopt"));
    }

    #[test]
    fn reuse_addr_round_trips() {
        let socket = tcp_socket();
        apply_socket_options(&socket, Options::REUSE_ADDR).expect("apply");
        assert!(socket.reuse_address().expect("getsockopt"));
    }

    #[test]
    fn linger_round_trips_at_one_second() {
        let socket = tcp_socket();
        apply_socket_options(&socket, Options::LINGER).expect("apply");
        assert_eq!(socket.linger().expect("getsockopt"), Some(LINGER_TIMEOUT));
    }

    #[test]
    fn nodelay_round_trips() {
        let socket = tcp_socket();
        apply_socket_options(&socket, Options::NO_DELAY).expect("apply");
        assert!(socket.nodelay().expect("getsockopt"));
    }

    #[test]
    fn fast_open_sets_queue_hint() {
        let socket = tcp_socket();
        apply_socket_options(&socket, Options::FAST_OPEN).expect("apply");
        assert!(fastopen_queue_len(&socket) > 0);
    }

    #[test]
    fn combined_flags_apply_independently() {
        let socket = tcp_socket();
        apply_socket_options(&socket, Options::REUSE_ADDR | Options::NO_DELAY).expect("apply");
        assert!(socket.reuse_address().expect("getsockopt"));
        assert!(socket.nodelay().expect("getsockopt"));
        assert!(socket.linger().expect("getsockopt").is_none());
    }
}
