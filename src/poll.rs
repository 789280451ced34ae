//! Socket readiness poller
//!
//! The only place a connection blocks on I/O readiness. Uses `poll(2)`,
//! which has no descriptor ceiling unlike `select(2)`.

use crate::deadline::{Deadline, Remaining};
use crate::error::Want;
use crate::socket::SocketLike;
use libc::{poll, pollfd, POLLIN, POLLOUT};
use std::io;

/// Outcome of waiting for a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// No socket or non-blocking socket; the caller must not wait
    NonBlocking,
    /// Blocking socket; the engine call blocks by itself
    Blocking,
    /// Deadline expired before the socket became ready
    TimedOut,
    /// Socket has been closed
    Closed,
    /// Descriptor cannot be multiplexed
    TooLarge,
    /// Socket is ready for the requested direction
    Ready,
}

/// Wait until `sock` is ready for `want` or `deadline` expires.
///
/// Never fails; errors from `poll(2)` other than descriptor overflow are
/// reported as `Ready` so the engine call is retried and surfaces them.
pub fn wait(sock: Option<&dyn SocketLike>, want: Want, deadline: &Deadline) -> SocketStatus {
    let sock = match sock {
        Some(s) => s,
        None => return SocketStatus::NonBlocking,
    };

    let timeout = match deadline.remaining() {
        Remaining::NonBlocking => return SocketStatus::NonBlocking,
        Remaining::Blocking => return SocketStatus::Blocking,
        Remaining::Expired => return SocketStatus::TimedOut,
        Remaining::Left(left) => left,
    };

    let fd = sock.fileno();
    if fd < 0 {
        return SocketStatus::Closed;
    }

    let mut pfd = pollfd {
        fd,
        events: match want {
            Want::Read => POLLIN,
            Want::Write => POLLOUT,
        },
        revents: 0,
    };

    // Round up so a sub-millisecond remainder still waits once
    let timeout_ms = timeout
        .as_micros()
        .div_ceil(1000)
        .min(libc::c_int::MAX as u128) as libc::c_int;

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        log::trace!("poll on fd {} failed: {}", fd, err);
        return match err.raw_os_error() {
            Some(libc::EINVAL) => SocketStatus::TooLarge,
            _ => SocketStatus::Ready,
        };
    }

    if result == 0 {
        SocketStatus::TimedOut
    } else {
        SocketStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::TimeoutSocket;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    fn connected_pair() -> (TimeoutSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TimeoutSocket::from(client), server)
    }

    fn with_timeout(ms: u64) -> Deadline {
        Deadline::from_timeout(Some(Duration::from_millis(ms)))
    }

    #[test]
    fn test_no_socket_is_nonblocking() {
        assert_eq!(
            wait(None, Want::Read, &with_timeout(1000)),
            SocketStatus::NonBlocking
        );
    }

    #[test]
    fn test_socket_modes() {
        let (sock, _peer) = connected_pair();
        assert_eq!(
            wait(Some(&sock), Want::Read, &Deadline::Blocking),
            SocketStatus::Blocking
        );
        assert_eq!(
            wait(Some(&sock), Want::Read, &Deadline::NonBlocking),
            SocketStatus::NonBlocking
        );
    }

    #[test]
    fn test_expired_deadline_does_not_wait() {
        let (sock, _peer) = connected_pair();
        let past = Deadline::At(Instant::now() - Duration::from_secs(1));
        let start = Instant::now();
        assert_eq!(wait(Some(&sock), Want::Read, &past), SocketStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_closed_socket() {
        let (mut sock, _peer) = connected_pair();
        sock.close();
        assert_eq!(
            wait(Some(&sock), Want::Read, &with_timeout(1000)),
            SocketStatus::Closed
        );
    }

    #[test]
    fn test_readable_and_writable() {
        let (sock, mut peer) = connected_pair();
        assert_eq!(
            wait(Some(&sock), Want::Write, &with_timeout(1000)),
            SocketStatus::Ready
        );

        peer.write_all(b"ping").unwrap();
        assert_eq!(
            wait(Some(&sock), Want::Read, &with_timeout(1000)),
            SocketStatus::Ready
        );
    }

    #[test]
    fn test_read_times_out_without_data() {
        let (sock, _peer) = connected_pair();
        assert_eq!(
            wait(Some(&sock), Want::Read, &with_timeout(20)),
            SocketStatus::TimedOut
        );
    }
}
