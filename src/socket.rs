//! Socket collaborator
//!
//! A connection in socket mode talks to anything implementing
//! [`SocketLike`]. [`TimeoutSocket`] is the stock implementation: a
//! `socket2::Socket` with Python-style timeout semantics, where a timeout
//! puts the descriptor in non-blocking mode and the poller enforces it.

use socket2::Socket;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Socket-like transport used by connections in socket mode
pub trait SocketLike: Read + Write + Send {
    /// Raw descriptor, negative once the socket is closed
    fn fileno(&self) -> RawFd;

    /// Configured timeout: `None` is blocking mode, zero is non-blocking
    fn timeout(&self) -> Option<Duration>;

    /// Switch the descriptor between blocking and non-blocking mode
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl fmt::Debug for dyn SocketLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketLike")
            .field("fileno", &self.fileno())
            .field("timeout", &self.timeout())
            .finish()
    }
}

/// `socket2::Socket` with a timeout
pub struct TimeoutSocket {
    socket: Option<Socket>,
    timeout: Option<Duration>,
}

impl TimeoutSocket {
    /// Wrap a socket in blocking mode
    pub fn new(socket: Socket) -> Self {
        TimeoutSocket {
            socket: Some(socket),
            timeout: None,
        }
    }

    /// Set the timeout (`None` = blocking, zero = non-blocking)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if let Some(socket) = &self.socket {
            socket.set_nonblocking(timeout.is_some())?;
        }
        self.timeout = timeout;
        Ok(())
    }

    /// Builder-style variant of [`TimeoutSocket::set_timeout`]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> io::Result<Self> {
        self.set_timeout(timeout)?;
        Ok(self)
    }

    /// Close the descriptor; later operations report the socket as closed
    pub fn close(&mut self) {
        self.socket.take();
    }

    /// Underlying socket, `None` once closed
    pub fn get_ref(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    fn socket(&self) -> io::Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl From<Socket> for TimeoutSocket {
    fn from(socket: Socket) -> Self {
        TimeoutSocket::new(socket)
    }
}

impl From<TcpStream> for TimeoutSocket {
    fn from(stream: TcpStream) -> Self {
        TimeoutSocket::new(Socket::from(stream))
    }
}

impl Read for TimeoutSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.socket()?;
        socket.read(buf)
    }
}

impl Write for TimeoutSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut socket = self.socket()?;
        socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut socket = self.socket()?;
        socket.flush()
    }
}

impl SocketLike for TimeoutSocket {
    fn fileno(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.socket()?.set_nonblocking(nonblocking)
    }
}
