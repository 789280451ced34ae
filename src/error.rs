//! Error types and engine error classification
//!
//! Every engine call that can fail is followed by [`ErrorState::classify`],
//! which snapshots the engine's symbolic error code together with the OS
//! errno carried by the failing call. The snapshot drives the retry loops in
//! the connection and ends up inside [`ProtocolError`] when the failure is
//! terminal.

use openssl::error::ErrorStack;
use openssl::ssl::{self, ErrorCode};
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Reason code OpenSSL 3 reports for a peer that vanished without close-notify.
const SSL_R_UNEXPECTED_EOF_WHILE_READING: i32 = 294;

/// X509_V_ERR_HOSTNAME_MISMATCH
const X509_V_ERR_HOSTNAME_MISMATCH: i32 = 62;
/// X509_V_ERR_IP_ADDRESS_MISMATCH
const X509_V_ERR_IP_ADDRESS_MISMATCH: i32 = 64;

/// Symbolic engine error code, numbered like the Python `ssl` module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SslErrorCode {
    None = 0,
    Ssl = 1,
    WantRead = 2,
    WantWrite = 3,
    WantX509Lookup = 4,
    Syscall = 5,
    ZeroReturn = 6,
    WantConnect = 7,
    Eof = 8,
    NoSocket = 9,
    Invalid = 10,
}

impl SslErrorCode {
    /// Direction the engine is waiting on, if any
    pub fn wants(self) -> Option<Want> {
        match self {
            SslErrorCode::WantRead => Some(Want::Read),
            SslErrorCode::WantWrite => Some(Want::Write),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            SslErrorCode::None => "no error",
            SslErrorCode::Ssl => "A failure in the SSL library occurred",
            SslErrorCode::WantRead => "The operation did not complete (read)",
            SslErrorCode::WantWrite => "The operation did not complete (write)",
            SslErrorCode::WantX509Lookup => "The operation did not complete (X509 lookup)",
            SslErrorCode::Syscall => "Some I/O error occurred",
            SslErrorCode::ZeroReturn => "TLS/SSL connection has been closed (EOF)",
            SslErrorCode::WantConnect => "The operation did not complete (connect)",
            SslErrorCode::Eof => "EOF occurred in violation of protocol",
            SslErrorCode::NoSocket => "Underlying socket has been closed.",
            SslErrorCode::Invalid => "Invalid error code",
        }
    }
}

/// I/O direction a WANT_READ / WANT_WRITE outcome is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

/// Snapshot of the engine and OS error state after a failed engine call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorState {
    /// Engine error code
    pub code: SslErrorCode,
    /// OS errno observed by the failing call, 0 if none
    pub errno: i32,
}

impl ErrorState {
    /// The "no error" snapshot
    pub const NONE: ErrorState = ErrorState {
        code: SslErrorCode::None,
        errno: 0,
    };

    /// Classify the outcome of an engine call.
    ///
    /// Must run directly after the call: the errno travels inside the
    /// returned [`ssl::Error`], so nothing else may touch the engine first.
    pub fn classify<T>(result: &std::result::Result<T, ssl::Error>) -> ErrorState {
        match result {
            Ok(_) => ErrorState::NONE,
            Err(err) => ErrorState::from_engine(err),
        }
    }

    pub(crate) fn from_engine(err: &ssl::Error) -> ErrorState {
        let errno = err
            .io_error()
            .and_then(io::Error::raw_os_error)
            .unwrap_or(0);

        let code = match err.code() {
            ErrorCode::WANT_READ => SslErrorCode::WantRead,
            ErrorCode::WANT_WRITE => SslErrorCode::WantWrite,
            ErrorCode::ZERO_RETURN => SslErrorCode::ZeroReturn,
            ErrorCode::SYSCALL => match err.io_error() {
                Some(_) => SslErrorCode::Syscall,
                None => SslErrorCode::Eof,
            },
            ErrorCode::SSL => {
                let unexpected_eof = err
                    .ssl_error()
                    .and_then(|stack| stack.errors().last())
                    .map_or(false, |e| e.reason_code() == SSL_R_UNEXPECTED_EOF_WHILE_READING);
                if unexpected_eof {
                    SslErrorCode::Eof
                } else {
                    SslErrorCode::Ssl
                }
            }
            code if code.as_raw() == openssl_sys::SSL_ERROR_WANT_X509_LOOKUP => {
                SslErrorCode::WantX509Lookup
            }
            code if code.as_raw() == openssl_sys::SSL_ERROR_WANT_CONNECT => {
                SslErrorCode::WantConnect
            }
            _ => SslErrorCode::Invalid,
        };

        ErrorState { code, errno }
    }

    /// Whether this snapshot records a failure
    pub fn is_error(&self) -> bool {
        self.code != SslErrorCode::None
    }
}

impl Default for ErrorState {
    fn default() -> Self {
        ErrorState::NONE
    }
}

/// A terminal engine failure
#[derive(Debug, Clone)]
pub struct ProtocolError {
    /// Classified engine state at the time of failure
    pub state: ErrorState,
    /// Engine library that raised the error, e.g. "SSL routines"
    pub library: Option<String>,
    /// Engine reason string, e.g. "wrong version number"
    pub reason: Option<String>,
    /// Human readable message
    pub message: String,
}

impl ProtocolError {
    pub(crate) fn new(state: ErrorState, message: impl Into<String>) -> Self {
        ProtocolError {
            state,
            library: None,
            reason: None,
            message: message.into(),
        }
    }

    pub(crate) fn from_stack(state: ErrorState, stack: &ErrorStack) -> Self {
        match stack.errors().last() {
            Some(e) => {
                let reason = e.reason().map(str::to_owned);
                let message = reason
                    .clone()
                    .unwrap_or_else(|| state.code.describe().to_string());
                ProtocolError {
                    state,
                    library: e.library().map(str::to_owned),
                    reason,
                    message,
                }
            }
            None => ProtocolError::new(state, state.code.describe()),
        }
    }

    pub(crate) fn from_engine(state: ErrorState, err: &ssl::Error) -> Self {
        match err.ssl_error() {
            Some(stack) => ProtocolError::from_stack(state, stack),
            None => ProtocolError::new(state, state.code.describe()),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.library {
            Some(lib) => write!(f, "[{}] {}", lib, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Certificate verification failure reported by the engine
#[derive(Debug, Clone)]
pub struct CertificateError {
    /// X509 verification result code
    pub verify_code: i32,
    /// X509 verification message, e.g. "certificate has expired"
    pub verify_message: String,
    /// The failure was a host name / IP address mismatch
    pub hostname_mismatch: bool,
}

impl CertificateError {
    pub(crate) fn new(verify_code: i32, verify_message: impl Into<String>) -> Self {
        CertificateError {
            verify_code,
            verify_message: verify_message.into(),
            hostname_mismatch: verify_code == X509_V_ERR_HOSTNAME_MISMATCH
                || verify_code == X509_V_ERR_IP_ADDRESS_MISMATCH,
        }
    }
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "certificate verify failed: {} ({})",
            self.verify_message, self.verify_code
        )
    }
}

/// Reasons a session cannot be attached to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session refers to a different SSLContext.")]
    ContextMismatch,

    #[error("Cannot set session for server-side SSLSocket.")]
    ServerSide,

    #[error("Cannot set session after handshake.")]
    HandshakeStarted,
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("{0}")]
    Timeout(String),

    #[error("Underlying socket has been closed.")]
    ConnectionClosed,

    #[error("Underlying socket too large for select().")]
    NotSelectable,

    #[error("{0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Overflow(String),

    #[error("{0}")]
    State(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Certificate(CertificateError),

    #[error("{0}")]
    Protocol(ProtocolError),

    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),
}

impl TlsError {
    /// Classified engine state, for errors raised by the engine
    pub fn error_state(&self) -> Option<ErrorState> {
        match self {
            TlsError::Protocol(e) => Some(e.state),
            _ => None,
        }
    }

    /// Engine code of the failure, `SslErrorCode::None` for non-engine errors
    pub fn ssl_code(&self) -> SslErrorCode {
        self.error_state().map_or(SslErrorCode::None, |s| s.code)
    }

    /// Non-blocking operation needs the transport to become readable
    pub fn is_want_read(&self) -> bool {
        self.ssl_code() == SslErrorCode::WantRead
    }

    /// Non-blocking operation needs the transport to become writable
    pub fn is_want_write(&self) -> bool {
        self.ssl_code() == SslErrorCode::WantWrite
    }

    /// A socket deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, TlsError::Timeout(_))
    }

    /// OS errno attached to the error, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            TlsError::File { source, .. } | TlsError::Io(source) => source.raw_os_error(),
            TlsError::Protocol(e) if e.state.errno != 0 => Some(e.state.errno),
            _ => None,
        }
    }

    pub(crate) fn callback(msg: impl Into<String>) -> Self {
        TlsError::Callback(msg.into().into())
    }
}

impl From<ErrorStack> for TlsError {
    fn from(stack: ErrorStack) -> Self {
        let state = ErrorState {
            code: SslErrorCode::Ssl,
            errno: 0,
        };
        TlsError::Protocol(ProtocolError::from_stack(state, &stack))
    }
}

/// For the `std::io` impls on connections
impl From<TlsError> for io::Error {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Io(e) => e,
            TlsError::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            TlsError::ConnectionClosed => io::Error::new(io::ErrorKind::NotConnected, err),
            e if e.is_want_read() || e.is_want_write() => {
                io::Error::new(io::ErrorKind::WouldBlock, e)
            }
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}
