//! sslcore - TLS socket core over OpenSSL
//!
//! This crate provides TLS contexts and connections with Python `ssl`
//! module semantics: socket timeouts enforced by polling, in-memory BIO
//! transports, SNI and ALPN callbacks, and classified engine errors.

pub mod bio;
pub mod cert;
pub mod config;
pub mod connection;
pub mod context;
pub mod deadline;
pub mod engine;
pub mod error;
mod ffi;
pub mod password;
pub mod poll;
pub mod session;
mod sni;
pub mod socket;
pub mod store;

pub use bio::MemoryBio;
pub use cert::{decode_certificate, CertData, CertInfo};
pub use config::{ContextBuilder, Protocol, Role, TlsVersion, VerifyMode};
pub use connection::{CipherTuple, HandshakeState, TlsConnection};
pub use context::{CipherInfo, SessionStats, SniCallback, SniRequest, TlsContext};
pub use engine::{AlertDescription, Capabilities, DefaultVerifyPaths};
pub use error::{
    CertificateError, ErrorState, ProtocolError, SessionError, SslErrorCode, TlsError, Want,
};
pub use password::Password;
pub use session::TlsSession;
pub use socket::{SocketLike, TimeoutSocket};
pub use store::{CaData, CertStoreStats};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
