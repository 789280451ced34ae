//! Process-wide engine state
//!
//! The engine is initialised once per process by [`init`] (every context
//! constructor calls it). Initialisation loads the library, allocates the
//! per-connection ex-data slot used by callbacks and probes the set of
//! optional features the linked library supports.

use crate::connection::ConnShared;
use crate::error::{ErrorState, ProtocolError, SslErrorCode, TlsError};
use crate::Result;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslVersion};
use openssl_sys as sys;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::{Arc, OnceLock};

/// Default cipher list applied to every new context
pub const DEFAULT_CIPHERS: &str =
    "DEFAULT:!aNULL:!eNULL:!MD5:!3DES:!DES:!RC4:!IDEA:!SEED:!aDSS:!SRP:!PSK";

/// Channel binding types supported by `TlsConnection::get_channel_binding`
pub const CHANNEL_BINDING_TYPES: &[&str] = &["tls-unique"];

/// Optional engine features, detected once per process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub sni: bool,
    pub alpn: bool,
    pub npn: bool,
    pub ecdh: bool,
    pub tls_unique: bool,
    pub sslv2: bool,
    pub sslv3: bool,
    pub tlsv1: bool,
    pub tlsv1_1: bool,
    pub tlsv1_2: bool,
    pub tlsv1_3: bool,
    pub min_max_version: bool,
    pub post_handshake_auth: bool,
    pub session_tickets: bool,
}

impl Capabilities {
    fn detect() -> Self {
        let number = openssl::version::number();
        let has_111 = number >= 0x1010_1000;

        Capabilities {
            sni: true,
            alpn: true,
            npn: false,
            ecdh: true,
            tls_unique: true,
            sslv2: false,
            sslv3: version_usable(SslVersion::SSL3),
            tlsv1: version_usable(SslVersion::TLS1),
            tlsv1_1: version_usable(SslVersion::TLS1_1),
            tlsv1_2: version_usable(SslVersion::TLS1_2),
            tlsv1_3: has_111 && version_usable(SslVersion::TLS1_3),
            min_max_version: number >= 0x1010_0000,
            post_handshake_auth: has_111,
            session_tickets: has_111,
        }
    }

    /// Fail with `Unsupported` unless `available`
    pub(crate) fn require(available: bool, feature: &str) -> Result<()> {
        if available {
            Ok(())
        } else {
            Err(TlsError::Unsupported(format!(
                "{} is not supported by the TLS library",
                feature
            )))
        }
    }
}

/// Live self-test: build a context pinned to `version` and a connection on it
fn version_usable(version: SslVersion) -> bool {
    let mut builder = match SslContextBuilder::new(SslMethod::tls()) {
        Ok(b) => b,
        Err(_) => return false,
    };
    if builder.set_min_proto_version(Some(version)).is_err()
        || builder.set_max_proto_version(Some(version)).is_err()
    {
        return false;
    }
    let ctx = builder.build();
    Ssl::new(&ctx).is_ok()
}

pub(crate) struct Engine {
    pub(crate) capabilities: Capabilities,
    pub(crate) conn_index: Index<Ssl, Arc<Mutex<ConnShared>>>,
}

static ENGINE: OnceLock<std::result::Result<Engine, ProtocolError>> = OnceLock::new();

impl Engine {
    fn load() -> std::result::Result<Engine, ProtocolError> {
        openssl::init();

        let conn_index = Ssl::new_ex_index().map_err(|stack| {
            let state = ErrorState {
                code: SslErrorCode::Ssl,
                errno: 0,
            };
            ProtocolError::from_stack(state, &stack)
        })?;

        let capabilities = Capabilities::detect();
        log::debug!(
            "TLS engine initialised: {} ({:?})",
            openssl::version::version(),
            capabilities
        );

        Ok(Engine {
            capabilities,
            conn_index,
        })
    }
}

pub(crate) fn engine() -> Result<&'static Engine> {
    ENGINE
        .get_or_init(Engine::load)
        .as_ref()
        .map_err(|e| TlsError::Protocol(e.clone()))
}

/// Initialise the engine (idempotent) and report its capabilities
pub fn init() -> Result<Capabilities> {
    engine().map(|e| e.capabilities)
}

/// Version string of the linked library, e.g. "OpenSSL 3.0.2 15 Mar 2022"
pub fn openssl_version() -> &'static str {
    openssl::version::version()
}

/// Numeric version of the linked library
pub fn openssl_version_number() -> i64 {
    openssl::version::number()
}

/// `(major, minor, fix, patch, status)` decoded from the numeric version
pub fn openssl_version_info() -> (u8, u8, u8, u8, u8) {
    parse_version_info(openssl::version::number())
}

const fn parse_version_info(mut n: i64) -> (u8, u8, u8, u8, u8) {
    let status = (n & 0xF) as u8;
    n >>= 4;
    let patch = (n & 0xFF) as u8;
    n >>= 8;
    let fix = (n & 0xFF) as u8;
    n >>= 8;
    let minor = (n & 0xFF) as u8;
    n >>= 8;
    let major = (n & 0xFF) as u8;
    (major, minor, fix, patch, status)
}

/// Compiled-in trust store locations and the environment variables
/// overriding them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultVerifyPaths {
    pub cafile_env: String,
    pub cafile: String,
    pub capath_env: String,
    pub capath: String,
}

pub fn get_default_verify_paths() -> DefaultVerifyPaths {
    macro_rules! convert {
        ($f:ident) => {
            unsafe { CStr::from_ptr(sys::$f()) }
                .to_string_lossy()
                .into_owned()
        };
    }
    DefaultVerifyPaths {
        cafile_env: convert!(X509_get_default_cert_file_env),
        cafile: convert!(X509_get_default_cert_file),
        capath_env: convert!(X509_get_default_cert_dir_env),
        capath: convert!(X509_get_default_cert_dir),
    }
}

/// TLS alert descriptions an SNI callback may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    RecordOverflow = 22,
    DecompressionFailure = 30,
    HandshakeFailure = 40,
    BadCertificate = 42,
    UnsupportedCertificate = 43,
    CertificateRevoked = 44,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    UserCancelled = 90,
    NoRenegotiation = 100,
    UnsupportedExtension = 110,
    CertificateUnobtainable = 111,
    UnrecognizedName = 112,
    BadCertificateStatusResponse = 113,
    BadCertificateHashValue = 114,
    UnknownPskIdentity = 115,
}

impl AlertDescription {
    pub fn code(self) -> i32 {
        self as i32
    }
}
