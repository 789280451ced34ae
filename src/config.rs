//! TLS configuration
//!
//! Protocol selectors, version bounds, verification modes and the
//! [`ContextBuilder`] used to assemble a [`TlsContext`] in one go.

use crate::context::{SniCallback, TlsContext};
use crate::error::TlsError;
use crate::password::Password;
use crate::store::CaData;
use crate::Result;
use openssl::ssl::{SslVerifyMode, SslVersion};
use openssl::x509::verify::X509VerifyFlags;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Protocol version bound for [`TlsContext::set_minimum_version`] and
/// [`TlsContext::set_maximum_version`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// Lowest version the library supports
    MinimumSupported,
    /// SSL 3.0 (deprecated, rarely used)
    Ssl3,
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
    /// Highest version the library supports
    MaximumSupported,
}

impl TlsVersion {
    /// Protocol constant, -2 / -1 for the minimum / maximum sentinels
    pub fn as_raw(&self) -> i32 {
        match self {
            TlsVersion::MinimumSupported => -2,
            TlsVersion::Ssl3 => 0x0300,
            TlsVersion::Tls10 => 0x0301,
            TlsVersion::Tls11 => 0x0302,
            TlsVersion::Tls12 => 0x0303,
            TlsVersion::Tls13 => 0x0304,
            TlsVersion::MaximumSupported => -1,
        }
    }

    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            -2 => Ok(TlsVersion::MinimumSupported),
            0x0300 => Ok(TlsVersion::Ssl3),
            0x0301 => Ok(TlsVersion::Tls10),
            0x0302 => Ok(TlsVersion::Tls11),
            0x0303 => Ok(TlsVersion::Tls12),
            0x0304 => Ok(TlsVersion::Tls13),
            -1 => Ok(TlsVersion::MaximumSupported),
            _ => Err(TlsError::InvalidConfig(format!(
                "Unsupported TLS/SSL version 0x{:x}",
                raw
            ))),
        }
    }

    /// Get OpenSSL protocol version constant, `None` for the sentinels
    pub fn to_openssl_version(&self) -> Option<SslVersion> {
        match self {
            TlsVersion::Ssl3 => Some(SslVersion::SSL3),
            TlsVersion::Tls10 => Some(SslVersion::TLS1),
            TlsVersion::Tls11 => Some(SslVersion::TLS1_1),
            TlsVersion::Tls12 => Some(SslVersion::TLS1_2),
            TlsVersion::Tls13 => Some(SslVersion::TLS1_3),
            TlsVersion::MinimumSupported | TlsVersion::MaximumSupported => None,
        }
    }

    pub(crate) fn from_openssl_version(version: SslVersion) -> Option<Self> {
        [
            TlsVersion::Ssl3,
            TlsVersion::Tls10,
            TlsVersion::Tls11,
            TlsVersion::Tls12,
            TlsVersion::Tls13,
        ]
        .into_iter()
        .find(|v| v.to_openssl_version() == Some(version))
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::MinimumSupported => "MINIMUM_SUPPORTED",
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
            TlsVersion::MaximumSupported => "MAXIMUM_SUPPORTED",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SSLV3" | "SSL3" => Ok(TlsVersion::Ssl3),
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            "MINIMUM_SUPPORTED" => Ok(TlsVersion::MinimumSupported),
            "MAXIMUM_SUPPORTED" => Ok(TlsVersion::MaximumSupported),
            _ => Err(TlsError::InvalidConfig(format!("Invalid TLS version: {}", s))),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VerifyMode {
    /// Don't request or check peer certificates
    None = 0,
    /// Check the certificate if the peer sends one
    Optional = 1,
    /// Require and check a peer certificate
    Required = 2,
}

impl VerifyMode {
    pub(crate) fn to_openssl(self) -> SslVerifyMode {
        match self {
            VerifyMode::None => SslVerifyMode::NONE,
            VerifyMode::Optional => SslVerifyMode::PEER,
            VerifyMode::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        }
    }

    pub(crate) fn from_openssl(mode: SslVerifyMode) -> Self {
        if mode.contains(SslVerifyMode::FAIL_IF_NO_PEER_CERT) {
            VerifyMode::Required
        } else if mode.contains(SslVerifyMode::PEER) {
            VerifyMode::Optional
        } else {
            VerifyMode::None
        }
    }
}

impl TryFrom<i32> for VerifyMode {
    type Error = TlsError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(VerifyMode::None),
            1 => Ok(VerifyMode::Optional),
            2 => Ok(VerifyMode::Required),
            _ => Err(TlsError::InvalidConfig(
                "invalid value for verify_mode".to_string(),
            )),
        }
    }
}

/// Protocol selector a context is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Protocol {
    Sslv2 = 0,
    Sslv3 = 1,
    /// Generic TLS, either role, version negotiated
    Tls = 2,
    Tlsv1 = 3,
    Tlsv1_1 = 4,
    Tlsv1_2 = 5,
    TlsClient = 0x10,
    TlsServer = 0x11,
}

impl Protocol {
    /// Selectors pinned to a single legacy version
    pub(crate) fn pinned_version(self) -> Option<SslVersion> {
        match self {
            Protocol::Sslv3 => Some(SslVersion::SSL3),
            Protocol::Tlsv1 => Some(SslVersion::TLS1),
            Protocol::Tlsv1_1 => Some(SslVersion::TLS1_1),
            Protocol::Tlsv1_2 => Some(SslVersion::TLS1_2),
            _ => None,
        }
    }

    /// Whether minimum / maximum version may be changed
    pub(crate) fn allows_version_bounds(self) -> bool {
        matches!(self, Protocol::Tls | Protocol::TlsClient | Protocol::TlsServer)
    }
}

impl TryFrom<i32> for Protocol {
    type Error = TlsError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Protocol::Sslv2),
            1 => Ok(Protocol::Sslv3),
            2 => Ok(Protocol::Tls),
            3 => Ok(Protocol::Tlsv1),
            4 => Ok(Protocol::Tlsv1_1),
            5 => Ok(Protocol::Tlsv1_2),
            0x10 => Ok(Protocol::TlsClient),
            0x11 => Ok(Protocol::TlsServer),
            _ => Err(TlsError::InvalidConfig(
                "invalid or unsupported protocol version".to_string(),
            )),
        }
    }
}

/// Side of the handshake a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

struct CertChain {
    certfile: PathBuf,
    keyfile: Option<PathBuf>,
    password: Option<Password>,
}

/// Context configuration builder
///
/// Collects settings and applies them in an order the context accepts, so
/// e.g. enabling `check_hostname` together with a verify mode works
/// regardless of call order.
pub struct ContextBuilder {
    protocol: Protocol,
    verify_mode: Option<VerifyMode>,
    check_hostname: Option<bool>,
    minimum_version: Option<TlsVersion>,
    maximum_version: Option<TlsVersion>,
    ciphers: Option<String>,
    alpn: Option<Vec<Vec<u8>>>,
    cert_chain: Option<CertChain>,
    ca_file: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    ca_data: Vec<CaData>,
    default_verify_paths: bool,
    verify_flags: Option<X509VerifyFlags>,
    post_handshake_auth: Option<bool>,
    num_tickets: Option<usize>,
    ecdh_curve: Option<String>,
    dh_params: Option<PathBuf>,
    sni_callback: Option<SniCallback>,
}

impl ContextBuilder {
    /// Builder for any selector
    pub fn new(protocol: Protocol) -> Self {
        ContextBuilder {
            protocol,
            verify_mode: None,
            check_hostname: None,
            minimum_version: None,
            maximum_version: None,
            ciphers: None,
            alpn: None,
            cert_chain: None,
            ca_file: None,
            ca_path: None,
            ca_data: Vec::new(),
            default_verify_paths: false,
            verify_flags: None,
            post_handshake_auth: None,
            num_tickets: None,
            ecdh_curve: None,
            dh_params: None,
            sni_callback: None,
        }
    }

    /// Client builder: certificate and host name verification on
    pub fn client() -> Self {
        Self::new(Protocol::TlsClient)
    }

    /// Server builder: no client certificate requested
    pub fn server() -> Self {
        Self::new(Protocol::TlsServer)
    }

    pub fn verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = Some(mode);
        self
    }

    pub fn check_hostname(mut self, check: bool) -> Self {
        self.check_hostname = Some(check);
        self
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.minimum_version = Some(min);
        self.maximum_version = Some(max);
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphers = Some(ciphers.into());
        self
    }

    /// Set ALPN protocols, most preferred first
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = Some(protocols.iter().map(|p| p.as_bytes().to_vec()).collect());
        self
    }

    /// Load a certificate chain and private key (`keyfile` defaults to `certfile`)
    pub fn cert_chain(
        mut self,
        certfile: impl Into<PathBuf>,
        keyfile: Option<PathBuf>,
        password: Option<Password>,
    ) -> Self {
        self.cert_chain = Some(CertChain {
            certfile: certfile.into(),
            keyfile,
            password,
        });
        self
    }

    /// Trust the CA certificates in a PEM file
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Trust the CA certificates in a hashed directory
    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Trust in-memory CA certificates (may be repeated)
    pub fn ca_data(mut self, data: CaData) -> Self {
        self.ca_data.push(data);
        self
    }

    /// Also trust the system default locations
    pub fn default_verify_paths(mut self) -> Self {
        self.default_verify_paths = true;
        self
    }

    pub fn verify_flags(mut self, flags: X509VerifyFlags) -> Self {
        self.verify_flags = Some(flags);
        self
    }

    pub fn post_handshake_auth(mut self, enabled: bool) -> Self {
        self.post_handshake_auth = Some(enabled);
        self
    }

    /// Session tickets issued after a TLS 1.3 handshake (server only)
    pub fn num_tickets(mut self, n: usize) -> Self {
        self.num_tickets = Some(n);
        self
    }

    pub fn ecdh_curve(mut self, name: impl Into<String>) -> Self {
        self.ecdh_curve = Some(name.into());
        self
    }

    pub fn dh_params(mut self, path: impl Into<PathBuf>) -> Self {
        self.dh_params = Some(path.into());
        self
    }

    pub fn sni_callback(mut self, callback: SniCallback) -> Self {
        self.sni_callback = Some(callback);
        self
    }

    /// Build the context
    pub fn build(self) -> Result<TlsContext> {
        let ctx = TlsContext::new(self.protocol)?;

        // Relax before tightening so the check_hostname invariant holds at
        // every step.
        if self.check_hostname == Some(false) {
            ctx.set_check_hostname(false)?;
        }
        if let Some(mode) = self.verify_mode {
            ctx.set_verify_mode(mode)?;
        }
        if self.check_hostname == Some(true) {
            ctx.set_check_hostname(true)?;
        }

        if let Some(min) = self.minimum_version {
            ctx.set_minimum_version(min)?;
        }
        if let Some(max) = self.maximum_version {
            ctx.set_maximum_version(max)?;
        }
        if let Some(ciphers) = &self.ciphers {
            ctx.set_ciphers(ciphers)?;
        }
        if let Some(protocols) = &self.alpn {
            let protocols: Vec<&[u8]> = protocols.iter().map(Vec::as_slice).collect();
            ctx.set_alpn_protocols(&protocols)?;
        }
        if let Some(flags) = self.verify_flags {
            ctx.set_verify_flags(flags);
        }
        if let Some(enabled) = self.post_handshake_auth {
            ctx.set_post_handshake_auth(enabled)?;
        }
        if let Some(n) = self.num_tickets {
            ctx.set_num_tickets(n)?;
        }
        if let Some(curve) = &self.ecdh_curve {
            ctx.set_ecdh_curve(curve)?;
        }
        if let Some(path) = &self.dh_params {
            ctx.load_dh_params(path)?;
        }

        if self.default_verify_paths {
            ctx.set_default_verify_paths()?;
        }
        if self.ca_file.is_some() || self.ca_path.is_some() {
            ctx.load_verify_locations(self.ca_file.as_deref(), self.ca_path.as_deref(), None)?;
        }
        for data in &self.ca_data {
            ctx.load_verify_locations(None, None, Some(data))?;
        }

        if let Some(chain) = self.cert_chain {
            ctx.load_cert_chain(&chain.certfile, chain.keyfile.as_deref(), chain.password)?;
        }

        if let Some(callback) = self.sni_callback {
            ctx.set_sni_callback(Some(callback))?;
        }

        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1.0".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert!("invalid".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_tls_version_raw_values() {
        assert_eq!(TlsVersion::MinimumSupported.as_raw(), -2);
        assert_eq!(TlsVersion::MaximumSupported.as_raw(), -1);
        assert_eq!(TlsVersion::Tls12.as_raw(), 0x0303);
        assert_eq!(TlsVersion::from_raw(0x0304).unwrap(), TlsVersion::Tls13);
        assert!(TlsVersion::from_raw(0x0305).is_err());
        assert_eq!(
            TlsVersion::from_openssl_version(SslVersion::TLS1_2),
            Some(TlsVersion::Tls12)
        );
        assert_eq!(TlsVersion::MaximumSupported.to_openssl_version(), None);
    }

    #[test]
    fn test_verify_mode_mapping() {
        for mode in [VerifyMode::None, VerifyMode::Optional, VerifyMode::Required] {
            assert_eq!(VerifyMode::from_openssl(mode.to_openssl()), mode);
            assert_eq!(VerifyMode::try_from(mode as i32).unwrap(), mode);
        }
        assert!(VerifyMode::try_from(3).is_err());
    }

    #[test]
    fn test_protocol_selectors() {
        assert_eq!(Protocol::try_from(0x10).unwrap(), Protocol::TlsClient);
        assert_eq!(Protocol::try_from(2).unwrap(), Protocol::Tls);
        assert!(matches!(
            Protocol::try_from(42),
            Err(TlsError::InvalidConfig(_))
        ));
        assert!(Protocol::TlsServer.allows_version_bounds());
        assert!(!Protocol::Tlsv1_2.allows_version_bounds());
        assert_eq!(Protocol::Tlsv1_2.pinned_version(), Some(SslVersion::TLS1_2));
    }

    #[test]
    fn test_client_builder_defaults() {
        let ctx = ContextBuilder::client().build().unwrap();
        assert_eq!(ctx.verify_mode(), VerifyMode::Required);
        assert!(ctx.check_hostname());
    }

    #[test]
    fn test_builder_relaxes_verification_in_any_order() {
        let ctx = ContextBuilder::client()
            .verify_mode(VerifyMode::None)
            .check_hostname(false)
            .build()
            .unwrap();
        assert_eq!(ctx.verify_mode(), VerifyMode::None);
        assert!(!ctx.check_hostname());
    }

    #[test]
    fn test_server_builder_version_range() {
        let ctx = ContextBuilder::server()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .build()
            .unwrap();
        assert_eq!(ctx.protocol(), Protocol::TlsServer);
        assert_eq!(ctx.minimum_version(), TlsVersion::Tls12);
        assert_eq!(ctx.maximum_version(), TlsVersion::Tls13);
    }

    #[test]
    fn test_builder_rejects_bad_ciphers() {
        let result = ContextBuilder::server().ciphers("NOT-A-CIPHER").build();
        assert!(result.is_err());
    }
}
