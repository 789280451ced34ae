//! TLS context
//!
//! A [`TlsContext`] owns the engine context object together with the policy
//! the engine does not track itself (hostname checking, verification flags
//! applied to each new connection). Clones share the same context; the
//! engine object is freed when the last clone and the last connection
//! created from it are gone.

use crate::bio::MemoryBio;
use crate::cert::CertData;
use crate::config::{Protocol, Role, TlsVersion, VerifyMode};
use crate::connection::{TlsConnection, Transport};
use crate::engine::{self, Capabilities, DEFAULT_CIPHERS};
use crate::error::{ErrorState, ProtocolError, SslErrorCode, TlsError};
use crate::ffi;
use crate::password::{Password, PasswordScope};
use crate::sni;
use crate::socket::SocketLike;
use crate::store::{self, CaData, CertStoreStats};
use crate::Result;
use foreign_types_shared::{ForeignType, ForeignTypeRef};
use libc::c_int;
use openssl::dh::Dh;
use openssl::ec::EcKey;
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::ssl::{
    self, Ssl, SslCipher, SslContextBuilder, SslContextRef, SslFiletype, SslMethod, SslMode,
    SslOptions, SslVerifyMode,
};
use openssl::stack::StackRef;
use openssl::x509::verify::{X509CheckFlags, X509VerifyFlags};
use openssl_sys as sys;
use parking_lot::RwLock;
use std::ffi::CString;
use std::fmt;
use std::io;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

pub use crate::sni::{SniCallback, SniRequest};

const SESSION_ID_CONTEXT: &[u8] = b"sslcore";

/// SSL_VERIFY_POST_HANDSHAKE
const VERIFY_POST_HANDSHAKE: c_int = 0x08;

/// Cipher suite as reported by [`TlsContext::get_ciphers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherInfo {
    pub id: u32,
    pub name: String,
    pub protocol: String,
    pub description: String,
    pub strength_bits: i32,
    pub alg_bits: i32,
}

impl CipherInfo {
    fn from_ref(cipher: &ssl::SslCipherRef) -> Self {
        let [hi, lo] = cipher.protocol_id();
        let bits = cipher.bits();
        CipherInfo {
            id: 0x0300_0000 | (u32::from(hi) << 8) | u32::from(lo),
            name: cipher.name().to_string(),
            protocol: cipher.version().to_string(),
            description: cipher.description().trim_end().to_string(),
            strength_bits: bits.secret,
            alg_bits: bits.algorithm,
        }
    }
}

/// Session cache counters of a context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub number: i64,
    pub connect: i64,
    pub connect_good: i64,
    pub connect_renegotiate: i64,
    pub accept: i64,
    pub accept_good: i64,
    pub accept_renegotiate: i64,
    pub hits: i64,
    pub cb_hits: i64,
    pub misses: i64,
    pub timeouts: i64,
    pub cache_full: i64,
}

struct ContextSettings {
    check_hostname: bool,
    verify_flags: X509VerifyFlags,
    host_flags: X509CheckFlags,
    post_handshake_auth: bool,
    sni_installed: bool,
}

struct ContextInner {
    builder: RwLock<SslContextBuilder>,
    protocol: Protocol,
    capabilities: Capabilities,
    settings: RwLock<ContextSettings>,
    sni: Arc<RwLock<Option<SniCallback>>>,
}

/// Shared TLS context: policy, credentials, trust store and callbacks
#[derive(Clone)]
pub struct TlsContext {
    inner: Arc<ContextInner>,
}

pub(crate) fn builder_as_ctx(builder: &SslContextBuilder) -> &SslContextRef {
    unsafe { SslContextRef::from_ptr(builder.as_ptr()) }
}

fn ssl_failure(message: &str) -> TlsError {
    let state = ErrorState {
        code: SslErrorCode::Ssl,
        errno: 0,
    };
    TlsError::Protocol(ProtocolError::new(state, message))
}

/// Paths handed to the engine must be valid C strings
fn check_path(path: &Path) -> Result<CString> {
    path.to_str()
        .and_then(|s| CString::new(s).ok())
        .ok_or_else(|| {
            TlsError::InvalidArgument(format!("invalid path: {}", path.display()))
        })
}

fn clear_errno() {
    errno::set_errno(errno::Errno(0));
}

fn last_errno() -> i32 {
    errno::errno().0
}

impl TlsContext {
    /// Create a context for `protocol` with hardened defaults
    pub fn new(protocol: Protocol) -> Result<Self> {
        let capabilities = engine::init()?;

        let method = match protocol {
            Protocol::Sslv2 => {
                return Err(TlsError::Unsupported(
                    "SSLv2 is not supported by the TLS library".to_string(),
                ))
            }
            Protocol::Sslv3 => {
                Capabilities::require(capabilities.sslv3, "SSLv3")?;
                SslMethod::tls()
            }
            Protocol::Tlsv1 => {
                Capabilities::require(capabilities.tlsv1, "TLSv1")?;
                SslMethod::tls()
            }
            Protocol::Tlsv1_1 => {
                Capabilities::require(capabilities.tlsv1_1, "TLSv1.1")?;
                SslMethod::tls()
            }
            Protocol::Tlsv1_2 => {
                Capabilities::require(capabilities.tlsv1_2, "TLSv1.2")?;
                SslMethod::tls()
            }
            Protocol::Tls => SslMethod::tls(),
            Protocol::TlsClient => SslMethod::tls_client(),
            Protocol::TlsServer => SslMethod::tls_server(),
        };

        let mut builder = SslContextBuilder::new(method)?;

        if let Some(version) = protocol.pinned_version() {
            builder.set_min_proto_version(Some(version))?;
            builder.set_max_proto_version(Some(version))?;
        }

        let check_hostname = protocol == Protocol::TlsClient;
        let verify_mode = if check_hostname {
            VerifyMode::Required
        } else {
            VerifyMode::None
        };
        builder.set_verify(verify_mode.to_openssl());

        let mut options = SslOptions::ALL & !SslOptions::DONT_INSERT_EMPTY_FRAGMENTS;
        options |= SslOptions::NO_SSLV2;
        if protocol != Protocol::Sslv3 {
            options |= SslOptions::NO_SSLV3;
        }
        options |= SslOptions::NO_COMPRESSION;
        options |= SslOptions::CIPHER_SERVER_PREFERENCE;
        options |= SslOptions::SINGLE_DH_USE;
        options |= SslOptions::SINGLE_ECDH_USE;
        builder.set_options(options);

        builder.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER | SslMode::AUTO_RETRY);

        builder
            .set_cipher_list(DEFAULT_CIPHERS)
            .map_err(|_| ssl_failure("No cipher can be selected."))?;

        if capabilities.post_handshake_auth {
            unsafe { ffi::SSL_CTX_set_post_handshake_auth(builder.as_ptr(), 0) };
        }

        builder.set_session_id_context(SESSION_ID_CONTEXT)?;

        log::debug!(
            "created TLS context for {:?} (verify_mode={:?}, check_hostname={})",
            protocol,
            verify_mode,
            check_hostname
        );

        Ok(TlsContext {
            inner: Arc::new(ContextInner {
                builder: RwLock::new(builder),
                protocol,
                capabilities,
                settings: RwLock::new(ContextSettings {
                    check_hostname,
                    verify_flags: X509VerifyFlags::TRUSTED_FIRST,
                    host_flags: X509CheckFlags::NO_PARTIAL_WILDCARDS,
                    post_handshake_auth: false,
                    sni_installed: false,
                }),
                sni: Arc::new(RwLock::new(None)),
            }),
        })
    }

    /// Run `f` against the engine context
    pub(crate) fn with_ctx<R>(&self, f: impl FnOnce(&SslContextRef) -> R) -> R {
        let builder = self.inner.builder.read();
        f(builder_as_ctx(&builder))
    }

    /// Whether both handles refer to the same context
    pub fn same_context(&self, other: &TlsContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.with_ctx(|ctx| VerifyMode::from_openssl(ctx.verify_mode()))
    }

    pub fn set_verify_mode(&self, mode: VerifyMode) -> Result<()> {
        let mut builder = self.inner.builder.write();
        if mode == VerifyMode::None && self.inner.settings.read().check_hostname {
            return Err(TlsError::InvalidConfig(
                "Cannot set verify_mode to CERT_NONE when check_hostname is enabled.".to_string(),
            ));
        }
        builder.set_verify(mode.to_openssl());
        Ok(())
    }

    pub fn check_hostname(&self) -> bool {
        self.inner.settings.read().check_hostname
    }

    pub fn set_check_hostname(&self, check: bool) -> Result<()> {
        let builder = self.inner.builder.read();
        if check && builder_as_ctx(&builder).verify_mode() == SslVerifyMode::NONE {
            return Err(TlsError::InvalidConfig(
                "check_hostname needs a SSL context with either CERT_OPTIONAL or CERT_REQUIRED"
                    .to_string(),
            ));
        }
        self.inner.settings.write().check_hostname = check;
        Ok(())
    }

    pub fn verify_flags(&self) -> X509VerifyFlags {
        self.inner.settings.read().verify_flags
    }

    /// Flags applied to the verification parameters of new connections
    pub fn set_verify_flags(&self, flags: X509VerifyFlags) {
        self.inner.settings.write().verify_flags = flags;
    }

    pub fn host_flags(&self) -> X509CheckFlags {
        self.inner.settings.read().host_flags
    }

    pub fn set_host_flags(&self, flags: X509CheckFlags) {
        self.inner.settings.write().host_flags = flags;
    }

    fn require_version_bounds(&self) -> Result<()> {
        Capabilities::require(self.inner.capabilities.min_max_version, "min/max version")?;
        if !self.inner.protocol.allows_version_bounds() {
            return Err(TlsError::InvalidConfig(
                "The context's protocol doesn't support modification of highest and lowest version."
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn minimum_version(&self) -> TlsVersion {
        self.inner
            .builder
            .write()
            .min_proto_version()
            .and_then(TlsVersion::from_openssl_version)
            .unwrap_or(TlsVersion::MinimumSupported)
    }

    pub fn set_minimum_version(&self, version: TlsVersion) -> Result<()> {
        self.require_version_bounds()?;
        let version = match version {
            TlsVersion::MaximumSupported => TlsVersion::Tls13.to_openssl_version(),
            v => v.to_openssl_version(),
        };
        self.inner
            .builder
            .write()
            .set_min_proto_version(version)
            .map_err(|_| TlsError::InvalidConfig("Unsupported protocol version".to_string()))
    }

    pub fn maximum_version(&self) -> TlsVersion {
        self.inner
            .builder
            .write()
            .max_proto_version()
            .and_then(TlsVersion::from_openssl_version)
            .unwrap_or(TlsVersion::MaximumSupported)
    }

    pub fn set_maximum_version(&self, version: TlsVersion) -> Result<()> {
        self.require_version_bounds()?;
        let version = match version {
            TlsVersion::MinimumSupported => TlsVersion::Tls10.to_openssl_version(),
            v => v.to_openssl_version(),
        };
        self.inner
            .builder
            .write()
            .set_max_proto_version(version)
            .map_err(|_| TlsError::InvalidConfig("Unsupported protocol version".to_string()))
    }

    /// Set the TLS 1.2 and below cipher list
    pub fn set_ciphers(&self, ciphers: &str) -> Result<()> {
        if ciphers.contains('\0') {
            return Err(TlsError::InvalidArgument(
                "embedded null character".to_string(),
            ));
        }
        self.inner
            .builder
            .write()
            .set_cipher_list(ciphers)
            .map_err(|_| ssl_failure("No cipher can be selected."))
    }

    /// Enabled cipher suites in preference order
    pub fn get_ciphers(&self) -> Vec<CipherInfo> {
        self.with_ctx(|ctx| {
            let stack = unsafe { ffi::SSL_CTX_get_ciphers(ctx.as_ptr()) };
            if stack.is_null() {
                return Vec::new();
            }
            let stack: &StackRef<SslCipher> = unsafe { StackRef::from_ptr(stack) };
            stack.iter().map(CipherInfo::from_ref).collect()
        })
    }

    /// Set ALPN protocols, most preferred first
    pub fn set_alpn_protocols(&self, protocols: &[&[u8]]) -> Result<()> {
        Capabilities::require(self.inner.capabilities.alpn, "ALPN")?;

        let mut wire = Vec::new();
        for proto in protocols {
            if proto.is_empty() || proto.len() > 255 {
                return Err(TlsError::InvalidArgument(format!(
                    "ALPN protocol names must be 1 to 255 bytes, got {}",
                    proto.len()
                )));
            }
            wire.push(proto.len() as u8);
            wire.extend_from_slice(proto);
        }
        if wire.len() > libc::c_uint::MAX as usize {
            return Err(TlsError::Overflow(format!(
                "protocols longer than {} bytes",
                libc::c_uint::MAX
            )));
        }

        let mut builder = self.inner.builder.write();
        builder.set_alpn_protos(&wire)?;
        builder.set_alpn_select_callback(move |_, client| {
            let proto = ssl::select_next_proto(&wire, client).ok_or(ssl::AlpnError::NOACK)?;
            // hand back a slice of the client's list so it outlives this closure
            let pos = client
                .windows(proto.len())
                .position(|w| w == proto)
                .ok_or(ssl::AlpnError::NOACK)?;
            Ok(&client[pos..pos + proto.len()])
        });
        Ok(())
    }

    /// Current SNI callback
    pub fn sni_callback(&self) -> Option<SniCallback> {
        self.inner.sni.read().clone()
    }

    /// Install or clear the server-side SNI callback
    pub fn set_sni_callback(&self, callback: Option<SniCallback>) -> Result<()> {
        if self.inner.protocol == Protocol::TlsClient {
            return Err(TlsError::InvalidConfig(
                "sni_callback cannot be set on TLS_CLIENT context".to_string(),
            ));
        }
        Capabilities::require(self.inner.capabilities.sni, "SNI")?;

        let mut builder = self.inner.builder.write();
        let mut settings = self.inner.settings.write();
        if !settings.sni_installed {
            let slot = self.inner.sni.clone();
            builder.set_servername_callback(move |ssl, alert| sni::dispatch(&slot, ssl, alert));
            settings.sni_installed = true;
        }
        *self.inner.sni.write() = callback;
        Ok(())
    }

    pub fn post_handshake_auth(&self) -> bool {
        self.inner.settings.read().post_handshake_auth
    }

    /// Allow TLS 1.3 post-handshake client authentication
    pub fn set_post_handshake_auth(&self, enabled: bool) -> Result<()> {
        Capabilities::require(
            self.inner.capabilities.post_handshake_auth,
            "post-handshake authentication",
        )?;
        let builder = self.inner.builder.write();
        unsafe { ffi::SSL_CTX_set_post_handshake_auth(builder.as_ptr(), c_int::from(enabled)) };
        self.inner.settings.write().post_handshake_auth = enabled;
        Ok(())
    }

    pub fn num_tickets(&self) -> usize {
        self.with_ctx(|ctx| ctx.num_tickets())
    }

    /// Session tickets sent after a TLS 1.3 handshake
    pub fn set_num_tickets(&self, n: usize) -> Result<()> {
        Capabilities::require(self.inner.capabilities.session_tickets, "num_tickets")?;
        if self.inner.protocol == Protocol::TlsClient {
            return Err(TlsError::InvalidConfig(
                "SSLContext is not a server context.".to_string(),
            ));
        }
        self.inner.builder.write().set_num_tickets(n)?;
        Ok(())
    }

    pub fn cert_store_stats(&self) -> CertStoreStats {
        self.with_ctx(|ctx| store::stats(ctx.cert_store()))
    }

    /// CA certificates in the trust store
    pub fn get_ca_certs(&self, binary: bool) -> Result<Vec<CertData>> {
        let certs = self.with_ctx(|ctx| store::ca_certs(ctx.cert_store()));
        certs
            .iter()
            .map(|cert| CertData::from_x509_ref(cert, binary))
            .collect()
    }

    pub fn session_stats(&self) -> SessionStats {
        let builder = self.inner.builder.read();
        let ctx = builder.as_ptr();
        let stat = |cmd: c_int| -> i64 {
            unsafe { sys::SSL_CTX_ctrl(ctx, cmd, 0, ptr::null_mut()) as i64 }
        };
        SessionStats {
            number: stat(ffi::SSL_CTRL_SESS_NUMBER),
            connect: stat(ffi::SSL_CTRL_SESS_CONNECT),
            connect_good: stat(ffi::SSL_CTRL_SESS_CONNECT_GOOD),
            connect_renegotiate: stat(ffi::SSL_CTRL_SESS_CONNECT_RENEGOTIATE),
            accept: stat(ffi::SSL_CTRL_SESS_ACCEPT),
            accept_good: stat(ffi::SSL_CTRL_SESS_ACCEPT_GOOD),
            accept_renegotiate: stat(ffi::SSL_CTRL_SESS_ACCEPT_RENEGOTIATE),
            hits: stat(ffi::SSL_CTRL_SESS_HIT),
            cb_hits: stat(ffi::SSL_CTRL_SESS_CB_HIT),
            misses: stat(ffi::SSL_CTRL_SESS_MISSES),
            timeouts: stat(ffi::SSL_CTRL_SESS_TIMEOUTS),
            cache_full: stat(ffi::SSL_CTRL_SESS_CACHE_FULL),
        }
    }

    /// Trust the system default locations (honours SSL_CERT_FILE / SSL_CERT_DIR)
    pub fn set_default_verify_paths(&self) -> Result<()> {
        self.inner.builder.write().set_default_verify_paths()?;
        Ok(())
    }

    /// Load Diffie-Hellman parameters from a PEM file
    pub fn load_dh_params(&self, path: &Path) -> Result<()> {
        let pem = std::fs::read(path).map_err(|source| TlsError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let dh = Dh::params_from_pem(&pem)?;
        self.inner.builder.write().set_tmp_dh(&dh)?;
        Ok(())
    }

    /// Select the curve for ephemeral ECDH key exchange by short name
    pub fn set_ecdh_curve(&self, name: &str) -> Result<()> {
        Capabilities::require(self.inner.capabilities.ecdh, "ECDH")?;
        let cname = CString::new(name)
            .map_err(|_| TlsError::InvalidArgument("embedded null character".to_string()))?;
        let nid = unsafe { ffi::OBJ_sn2nid(cname.as_ptr()) };
        if nid == 0 {
            return Err(TlsError::InvalidArgument(format!(
                "unknown elliptic curve name {:?}",
                name
            )));
        }
        let key = EcKey::from_curve_name(Nid::from_raw(nid))?;
        self.inner.builder.write().set_tmp_ecdh(&key)?;
        Ok(())
    }

    /// Load a certificate chain and matching private key
    ///
    /// `keyfile` defaults to `certfile`. A `password` is only consulted if
    /// the key is encrypted.
    pub fn load_cert_chain(
        &self,
        certfile: &Path,
        keyfile: Option<&Path>,
        password: Option<Password>,
    ) -> Result<()> {
        let keyfile = keyfile.unwrap_or(certfile);
        check_path(certfile)?;
        check_path(keyfile)?;

        let mut builder = self.inner.builder.write();
        let ctx = builder.as_ptr();
        // Without a password the engine must not fall back to prompting on a tty.
        let scope = PasswordScope::install(ctx, password.unwrap_or(Password::Bytes(Vec::new())));
        let stashed = || scope.take_error();

        clear_errno();
        if let Err(stack) = builder.set_certificate_chain_file(certfile) {
            return Err(stashed().unwrap_or_else(|| file_error(certfile, stack)));
        }

        clear_errno();
        if let Err(stack) = builder.set_private_key_file(keyfile, SslFiletype::PEM) {
            return Err(stashed().unwrap_or_else(|| file_error(keyfile, stack)));
        }

        builder.check_private_key()?;
        log::debug!("loaded certificate chain from {}", certfile.display());
        Ok(())
    }

    /// Add trust anchors from a PEM file, a hashed directory and/or memory
    pub fn load_verify_locations(
        &self,
        cafile: Option<&Path>,
        capath: Option<&Path>,
        cadata: Option<&CaData>,
    ) -> Result<()> {
        if cafile.is_none() && capath.is_none() && cadata.is_none() {
            return Err(TlsError::InvalidArgument(
                "cafile, capath and cadata cannot be all omitted".to_string(),
            ));
        }

        let mut builder = self.inner.builder.write();

        if let Some(data) = cadata {
            store::load_cadata(builder.cert_store_mut(), data)?;
        }

        if cafile.is_some() || capath.is_some() {
            let cafile_c = cafile.map(check_path).transpose()?;
            let capath_c = capath.map(check_path).transpose()?;
            clear_errno();
            let ret = unsafe {
                sys::SSL_CTX_load_verify_locations(
                    builder.as_ptr(),
                    cafile_c.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                    capath_c.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                )
            };
            if ret != 1 {
                let path = cafile.or(capath).unwrap_or(Path::new(""));
                return Err(file_error(path, ErrorStack::get()));
            }
        }

        Ok(())
    }

    /// New engine connection carrying this context's per-connection policy
    pub(crate) fn new_ssl(&self, role: Role) -> Result<Ssl> {
        let mut ssl = self.with_ctx(Ssl::new)?;

        let settings = self.inner.settings.read();
        let param = ssl.param_mut();
        unsafe {
            sys::X509_VERIFY_PARAM_set_flags(param.as_ptr(), settings.verify_flags.bits());
        }
        param.set_hostflags(settings.host_flags);

        if settings.post_handshake_auth && role == Role::Server {
            let mode = ssl.verify_mode().bits() | VERIFY_POST_HANDSHAKE;
            unsafe { sys::SSL_set_verify(ssl.as_ptr(), mode, None) };
        }

        Ok(ssl)
    }

    /// Client connection over `sock`
    pub fn connect<S>(&self, sock: S, hostname: Option<&str>) -> Result<TlsConnection>
    where
        S: SocketLike + 'static,
    {
        TlsConnection::new(self, Transport::Socket(Box::new(sock)), Role::Client, hostname)
    }

    /// Server connection over `sock`
    pub fn accept<S>(&self, sock: S) -> Result<TlsConnection>
    where
        S: SocketLike + 'static,
    {
        TlsConnection::new(self, Transport::Socket(Box::new(sock)), Role::Server, None)
    }

    /// Connection over a pair of memory buffers
    pub fn wrap_bio(
        &self,
        incoming: MemoryBio,
        outgoing: MemoryBio,
        role: Role,
        hostname: Option<&str>,
    ) -> Result<TlsConnection> {
        TlsConnection::new(
            self,
            Transport::Memory { incoming, outgoing },
            role,
            hostname,
        )
    }
}

/// OS errors during file access win over the engine's own report
fn file_error(path: &Path, stack: ErrorStack) -> TlsError {
    match last_errno() {
        0 => stack.into(),
        errno => TlsError::File {
            path: path.to_path_buf(),
            source: io::Error::from_raw_os_error(errno),
        },
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("protocol", &self.inner.protocol)
            .field("check_hostname", &self.check_hostname())
            .finish_non_exhaustive()
    }
}
