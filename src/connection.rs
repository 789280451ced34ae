//! TLS connection state machine
//!
//! A [`TlsConnection`] drives one engine connection over either a socket
//! ([`SocketLike`]) or a pair of [`MemoryBio`] buffers. Handshake, read,
//! write and shutdown share one retry discipline: call the engine, classify
//! the outcome, and on WANT_READ / WANT_WRITE wait for the socket with
//! whatever is left of the socket's timeout before calling again.

use crate::bio::MemoryBio;
use crate::cert::{CertData, CertInfo};
use crate::config::{Role, VerifyMode};
use crate::context::TlsContext;
use crate::deadline::Deadline;
use crate::engine::{self, Capabilities, CHANNEL_BINDING_TYPES};
use crate::error::{
    CertificateError, ErrorState, ProtocolError, SessionError, SslErrorCode, TlsError, Want,
};
use crate::ffi;
use crate::poll::{self, SocketStatus};
use crate::session::TlsSession;
use crate::socket::SocketLike;
use crate::Result;
use foreign_types_shared::ForeignTypeRef;
use libc::c_int;
use openssl::error::ErrorStack;
use openssl::ssl::{
    self, ErrorCode, ShutdownResult, ShutdownState, SslCipherRef, SslRef, SslStream,
};
use openssl::stack::StackRef;
use openssl::x509::X509VerifyResult;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::{Arc, Weak};

/// SSL_R_CERTIFICATE_VERIFY_FAILED
const SSL_R_CERTIFICATE_VERIFY_FAILED: c_int = 134;

/// Shutdown gives up waiting for the peer after this many zero returns
const MAX_SHUTDOWN_ZEROS: u32 = 2;

/// Connection state reachable from engine callbacks
pub(crate) struct ConnShared {
    pub(crate) owner: Option<Weak<dyn Any + Send + Sync>>,
    pub(crate) context: TlsContext,
    pub(crate) callback_error: Option<TlsError>,
}

/// Byte transport under the engine
pub(crate) enum Transport {
    Socket(Box<dyn SocketLike>),
    Memory {
        incoming: MemoryBio,
        outgoing: MemoryBio,
    },
}

impl Transport {
    fn socket(&self) -> Option<&dyn SocketLike> {
        match self {
            Transport::Socket(sock) => Some(sock.as_ref()),
            Transport::Memory { .. } => None,
        }
    }

    fn socket_mut(&mut self) -> Option<&mut (dyn SocketLike + 'static)> {
        match self {
            Transport::Socket(sock) => Some(sock.as_mut()),
            Transport::Memory { .. } => None,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Socket(sock) => sock.read(buf),
            Transport::Memory { incoming, .. } => incoming.fill(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Socket(sock) => sock.write(buf),
            Transport::Memory { outgoing, .. } => Ok(outgoing.feed(buf)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Socket(sock) => sock.flush(),
            Transport::Memory { .. } => Ok(()),
        }
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unstarted,
    Handshaking,
    Established,
    ShuttingDown,
    Closed,
}

/// (name, protocol version, secret bits) of a cipher suite
pub type CipherTuple = (&'static str, &'static str, i32);

fn cipher_tuple(cipher: &SslCipherRef) -> CipherTuple {
    (cipher.name(), cipher.version(), cipher.bits().secret)
}

/// Reject buffers the engine cannot address with a C int
pub(crate) fn check_int_len(len: usize) -> Result<()> {
    if len > c_int::MAX as usize {
        return Err(TlsError::Overflow(format!(
            "string longer than {} bytes",
            c_int::MAX
        )));
    }
    Ok(())
}

/// Validate `name` and attach it to `ssl` as SNI and/or verification target
fn apply_hostname(ssl: &mut SslRef, name: &str, check_hostname: bool) -> Result<()> {
    if name.is_empty() || name.starts_with('.') {
        return Err(TlsError::InvalidConfig(
            "server_hostname cannot be an empty string or start with a leading dot.".to_string(),
        ));
    }
    if !name.is_ascii() || name.contains('\0') {
        return Err(TlsError::InvalidConfig(format!(
            "server_hostname {:?} must be an ASCII name without NUL",
            name
        )));
    }

    match name.parse::<IpAddr>() {
        Ok(ip) => {
            if check_hostname {
                ssl.param_mut().set_ip(ip)?;
            }
        }
        Err(_) => {
            ssl.set_hostname(name)?;
            if check_hostname {
                ssl.param_mut().set_host(name)?;
            }
        }
    }
    Ok(())
}

/// Turn a terminal engine failure into the public error
fn engine_error(
    shared: &Mutex<ConnShared>,
    ssl: &SslRef,
    err: ssl::Error,
    state: ErrorState,
) -> TlsError {
    if let Some(callback_error) = shared.lock().callback_error.take() {
        return callback_error;
    }

    match state.code {
        SslErrorCode::Syscall => match err.into_io_error() {
            Ok(io) => TlsError::Io(io),
            Err(err) => TlsError::Protocol(ProtocolError::from_engine(state, &err)),
        },
        SslErrorCode::Ssl => {
            let verify_failed = err
                .ssl_error()
                .and_then(|stack| stack.errors().last())
                .map_or(false, |e| e.reason_code() == SSL_R_CERTIFICATE_VERIFY_FAILED);
            let verify = ssl.verify_result();
            if verify_failed && verify != X509VerifyResult::OK {
                TlsError::Certificate(CertificateError::new(
                    verify.as_raw(),
                    verify.error_string(),
                ))
            } else {
                TlsError::Protocol(ProtocolError::from_engine(state, &err))
            }
        }
        _ => TlsError::Protocol(ProtocolError::from_engine(state, &err)),
    }
}

fn timeout_error(op: &str) -> TlsError {
    TlsError::Timeout(format!("The {} operation timed out", op))
}

/// What one engine shutdown call achieved
pub(crate) enum Round<E> {
    /// Peer's close-notify received
    Received,
    /// Our close-notify sent, peer's still outstanding
    Sent,
    /// Transport became ready, call again
    Retry,
    Fail(E),
}

/// Repeat shutdown rounds until done; returns whether a zero return was seen
pub(crate) fn drive_shutdown<E>(mut round: impl FnMut() -> Round<E>) -> std::result::Result<bool, E> {
    let mut zeros = 0;
    loop {
        match round() {
            Round::Received => return Ok(zeros > 0),
            Round::Sent => {
                zeros += 1;
                if zeros >= MAX_SHUTDOWN_ZEROS {
                    return Ok(true);
                }
            }
            Round::Retry => {}
            Round::Fail(e) => return Err(e),
        }
    }
}

/// One TLS connection over a socket or a memory BIO pair
pub struct TlsConnection {
    stream: SslStream<Transport>,
    role: Role,
    state: HandshakeState,
    handshake_done: bool,
    shutdown_seen_zero: bool,
    server_hostname: Option<String>,
    shared: Arc<Mutex<ConnShared>>,
    last_error: ErrorState,
}

impl TlsConnection {
    pub(crate) fn new(
        ctx: &TlsContext,
        transport: Transport,
        role: Role,
        hostname: Option<&str>,
    ) -> Result<Self> {
        if role == Role::Server && hostname.is_some() {
            return Err(TlsError::InvalidConfig(
                "server_hostname can only be specified in client mode".to_string(),
            ));
        }
        let check_hostname = ctx.check_hostname();
        if role == Role::Client && check_hostname && hostname.is_none() {
            return Err(TlsError::InvalidConfig(
                "check_hostname requires server_hostname".to_string(),
            ));
        }

        let engine = engine::engine()?;
        let mut ssl = ctx.new_ssl(role)?;

        let shared = Arc::new(Mutex::new(ConnShared {
            owner: None,
            context: ctx.clone(),
            callback_error: None,
        }));
        ssl.set_ex_data(engine.conn_index, shared.clone());

        match role {
            Role::Client => ssl.set_connect_state(),
            Role::Server => ssl.set_accept_state(),
        }
        if let Some(name) = hostname {
            apply_hostname(&mut ssl, name, check_hostname)?;
        }

        let stream = SslStream::new(ssl, transport)?;
        log::trace!("new {:?} connection (hostname={:?})", role, hostname);

        Ok(TlsConnection {
            stream,
            role,
            state: HandshakeState::Unstarted,
            handshake_done: false,
            shutdown_seen_zero: false,
            server_hostname: hostname.map(str::to_owned),
            shared,
            last_error: ErrorState::NONE,
        })
    }

    fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    fn ssl_mut(&mut self) -> &mut SslRef {
        // SslStream hands out only a shared handle; &mut self makes it unique.
        unsafe { SslRef::from_ptr_mut(self.stream.ssl().as_ptr()) }
    }

    /// Check the socket, apply its blocking mode and start the deadline
    fn prepare(&self) -> Result<Deadline> {
        match self.stream.get_ref().socket() {
            None => Ok(Deadline::NonBlocking),
            Some(sock) => {
                if sock.fileno() < 0 {
                    return Err(TlsError::ConnectionClosed);
                }
                let timeout = sock.timeout();
                sock.set_nonblocking(timeout.is_some())?;
                Ok(Deadline::from_timeout(timeout))
            }
        }
    }

    /// Run `call` until it succeeds, fails terminally or the deadline passes
    fn run_io<T>(
        &mut self,
        op: &'static str,
        mut call: impl FnMut(&mut SslStream<Transport>) -> std::result::Result<T, ssl::Error>,
    ) -> Result<T> {
        let deadline = self.prepare()?;
        loop {
            let result = call(&mut self.stream);
            let state = ErrorState::classify(&result);
            self.last_error = state;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let want = match state.code.wants() {
                Some(want) => want,
                None => return Err(engine_error(&self.shared, self.stream.ssl(), err, state)),
            };

            let status = poll::wait(self.stream.get_ref().socket(), want, &deadline);
            log::trace!("{} wants {:?}: {:?}", op, want, status);
            match status {
                SocketStatus::TimedOut => return Err(timeout_error(op)),
                SocketStatus::Closed => return Err(TlsError::ConnectionClosed),
                SocketStatus::TooLarge => return Err(TlsError::NotSelectable),
                SocketStatus::NonBlocking => {
                    return Err(engine_error(&self.shared, self.stream.ssl(), err, state))
                }
                SocketStatus::Blocking | SocketStatus::Ready => {}
            }
        }
    }

    fn mark_established(&mut self) {
        if !self.handshake_done && self.ssl().is_init_finished() {
            self.handshake_done = true;
            self.state = HandshakeState::Established;
            log::debug!(
                "handshake complete: {} {}",
                self.ssl().version_str(),
                self.ssl()
                    .current_cipher()
                    .map_or("(none)", |c| c.name())
            );
        }
    }

    /// Perform the TLS handshake
    pub fn do_handshake(&mut self) -> Result<()> {
        if self.state == HandshakeState::Unstarted {
            self.state = HandshakeState::Handshaking;
        }
        self.run_io("handshake", |stream| stream.do_handshake())?;
        self.mark_established();
        Ok(())
    }

    /// Read up to `buf.len()` bytes of application data; 0 means the peer
    /// closed the TLS session
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.run_io("read", |stream| match stream.ssl_read(&mut buf[..]) {
            Err(e)
                if e.code() == ErrorCode::ZERO_RETURN
                    && stream.get_shutdown().contains(ShutdownState::RECEIVED) =>
            {
                Ok(0)
            }
            other => other,
        })?;
        self.mark_established();
        Ok(n)
    }

    /// Read up to `len` bytes of application data
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        let n = self.read_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write application data, returning the number of bytes consumed
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        check_int_len(data.len())?;
        if data.is_empty() {
            return Ok(0);
        }
        let n = self.run_io("write", |stream| stream.ssl_write(data))?;
        self.mark_established();
        Ok(n)
    }

    /// Exchange close-notify alerts
    ///
    /// Returns the underlying socket in socket mode, `None` over memory BIOs.
    pub fn shutdown(&mut self) -> Result<Option<&mut (dyn SocketLike + 'static)>> {
        let deadline = self.prepare()?;
        self.state = HandshakeState::ShuttingDown;

        let stream = &mut self.stream;
        let shared = &self.shared;
        let last_error = &mut self.last_error;

        let seen_zero = drive_shutdown(|| {
            let result = stream.shutdown();
            let state = ErrorState::classify(&result);
            *last_error = state;
            let err = match result {
                Ok(ShutdownResult::Received) => return Round::Received,
                Ok(ShutdownResult::Sent) => return Round::Sent,
                Err(err) => err,
            };

            let want = match state.code.wants() {
                Some(want) => want,
                None => return Round::Fail(engine_error(shared, stream.ssl(), err, state)),
            };
            match poll::wait(stream.get_ref().socket(), want, &deadline) {
                SocketStatus::TimedOut => Round::Fail(timeout_error(match want {
                    Want::Read => "read",
                    Want::Write => "write",
                })),
                SocketStatus::Closed => Round::Fail(TlsError::ConnectionClosed),
                SocketStatus::TooLarge => Round::Fail(TlsError::NotSelectable),
                SocketStatus::Ready => Round::Retry,
                SocketStatus::Blocking | SocketStatus::NonBlocking => {
                    Round::Fail(engine_error(shared, stream.ssl(), err, state))
                }
            }
        })?;

        self.shutdown_seen_zero = seen_zero;
        self.state = HandshakeState::Closed;
        log::debug!("TLS shutdown complete");
        Ok(self.stream.get_mut().socket_mut())
    }

    /// Channel binding data of the given kind, `None` before the handshake
    pub fn get_channel_binding(&self, kind: &str) -> Result<Option<Vec<u8>>> {
        if !CHANNEL_BINDING_TYPES.contains(&kind) {
            return Err(TlsError::Unsupported(format!(
                "'{}' channel binding type not implemented",
                kind
            )));
        }
        Capabilities::require(engine::engine()?.capabilities.tls_unique, "tls-unique")?;

        let ssl = self.ssl();
        let mut buf = [0u8; 64];
        // The first Finished message of the handshake
        let len = if ssl.session_reused() ^ (self.role == Role::Client) {
            ssl.finished(&mut buf)
        } else {
            ssl.peer_finished(&mut buf)
        };
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(buf[..len.min(buf.len())].to_vec()))
    }

    /// Set the server name (SNI and hostname check) before the handshake
    pub fn configure_hostname(&mut self, name: &str) -> Result<()> {
        if self.role == Role::Server {
            return Err(TlsError::InvalidConfig(
                "server_hostname can only be specified in client mode".to_string(),
            ));
        }
        if self.state != HandshakeState::Unstarted {
            return Err(TlsError::State(
                "server_hostname cannot be changed after the handshake started".to_string(),
            ));
        }
        let check_hostname = self.context().check_hostname();
        apply_hostname(self.ssl_mut(), name, check_hostname)?;
        self.server_hostname = Some(name.to_owned());
        Ok(())
    }

    /// Peer certificate; `None` if the peer sent none
    ///
    /// The decoded form is empty when the certificate was not verified.
    pub fn getpeercert(&self, binary: bool) -> Result<Option<CertData>> {
        if !self.handshake_done {
            return Err(TlsError::State("handshake not done yet".to_string()));
        }
        let cert = match self.ssl().peer_certificate() {
            Some(cert) => cert,
            None => return Ok(None),
        };
        if !binary && VerifyMode::from_openssl(self.ssl().verify_mode()) == VerifyMode::None {
            return Ok(Some(CertData::Decoded(CertInfo::default())));
        }
        CertData::from_x509_ref(&cert, binary).map(Some)
    }

    pub fn selected_alpn_protocol(&self) -> Option<&[u8]> {
        self.ssl().selected_alpn_protocol()
    }

    /// Ciphers offered by the client that this side also enables
    pub fn shared_ciphers(&self) -> Option<Vec<CipherTuple>> {
        let ssl = self.ssl().as_ptr();
        let (server, client) =
            unsafe { (ffi::SSL_get_ciphers(ssl), ffi::SSL_get_client_ciphers(ssl)) };
        if server.is_null() || client.is_null() {
            return None;
        }
        let server: &StackRef<ssl::SslCipher> = unsafe { StackRef::from_ptr(server) };
        let client: &StackRef<ssl::SslCipher> = unsafe { StackRef::from_ptr(client) };

        let shared = client
            .iter()
            .filter(|c| server.iter().any(|s| s.name() == c.name()))
            .map(cipher_tuple)
            .collect();
        Some(shared)
    }

    pub fn cipher(&self) -> Option<CipherTuple> {
        self.ssl().current_cipher().map(cipher_tuple)
    }

    /// Negotiated compression method
    ///
    /// Contexts always set NO_COMPRESSION, so no method is ever negotiated.
    pub fn compression(&self) -> Option<&'static str> {
        None
    }

    /// Negotiated protocol version, `None` before the handshake
    pub fn version(&self) -> Option<&'static str> {
        if !self.ssl().is_init_finished() {
            return None;
        }
        match self.ssl().version_str() {
            "unknown" => None,
            v => Some(v),
        }
    }

    /// Decrypted bytes buffered inside the engine
    pub fn pending(&self) -> usize {
        self.ssl().pending()
    }

    pub fn session_reused(&self) -> bool {
        self.ssl().session_reused()
    }

    pub fn server_side(&self) -> bool {
        self.role == Role::Server
    }

    pub fn server_hostname(&self) -> Option<&str> {
        self.server_hostname.as_deref()
    }

    pub fn context(&self) -> TlsContext {
        self.shared.lock().context.clone()
    }

    /// Switch the connection to another context
    pub fn set_context(&mut self, ctx: &TlsContext) -> Result<()> {
        let ssl = self.ssl_mut();
        ctx.with_ctx(|engine_ctx| ssl.set_ssl_context(engine_ctx))?;
        self.shared.lock().context = ctx.clone();
        Ok(())
    }

    /// Object handed to SNI callbacks; held weakly
    pub fn owner(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.lock().owner.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_owner<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        self.shared.lock().owner = Some(Arc::downgrade(&owner));
    }

    pub fn clear_owner(&self) {
        self.shared.lock().owner = None;
    }

    /// Classified outcome of the most recent engine call
    pub fn last_error(&self) -> ErrorState {
        self.last_error
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Whether shutdown completed without the peer's close-notify
    pub fn shutdown_seen_zero(&self) -> bool {
        self.shutdown_seen_zero
    }

    /// Ask a TLS 1.3 client for its certificate after the handshake
    pub fn verify_client_post_handshake(&mut self) -> Result<()> {
        Capabilities::require(
            engine::engine()?.capabilities.post_handshake_auth,
            "post-handshake authentication",
        )?;
        let ret = unsafe { ffi::SSL_verify_client_post_handshake(self.ssl().as_ptr()) };
        if ret != 1 {
            return Err(ErrorStack::get().into());
        }
        Ok(())
    }

    /// Session of the completed handshake
    pub fn session(&self) -> Option<TlsSession> {
        if !self.handshake_done {
            return None;
        }
        self.ssl()
            .session()
            .map(|session| TlsSession::new(session.to_owned(), self.context()))
    }

    /// Request resumption of `session` on the next handshake
    pub fn set_session(&mut self, session: &TlsSession) -> Result<()> {
        if !session.context().same_context(&self.context()) {
            return Err(SessionError::ContextMismatch.into());
        }
        if self.role == Role::Server {
            return Err(SessionError::ServerSide.into());
        }
        if self.state != HandshakeState::Unstarted || self.handshake_done {
            return Err(SessionError::HandshakeStarted.into());
        }
        unsafe { self.ssl_mut().set_session(session.raw())? };
        Ok(())
    }

    /// Underlying socket, `None` over memory BIOs
    pub fn get_ref(&self) -> Option<&dyn SocketLike> {
        self.stream.get_ref().socket()
    }
}

impl Read for TlsConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(io::Error::from)
    }
}

impl Write for TlsConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TlsConnection::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.get_mut().flush()
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("server_hostname", &self.server_hostname)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}
