//! Resumable TLS sessions

use crate::context::TlsContext;
use crate::ffi;
use foreign_types_shared::ForeignTypeRef;
use openssl::ssl::{SslSession, SslSessionRef};
use std::fmt;

/// A negotiated session, reusable for abbreviated handshakes
///
/// Sessions compare equal when their ids match.
#[derive(Clone)]
pub struct TlsSession {
    session: SslSession,
    context: TlsContext,
}

impl TlsSession {
    pub(crate) fn new(session: SslSession, context: TlsContext) -> Self {
        TlsSession { session, context }
    }

    pub(crate) fn raw(&self) -> &SslSessionRef {
        &self.session
    }

    pub fn id(&self) -> &[u8] {
        self.session.id()
    }

    /// Creation time in seconds since the epoch
    pub fn time(&self) -> i64 {
        self.session.time() as i64
    }

    /// Lifetime in seconds
    pub fn timeout(&self) -> i64 {
        self.session.timeout() as i64
    }

    pub fn has_ticket(&self) -> bool {
        unsafe { ffi::SSL_SESSION_has_ticket(self.session.as_ptr()) != 0 }
    }

    pub fn ticket_lifetime_hint(&self) -> u64 {
        unsafe { ffi::SSL_SESSION_get_ticket_lifetime_hint(self.session.as_ptr()) as u64 }
    }

    /// Context the session was negotiated under
    pub fn context(&self) -> &TlsContext {
        &self.context
    }
}

impl PartialEq for TlsSession {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TlsSession {}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id: String = self.id().iter().map(|b| format!("{:02x}", b)).collect();
        f.debug_struct("TlsSession")
            .field("id", &id)
            .field("time", &self.time())
            .field("timeout", &self.timeout())
            .finish()
    }
}
