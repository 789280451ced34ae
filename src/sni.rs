//! Server Name Indication callback plumbing

use crate::connection::ConnShared;
use crate::context::TlsContext;
use crate::engine::{self, AlertDescription};
use crate::error::TlsError;
use crate::Result;
use openssl::ssl::{NameType, SniError, SslAlert, SslRef};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Server-side callback run when a ClientHello arrives
///
/// Returning an [`AlertDescription`] aborts the handshake with that alert.
pub type SniCallback =
    Arc<dyn Fn(&mut SniRequest<'_>) -> std::result::Result<(), AlertDescription> + Send + Sync>;

/// The connection being negotiated, as seen by an [`SniCallback`]
pub struct SniRequest<'a> {
    ssl: &'a mut SslRef,
    shared: &'a Mutex<ConnShared>,
    server_name: Option<String>,
}

impl SniRequest<'_> {
    /// Host name sent by the client, if any
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Owner registered with [`TlsConnection::set_owner`](crate::TlsConnection::set_owner)
    pub fn owner(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.lock().owner.as_ref().and_then(|w| w.upgrade())
    }

    /// Context currently attached to the connection
    pub fn context(&self) -> TlsContext {
        self.shared.lock().context.clone()
    }

    /// Continue the handshake under a different context
    pub fn set_context(&mut self, ctx: &TlsContext) -> Result<()> {
        ctx.with_ctx(|engine_ctx| self.ssl.set_ssl_context(engine_ctx))?;
        self.shared.lock().context = ctx.clone();
        log::debug!(
            "SNI switched context for {:?}",
            self.server_name.as_deref().unwrap_or("")
        );
        Ok(())
    }
}

fn to_ssl_alert(alert: AlertDescription) -> SslAlert {
    match alert {
        AlertDescription::UnrecognizedName => SslAlert::UNRECOGNIZED_NAME,
        AlertDescription::DecodeError => SslAlert::DECODE_ERROR,
        AlertDescription::IllegalParameter => SslAlert::ILLEGAL_PARAMETER,
        other => {
            log::warn!("no engine alert for {:?}, sending illegal_parameter", other);
            SslAlert::ILLEGAL_PARAMETER
        }
    }
}

/// Servername callback installed on the engine context
pub(crate) fn dispatch(
    slot: &RwLock<Option<SniCallback>>,
    ssl: &mut SslRef,
    alert: &mut SslAlert,
) -> std::result::Result<(), SniError> {
    let callback = match slot.read().clone() {
        Some(cb) => cb,
        None => return Ok(()),
    };
    let shared = match engine::engine()
        .ok()
        .and_then(|engine| ssl.ex_data(engine.conn_index))
    {
        Some(shared) => shared.clone(),
        None => return Ok(()),
    };

    let server_name = ssl.servername(NameType::HOST_NAME).map(str::to_owned);
    let mut request = SniRequest {
        ssl,
        shared: &shared,
        server_name,
    };

    match panic::catch_unwind(AssertUnwindSafe(|| callback(&mut request))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(description)) => {
            log::debug!("SNI callback rejected handshake with {:?}", description);
            *alert = to_ssl_alert(description);
            Err(SniError::ALERT_FATAL)
        }
        Err(_) => {
            log::warn!("SNI callback panicked");
            shared.lock().callback_error = Some(TlsError::callback("SNI callback panicked"));
            Err(SniError::ALERT_FATAL)
        }
    }
}
