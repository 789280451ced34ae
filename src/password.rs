//! Password-callback bridge for encrypted private keys
//!
//! The engine asks for a key passphrase through a C callback. While
//! `TlsContext::load_cert_chain` runs, a [`PasswordScope`] parks the
//! caller's [`Password`] in a thread-local slot and points the context's
//! callback at [`password_trampoline`]. Errors and panics raised while
//! producing the password are stashed in the slot and re-raised by the
//! caller once the engine call has returned.

use crate::error::TlsError;
use crate::ffi;
use libc::{c_char, c_int, c_void};
use openssl_sys::SSL_CTX;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

/// Boxed error returned by password callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type PasswordFn = dyn Fn() -> std::result::Result<Vec<u8>, BoxError> + Send + Sync;

/// Passphrase for an encrypted private key
pub enum Password {
    /// Literal passphrase
    Bytes(Vec<u8>),
    /// Called when the engine needs the passphrase
    Callback(Box<PasswordFn>),
}

impl Password {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn() -> std::result::Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        Password::Callback(Box::new(f))
    }

    fn resolve(&self) -> Result<Vec<u8>, TlsError> {
        match self {
            Password::Bytes(bytes) => Ok(bytes.clone()),
            Password::Callback(f) => match panic::catch_unwind(AssertUnwindSafe(|| f())) {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(e)) => Err(TlsError::Callback(e)),
                Err(_) => {
                    log::warn!("password callback panicked");
                    Err(TlsError::callback("password callback panicked"))
                }
            },
        }
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Password::Bytes(_) => f.write_str("Password::Bytes(..)"),
            Password::Callback(_) => f.write_str("Password::Callback(..)"),
        }
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Password::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Password {
    fn from(s: String) -> Self {
        Password::Bytes(s.into_bytes())
    }
}

impl From<&[u8]> for Password {
    fn from(b: &[u8]) -> Self {
        Password::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Password {
    fn from(b: Vec<u8>) -> Self {
        Password::Bytes(b)
    }
}

struct Slot {
    password: Arc<Password>,
    error: Option<TlsError>,
}

thread_local! {
    static ACTIVE: RefCell<Option<Slot>> = const { RefCell::new(None) };
}

/// Installs a password for one engine call on the current thread
///
/// Dropping the scope puts back the engine callback, its userdata and the
/// slot that were active before.
pub(crate) struct PasswordScope {
    ctx: *mut SSL_CTX,
    previous: Option<Slot>,
    previous_cb: Option<ffi::PasswordCallback>,
    previous_userdata: *mut c_void,
}

impl PasswordScope {
    /// `ctx` must stay valid until the scope is dropped.
    pub(crate) fn install(ctx: *mut SSL_CTX, password: Password) -> Self {
        let slot = Slot {
            password: Arc::new(password),
            error: None,
        };
        let previous = ACTIVE.with(|cell| cell.borrow_mut().replace(slot));

        let (previous_cb, previous_userdata) = unsafe {
            let saved = (
                ffi::SSL_CTX_get_default_passwd_cb(ctx),
                ffi::SSL_CTX_get_default_passwd_cb_userdata(ctx),
            );
            ffi::SSL_CTX_set_default_passwd_cb(ctx, Some(password_trampoline));
            ffi::SSL_CTX_set_default_passwd_cb_userdata(ctx, ptr::null_mut());
            saved
        };

        PasswordScope {
            ctx,
            previous,
            previous_cb,
            previous_userdata,
        }
    }

    /// Error stashed by the callback, if any
    pub(crate) fn take_error(&self) -> Option<TlsError> {
        ACTIVE.with(|cell| cell.borrow_mut().as_mut().and_then(|slot| slot.error.take()))
    }
}

impl Drop for PasswordScope {
    fn drop(&mut self) {
        unsafe {
            ffi::SSL_CTX_set_default_passwd_cb(self.ctx, self.previous_cb);
            ffi::SSL_CTX_set_default_passwd_cb_userdata(self.ctx, self.previous_userdata);
        }
        let previous = self.previous.take();
        ACTIVE.with(|cell| *cell.borrow_mut() = previous);
    }
}

fn stash(error: TlsError) {
    ACTIVE.with(|cell| {
        if let Some(slot) = cell.borrow_mut().as_mut() {
            slot.error = Some(error);
        }
    });
}

fn fill_password(buf: &mut [u8]) -> c_int {
    let password = match ACTIVE.with(|cell| cell.borrow().as_ref().map(|s| s.password.clone())) {
        Some(p) => p,
        None => return 0,
    };

    // The slot borrow is released here so the callback may load keys itself.
    let bytes = match password.resolve() {
        Ok(bytes) => bytes,
        Err(e) => {
            stash(e);
            return 0;
        }
    };

    if bytes.len() > buf.len() {
        stash(TlsError::InvalidConfig(format!(
            "password cannot be longer than {} bytes",
            buf.len()
        )));
        return 0;
    }

    buf[..bytes.len()].copy_from_slice(&bytes);
    bytes.len() as c_int
}

/// `pem_password_cb` handed to the engine
pub(crate) unsafe extern "C" fn password_trampoline(
    buf: *mut c_char,
    size: c_int,
    _rwflag: c_int,
    _userdata: *mut c_void,
) -> c_int {
    if buf.is_null() || size <= 0 {
        return 0;
    }
    let buf = std::slice::from_raw_parts_mut(buf as *mut u8, size as usize);
    panic::catch_unwind(AssertUnwindSafe(|| fill_password(buf))).unwrap_or(0)
}
