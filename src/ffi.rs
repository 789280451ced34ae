//! Engine entry points the `openssl` crate does not wrap

#![allow(non_snake_case)]

use libc::{c_char, c_int, c_ulong, c_void};
use openssl_sys::{
    stack_st_SSL_CIPHER, stack_st_X509_OBJECT, SSL, SSL_CTX, SSL_SESSION, X509, X509_OBJECT,
    X509_STORE,
};

pub(crate) type PasswordCallback =
    unsafe extern "C" fn(buf: *mut c_char, size: c_int, rwflag: c_int, userdata: *mut c_void) -> c_int;

// SSL_CTX_ctrl commands for session cache statistics
pub(crate) const SSL_CTRL_SESS_NUMBER: c_int = 20;
pub(crate) const SSL_CTRL_SESS_CONNECT: c_int = 21;
pub(crate) const SSL_CTRL_SESS_CONNECT_GOOD: c_int = 22;
pub(crate) const SSL_CTRL_SESS_CONNECT_RENEGOTIATE: c_int = 23;
pub(crate) const SSL_CTRL_SESS_ACCEPT: c_int = 24;
pub(crate) const SSL_CTRL_SESS_ACCEPT_GOOD: c_int = 25;
pub(crate) const SSL_CTRL_SESS_ACCEPT_RENEGOTIATE: c_int = 26;
pub(crate) const SSL_CTRL_SESS_HIT: c_int = 27;
pub(crate) const SSL_CTRL_SESS_CB_HIT: c_int = 28;
pub(crate) const SSL_CTRL_SESS_MISSES: c_int = 29;
pub(crate) const SSL_CTRL_SESS_TIMEOUTS: c_int = 30;
pub(crate) const SSL_CTRL_SESS_CACHE_FULL: c_int = 31;

extern "C" {
    pub(crate) fn SSL_CTX_set_default_passwd_cb(ctx: *mut SSL_CTX, cb: Option<PasswordCallback>);
    pub(crate) fn SSL_CTX_set_default_passwd_cb_userdata(ctx: *mut SSL_CTX, u: *mut c_void);
    pub(crate) fn SSL_CTX_get_default_passwd_cb(ctx: *mut SSL_CTX) -> Option<PasswordCallback>;
    pub(crate) fn SSL_CTX_get_default_passwd_cb_userdata(ctx: *mut SSL_CTX) -> *mut c_void;
    pub(crate) fn SSL_CTX_get_ciphers(ctx: *const SSL_CTX) -> *mut stack_st_SSL_CIPHER;
    pub(crate) fn SSL_CTX_set_post_handshake_auth(ctx: *mut SSL_CTX, val: c_int);

    pub(crate) fn SSL_get_ciphers(ssl: *const SSL) -> *mut stack_st_SSL_CIPHER;
    pub(crate) fn SSL_get_client_ciphers(ssl: *const SSL) -> *mut stack_st_SSL_CIPHER;
    pub(crate) fn SSL_verify_client_post_handshake(ssl: *mut SSL) -> c_int;

    pub(crate) fn SSL_SESSION_has_ticket(s: *const SSL_SESSION) -> c_int;
    pub(crate) fn SSL_SESSION_get_ticket_lifetime_hint(s: *const SSL_SESSION) -> c_ulong;

    pub(crate) fn X509_check_ca(x: *mut X509) -> c_int;
    pub(crate) fn X509_STORE_lock(store: *mut X509_STORE) -> c_int;
    pub(crate) fn X509_STORE_unlock(store: *mut X509_STORE) -> c_int;
    pub(crate) fn X509_STORE_get0_objects(store: *mut X509_STORE) -> *mut stack_st_X509_OBJECT;
    pub(crate) fn X509_OBJECT_get_type(obj: *const X509_OBJECT) -> c_int;
    pub(crate) fn OBJ_sn2nid(s: *const c_char) -> c_int;
}
