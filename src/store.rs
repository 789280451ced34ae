//! Trust store helpers

use crate::bio::MemBioSlice;
use crate::error::{ErrorState, ProtocolError, SslErrorCode, TlsError};
use crate::ffi;
use crate::Result;
use foreign_types_shared::{ForeignType, ForeignTypeRef};
use libc::{c_int, c_ulong};
use openssl::error::ErrorStack;
use openssl::x509::store::{X509StoreBuilderRef, X509StoreRef};
use openssl::x509::{X509Ref, X509};
use openssl_sys as sys;
use std::ptr;

const ERR_LIB_PEM: c_int = 9;
const ERR_LIB_X509: c_int = 11;
const ERR_LIB_ASN1: c_int = 13;
const PEM_R_NO_START_LINE: c_int = 108;
const ASN1_R_HEADER_TOO_LONG: c_int = 123;
const X509_R_CERT_ALREADY_IN_HASH_TABLE: c_int = 101;
const X509_LU_CRL: c_int = 2;

/// In-memory CA certificates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaData {
    /// One or more PEM certificates; must be ASCII
    Pem(String),
    /// One or more concatenated DER certificates
    Der(Vec<u8>),
}

impl CaData {
    fn is_pem(&self) -> bool {
        matches!(self, CaData::Pem(_))
    }

    fn bytes(&self) -> &[u8] {
        match self {
            CaData::Pem(s) => s.as_bytes(),
            CaData::Der(b) => b,
        }
    }
}

/// Certificate counts of a trust store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertStoreStats {
    pub x509: usize,
    pub crl: usize,
    pub x509_ca: usize,
}

fn ssl_failure(message: &str) -> TlsError {
    let state = ErrorState {
        code: SslErrorCode::Ssl,
        errno: 0,
    };
    TlsError::Protocol(ProtocolError::new(state, message))
}

fn lib_and_reason(code: c_ulong) -> (c_int, c_int) {
    (sys::ERR_GET_LIB(code), sys::ERR_GET_REASON(code))
}

/// End of input reached cleanly after the last certificate
fn is_benign_end(pem: bool, code: c_ulong) -> bool {
    let (lib, reason) = lib_and_reason(code);
    if pem {
        lib == ERR_LIB_PEM && reason == PEM_R_NO_START_LINE
    } else {
        lib == ERR_LIB_ASN1 && reason == ASN1_R_HEADER_TOO_LONG
    }
}

fn is_duplicate(stack: &ErrorStack) -> bool {
    stack.errors().last().map_or(false, |e| {
        e.library_code() == ERR_LIB_X509 && e.reason_code() == X509_R_CERT_ALREADY_IN_HASH_TABLE
    })
}

/// Add every certificate in `data` to `store`, returning how many were read
pub(crate) fn load_cadata(store: &mut X509StoreBuilderRef, data: &CaData) -> Result<usize> {
    if let CaData::Pem(text) = data {
        if !text.is_ascii() {
            return Err(TlsError::InvalidArgument(
                "cadata should be an ASCII string".to_string(),
            ));
        }
    }

    let pem = data.is_pem();
    let bio = MemBioSlice::new(data.bytes())?;
    let mut loaded = 0;

    loop {
        let raw = unsafe {
            if pem {
                sys::PEM_read_bio_X509(bio.as_ptr(), ptr::null_mut(), None, ptr::null_mut())
            } else {
                sys::d2i_X509_bio(bio.as_ptr(), ptr::null_mut())
            }
        };
        if raw.is_null() {
            break;
        }
        let cert = unsafe { X509::from_ptr(raw) };
        match store.add_cert(cert) {
            Ok(()) => {}
            Err(stack) if is_duplicate(&stack) => {}
            Err(stack) => return Err(stack.into()),
        }
        loaded += 1;
    }

    let last = unsafe { sys::ERR_peek_last_error() };
    if loaded == 0 {
        unsafe { sys::ERR_clear_error() };
        return Err(ssl_failure(if pem {
            "no start line: cadata does not contain a certificate"
        } else {
            "not enough data: cadata does not contain a certificate"
        }));
    }
    if last != 0 {
        if is_benign_end(pem, last) {
            unsafe { sys::ERR_clear_error() };
        } else {
            return Err(ErrorStack::get().into());
        }
    }

    log::trace!("loaded {} certificate(s) from cadata", loaded);
    Ok(loaded)
}

fn is_ca(cert: &X509Ref) -> bool {
    unsafe { ffi::X509_check_ca(cert.as_ptr()) != 0 }
}

/// CRLs and other non-certificate objects held by the store
fn crl_count(store: &X509StoreRef) -> usize {
    let raw = store.as_ptr();
    let mut crls = 0;
    unsafe {
        // The object list is only stable while the store lock is held.
        ffi::X509_STORE_lock(raw);
        let objects = ffi::X509_STORE_get0_objects(raw) as *const sys::OPENSSL_STACK;
        if !objects.is_null() {
            for i in 0..sys::OPENSSL_sk_num(objects) {
                let obj = sys::OPENSSL_sk_value(objects, i) as *const sys::X509_OBJECT;
                if ffi::X509_OBJECT_get_type(obj) == X509_LU_CRL {
                    crls += 1;
                }
            }
        }
        ffi::X509_STORE_unlock(raw);
    }
    crls
}

pub(crate) fn stats(store: &X509StoreRef) -> CertStoreStats {
    let certs = store.all_certificates();
    CertStoreStats {
        x509: certs.len(),
        crl: crl_count(store),
        x509_ca: certs.iter().filter(|cert| is_ca(cert)).count(),
    }
}

/// CA certificates held by the store
pub(crate) fn ca_certs(store: &X509StoreRef) -> Vec<X509> {
    store
        .all_certificates()
        .iter()
        .filter(|cert| is_ca(cert))
        .map(|cert| cert.to_owned())
        .collect()
}
