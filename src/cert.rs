//! Certificate handling and parsing
//!
//! This module provides functionality for extracting the fields reported by
//! `getpeercert` and `get_ca_certs` from X.509 certificates.

use crate::error::TlsError;
use crate::Result;
use foreign_types_shared::ForeignTypeRef;
use libc::c_void;
use openssl::asn1::Asn1StringRef;
use openssl::error::ErrorStack;
use openssl::x509::{X509NameRef, X509Ref, X509};
use openssl_sys as sys;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::ptr;

/// Decode an ASN.1 string to UTF-8, keeping interior NULs
fn asn1_text(data: &Asn1StringRef) -> Result<String> {
    let mut out: *mut u8 = ptr::null_mut();
    let len = unsafe { sys::ASN1_STRING_to_UTF8(&mut out, data.as_ptr()) };
    if len < 0 {
        return Err(ErrorStack::get().into());
    }
    if out.is_null() {
        return Ok(String::new());
    }
    let text = unsafe {
        let bytes = std::slice::from_raw_parts(out, len as usize);
        let text = String::from_utf8_lossy(bytes).into_owned();
        sys::OPENSSL_free(out as *mut c_void);
        text
    };
    Ok(text)
}

/// Certificate information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject as (attribute, value) pairs, e.g. ("commonName", "example.com")
    pub subject: Vec<(String, String)>,
    /// Issuer as (attribute, value) pairs
    pub issuer: Vec<(String, String)>,
    /// X.509 version, 1-based
    pub version: i32,
    /// Serial number in upper-case hex
    pub serial_number: String,
    pub not_before: String,
    pub not_after: String,
    /// Subject Alternative Names as (kind, value) pairs, e.g. ("DNS", "example.com")
    pub subject_alt_names: Vec<(String, String)>,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate reference
    pub fn from_x509_ref(cert: &X509Ref) -> Result<Self> {
        let serial_number = cert
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))?;

        Ok(CertInfo {
            subject: Self::name_entries(cert.subject_name())?,
            issuer: Self::name_entries(cert.issuer_name())?,
            version: cert.version() + 1,
            serial_number,
            not_before: cert.not_before().to_string(),
            not_after: cert.not_after().to_string(),
            subject_alt_names: Self::get_subject_alt_names(cert),
        })
    }

    /// Whether nothing was extracted (peer not verified)
    pub fn is_empty(&self) -> bool {
        *self == CertInfo::default()
    }

    /// First commonName of the subject
    pub fn common_name(&self) -> Option<&str> {
        self.subject
            .iter()
            .find(|(k, _)| k == "commonName")
            .map(|(_, v)| v.as_str())
    }

    fn name_entries(name: &X509NameRef) -> Result<Vec<(String, String)>> {
        name.entries()
            .map(|entry| -> Result<(String, String)> {
                let object = entry.object();
                let key = object
                    .nid()
                    .long_name()
                    .map(str::to_owned)
                    .unwrap_or_else(|_| object.to_string());
                let value = asn1_text(entry.data())?;
                Ok((key, value))
            })
            .collect()
    }

    fn get_subject_alt_names(cert: &X509Ref) -> Vec<(String, String)> {
        let mut names = Vec::new();

        if let Some(san_ext) = cert.subject_alt_names() {
            for name in &san_ext {
                if let Some(dns) = name.dnsname() {
                    names.push(("DNS".to_string(), dns.to_string()));
                } else if let Some(ip) = name.ipaddress() {
                    if let Some(ip) = format_ip(ip) {
                        names.push(("IP Address".to_string(), ip));
                    }
                } else if let Some(email) = name.email() {
                    names.push(("email".to_string(), email.to_string()));
                } else if let Some(uri) = name.uri() {
                    names.push(("URI".to_string(), uri.to_string()));
                }
            }
        }

        names
    }
}

/// IPv6 addresses are written as eight upper-case groups without compression
fn format_ip(raw: &[u8]) -> Option<String> {
    match raw.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])).to_string()),
        16 => Some(
            raw.chunks(2)
                .map(|pair| format!("{:X}", u16::from_be_bytes([pair[0], pair[1]])))
                .collect::<Vec<_>>()
                .join(":"),
        ),
        _ => None,
    }
}

/// Certificate as returned by `getpeercert` / `get_ca_certs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertData {
    /// DER encoding
    Binary(Vec<u8>),
    /// Decoded fields
    Decoded(CertInfo),
}

impl CertData {
    pub(crate) fn from_x509_ref(cert: &X509Ref, binary: bool) -> Result<Self> {
        if binary {
            Ok(CertData::Binary(cert.to_der()?))
        } else {
            Ok(CertData::Decoded(CertInfo::from_x509_ref(cert)?))
        }
    }

    pub fn as_decoded(&self) -> Option<&CertInfo> {
        match self {
            CertData::Decoded(info) => Some(info),
            CertData::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            CertData::Binary(der) => Some(der),
            CertData::Decoded(_) => None,
        }
    }
}

/// Decode the first PEM certificate in `path`
pub fn decode_certificate(path: impl AsRef<Path>) -> Result<CertInfo> {
    let path = path.as_ref();
    let pem = std::fs::read(path).map_err(|source| TlsError::File {
        path: path.to_path_buf(),
        source,
    })?;
    let cert = X509::from_pem(&pem)?;
    CertInfo::from_x509_ref(&cert)
}
