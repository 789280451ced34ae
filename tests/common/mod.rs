//! Shared fixtures: a throwaway PKI on disk and a memory-BIO pump
#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509NameBuilder, X509};
use sslcore::{MemoryBio, Protocol, Role, TlsConnection, TlsContext, TlsError};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const KEY_PASSWORD: &str = "somepass";

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn name(cn: &str) -> openssl::x509::X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder
        .append_entry_by_nid(Nid::ORGANIZATIONNAME, "sslcore tests")
        .unwrap();
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    builder.build()
}

fn ca(cn: &str) -> (X509, PKey<Private>) {
    let key = ec_key();
    let name = name(cn);
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None))
        .unwrap();
    builder.append_extension(ski).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

fn leaf(cn: &str, ca: &X509, ca_key: &PKey<Private>) -> (X509, PKey<Private>) {
    let key = ec_key();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(2).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name(cn)).unwrap();
    builder.set_issuer_name(ca.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder
        .append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()
                .unwrap(),
        )
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns(cn)
        .dns("example.com")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(Some(&**ca), None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// CA plus a `localhost` leaf written to a temporary directory
pub struct TestPki {
    pub dir: TempDir,
    pub ca: X509,
    pub leaf: X509,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Leaf certificate followed by its key
    pub combined_file: PathBuf,
    /// Key encrypted with [`KEY_PASSWORD`]
    pub encrypted_key_file: PathBuf,
}

impl TestPki {
    pub fn new() -> Self {
        Self::with_ca_name("sslcore test CA")
    }

    pub fn with_ca_name(ca_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (ca, ca_key) = ca(ca_name);
        let (leaf, key) = leaf("localhost", &ca, &ca_key);

        let cert_pem = leaf.to_pem().unwrap();
        let key_pem = key.private_key_to_pem_pkcs8().unwrap();
        let encrypted = key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), KEY_PASSWORD.as_bytes())
            .unwrap();

        let ca_file = dir.path().join("ca.pem");
        let cert_file = dir.path().join("cert.pem");
        let key_file = dir.path().join("key.pem");
        let combined_file = dir.path().join("combined.pem");
        let encrypted_key_file = dir.path().join("key-encrypted.pem");

        fs::write(&ca_file, ca.to_pem().unwrap()).unwrap();
        fs::write(&cert_file, &cert_pem).unwrap();
        fs::write(&key_file, &key_pem).unwrap();
        fs::write(&combined_file, [cert_pem.as_slice(), key_pem.as_slice()].concat()).unwrap();
        fs::write(&encrypted_key_file, &encrypted).unwrap();

        TestPki {
            dir,
            ca,
            leaf,
            ca_file,
            cert_file,
            key_file,
            combined_file,
            encrypted_key_file,
        }
    }

    pub fn ca_pem(&self) -> String {
        String::from_utf8(self.ca.to_pem().unwrap()).unwrap()
    }

    /// Server context presenting the leaf certificate
    pub fn server_context(&self) -> TlsContext {
        let ctx = TlsContext::new(Protocol::TlsServer).unwrap();
        ctx.load_cert_chain(&self.cert_file, Some(self.key_file.as_path()), None)
            .unwrap();
        ctx
    }

    /// Client context trusting the CA
    pub fn client_context(&self) -> TlsContext {
        let ctx = TlsContext::new(Protocol::TlsClient).unwrap();
        ctx.load_verify_locations(Some(self.ca_file.as_path()), None, None)
            .unwrap();
        ctx
    }
}

/// Connection over a pair of memory buffers
pub struct BioPeer {
    pub conn: TlsConnection,
    pub incoming: MemoryBio,
    pub outgoing: MemoryBio,
}

impl BioPeer {
    pub fn new(ctx: &TlsContext, role: Role, hostname: Option<&str>) -> Self {
        Self::try_new(ctx, role, hostname).unwrap()
    }

    pub fn try_new(
        ctx: &TlsContext,
        role: Role,
        hostname: Option<&str>,
    ) -> Result<Self, TlsError> {
        let incoming = MemoryBio::new();
        let outgoing = MemoryBio::new();
        let conn = ctx.wrap_bio(incoming.clone(), outgoing.clone(), role, hostname)?;
        Ok(BioPeer {
            conn,
            incoming,
            outgoing,
        })
    }
}

/// Move everything `from` has produced into `to`'s input
pub fn transfer(from: &BioPeer, to: &BioPeer) {
    let data = from.outgoing.read(None);
    if !data.is_empty() {
        to.incoming.write(&data).unwrap();
    }
}

fn step(peer: &mut BioPeer, done: &mut bool) -> Result<(), TlsError> {
    if *done {
        return Ok(());
    }
    match peer.conn.do_handshake() {
        Ok(()) => {
            *done = true;
            Ok(())
        }
        Err(e) if e.is_want_read() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Handshake outcome of each side
pub struct HandshakeOutcome {
    pub client: Result<(), TlsError>,
    pub server: Result<(), TlsError>,
}

impl HandshakeOutcome {
    pub fn unwrap(self) {
        self.client.unwrap();
        self.server.unwrap();
    }
}

/// Drive both handshakes over memory BIOs until they finish or one fails
pub fn handshake(client: &mut BioPeer, server: &mut BioPeer) -> HandshakeOutcome {
    let (mut client_done, mut server_done) = (false, false);
    for _ in 0..16 {
        if let Err(e) = step(client, &mut client_done) {
            transfer(client, server);
            let server_result = step(server, &mut server_done);
            return HandshakeOutcome {
                client: Err(e),
                server: server_result,
            };
        }
        transfer(client, server);

        if let Err(e) = step(server, &mut server_done) {
            transfer(server, client);
            let client_result = step(client, &mut client_done);
            return HandshakeOutcome {
                client: client_result,
                server: Err(e),
            };
        }
        transfer(server, client);

        if client_done && server_done {
            return HandshakeOutcome {
                client: Ok(()),
                server: Ok(()),
            };
        }
    }
    panic!("handshake did not converge");
}

/// Send `data` from one side and read it on the other
pub fn send(from: &mut BioPeer, to: &mut BioPeer, data: &[u8]) -> Vec<u8> {
    let mut written = 0;
    while written < data.len() {
        written += from.conn.write(&data[written..]).unwrap();
    }
    transfer(from, to);

    let mut received = Vec::new();
    while received.len() < data.len() {
        match to.conn.read(data.len() - received.len()) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => received.extend(chunk),
            Err(e) if e.is_want_read() => {
                // Peer may owe us handshake messages (session tickets)
                transfer(to, from);
                transfer(from, to);
                if to.incoming.pending() == 0 {
                    break;
                }
            }
            Err(e) => panic!("read failed: {}", e),
        }
    }
    received
}
