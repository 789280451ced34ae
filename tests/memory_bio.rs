//! Memory-BIO integration tests
//!
//! Client and server run in the same thread over paired in-memory buffers:
//! - handshake, data transfer and close-notify exchange
//! - certificate verification and hostname matching
//! - ALPN, SNI callbacks and channel binding
//! - session resumption

mod common;

use common::{handshake, send, transfer, BioPeer, TestPki};
use sslcore::{
    AlertDescription, CertData, HandshakeState, Protocol, Role, SessionError, SniCallback,
    SniRequest, SslErrorCode, TlsContext, TlsError, TlsVersion, VerifyMode,
};
use std::sync::{Arc, Mutex};

type SniResult = Result<(), AlertDescription>;

fn connected_pair(pki: &TestPki) -> (BioPeer, BioPeer) {
    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);
    handshake(&mut client, &mut server).unwrap();
    (client, server)
}

#[test]
fn test_handshake_and_echo() {
    let pki = TestPki::new();
    let (mut client, mut server) = connected_pair(&pki);

    assert!(client.conn.handshake_done());
    assert_eq!(client.conn.state(), HandshakeState::Established);
    assert_eq!(server.conn.state(), HandshakeState::Established);
    assert!(server.conn.server_side());
    assert!(client.conn.version().unwrap().starts_with("TLSv1."));
    assert_eq!(client.conn.cipher(), server.conn.cipher());

    assert_eq!(send(&mut client, &mut server, b"ping"), b"ping");
    assert_eq!(send(&mut server, &mut client, b"pong"), b"pong");
}

#[test]
fn test_large_payload() {
    let pki = TestPki::new();
    let (mut client, mut server) = connected_pair(&pki);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(send(&mut client, &mut server, &payload), payload);
}

#[test]
fn test_close_notify_is_graceful_eof() {
    let pki = TestPki::new();
    let (mut client, mut server) = connected_pair(&pki);

    // Our close-notify goes out, then we need the peer's
    let err = client.conn.shutdown().unwrap_err();
    assert!(err.is_want_read());
    assert_eq!(client.conn.state(), HandshakeState::ShuttingDown);
    transfer(&client, &server);

    assert_eq!(server.conn.read(10).unwrap(), b"");
    assert!(server.conn.shutdown().unwrap().is_none());
    assert_eq!(server.conn.state(), HandshakeState::Closed);
    transfer(&server, &client);

    assert!(client.conn.shutdown().unwrap().is_none());
    assert_eq!(client.conn.state(), HandshakeState::Closed);
}

#[test]
fn test_peer_certificate() {
    let pki = TestPki::new();
    let (client, server) = connected_pair(&pki);

    let decoded = client.conn.getpeercert(false).unwrap().unwrap();
    let info = decoded.as_decoded().unwrap();
    assert_eq!(info.common_name(), Some("localhost"));
    assert!(info
        .subject_alt_names
        .contains(&("DNS".to_string(), "example.com".to_string())));

    let der = client.conn.getpeercert(true).unwrap().unwrap();
    assert_eq!(der, CertData::Binary(pki.leaf.to_der().unwrap()));

    // The client sent no certificate
    assert!(server.conn.getpeercert(false).unwrap().is_none());
}

#[test]
fn test_unverified_peer_certificate_is_empty() {
    let pki = TestPki::new();
    let client_ctx = TlsContext::new(Protocol::TlsClient).unwrap();
    client_ctx.set_check_hostname(false).unwrap();
    client_ctx.set_verify_mode(VerifyMode::None).unwrap();

    let mut client = BioPeer::new(&client_ctx, Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);
    handshake(&mut client, &mut server).unwrap();

    let decoded = client.conn.getpeercert(false).unwrap().unwrap();
    assert!(decoded.as_decoded().unwrap().is_empty());
    assert!(client.conn.getpeercert(true).unwrap().unwrap().as_binary().is_some());
}

#[test]
fn test_untrusted_server_is_rejected() {
    let pki = TestPki::new();
    let other = TestPki::with_ca_name("some other CA");

    let mut client = BioPeer::new(&other.client_context(), Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);
    let outcome = handshake(&mut client, &mut server);

    match outcome.client {
        Err(TlsError::Certificate(e)) => {
            assert!(!e.hostname_mismatch);
            assert!(e.to_string().starts_with("certificate verify failed"));
        }
        other => panic!("expected certificate error, got {:?}", other),
    }
    assert!(outcome.server.is_err());
}

#[test]
fn test_hostname_mismatch() {
    let pki = TestPki::new();
    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("wrong.example"));
    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);

    match handshake(&mut client, &mut server).client {
        Err(TlsError::Certificate(e)) => assert!(e.hostname_mismatch),
        other => panic!("expected hostname mismatch, got {:?}", other),
    }
}

#[test]
fn test_ip_address_hostname() {
    let pki = TestPki::new();
    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("127.0.0.1"));
    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);
    handshake(&mut client, &mut server).unwrap();

    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("127.0.0.2"));
    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);
    match handshake(&mut client, &mut server).client {
        Err(TlsError::Certificate(e)) => assert!(e.hostname_mismatch),
        other => panic!("expected IP mismatch, got {:?}", other),
    }
}

#[test]
fn test_alpn_negotiation() {
    let pki = TestPki::new();
    let client_ctx = pki.client_context();
    client_ctx.set_alpn_protocols(&[b"h2", b"http/1.1"]).unwrap();
    let server_ctx = pki.server_context();
    server_ctx.set_alpn_protocols(&[b"http/1.1"]).unwrap();

    let mut client = BioPeer::new(&client_ctx, Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);
    handshake(&mut client, &mut server).unwrap();

    assert_eq!(client.conn.selected_alpn_protocol(), Some(&b"http/1.1"[..]));
    assert_eq!(server.conn.selected_alpn_protocol(), Some(&b"http/1.1"[..]));
}

#[test]
fn test_sni_callback_sees_server_name_and_owner() {
    let pki = TestPki::new();
    let server_ctx = pki.server_context();
    let seen = Arc::new(Mutex::new(None));

    let record = seen.clone();
    let callback: SniCallback = Arc::new(move |req: &mut SniRequest<'_>| -> SniResult {
        let owner = req
            .owner()
            .and_then(|o| o.downcast_ref::<String>().cloned());
        *record.lock().unwrap() = Some((req.server_name().map(str::to_owned), owner));
        Ok(())
    });
    server_ctx.set_sni_callback(Some(callback)).unwrap();

    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);
    let owner = Arc::new("listener".to_string());
    server.conn.set_owner(&owner);
    handshake(&mut client, &mut server).unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        Some((Some("localhost".to_string()), Some("listener".to_string())))
    );
}

#[test]
fn test_sni_callback_switches_context() {
    let pki = TestPki::new();
    let other = TestPki::with_ca_name("second CA");

    // The default context has no certificate at all
    let front = TlsContext::new(Protocol::TlsServer).unwrap();
    let backend = pki.server_context();
    let target = backend.clone();
    front
        .set_sni_callback(Some(Arc::new(move |req: &mut SniRequest<'_>| -> SniResult {
            req.set_context(&target)
                .map_err(|_| AlertDescription::InternalError)
        })))
        .unwrap();

    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&front, Role::Server, None);
    handshake(&mut client, &mut server).unwrap();
    assert!(server.conn.context().same_context(&backend));

    // A client trusting only the second CA still rejects the backend cert
    let mut client = BioPeer::new(&other.client_context(), Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&front, Role::Server, None);
    assert!(handshake(&mut client, &mut server).client.is_err());
}

#[test]
fn test_sni_callback_alert_aborts_handshake() {
    let pki = TestPki::new();
    let server_ctx = pki.server_context();
    server_ctx
        .set_sni_callback(Some(Arc::new(|_req: &mut SniRequest<'_>| -> SniResult {
            Err(AlertDescription::UnrecognizedName)
        })))
        .unwrap();

    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);
    let outcome = handshake(&mut client, &mut server);

    assert!(matches!(outcome.server, Err(TlsError::Protocol(_))));
    assert!(outcome.client.is_err());
}

#[test]
fn test_sni_callback_panic_surfaces_as_callback_error() {
    let pki = TestPki::new();
    let server_ctx = pki.server_context();
    server_ctx
        .set_sni_callback(Some(Arc::new(|_req: &mut SniRequest<'_>| -> SniResult {
            panic!("callback bug")
        })))
        .unwrap();

    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);

    match handshake(&mut client, &mut server).server {
        Err(TlsError::Callback(e)) => assert!(e.to_string().contains("panicked")),
        other => panic!("expected callback error, got {:?}", other),
    }
}

fn tls12_pair(pki: &TestPki) -> (TlsContext, TlsContext) {
    let client_ctx = pki.client_context();
    client_ctx.set_maximum_version(TlsVersion::Tls12).unwrap();
    let server_ctx = pki.server_context();
    (client_ctx, server_ctx)
}

#[test]
fn test_tls_unique_channel_binding() {
    let pki = TestPki::new();
    let (client_ctx, server_ctx) = tls12_pair(&pki);

    let mut client = BioPeer::new(&client_ctx, Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);
    assert_eq!(client.conn.get_channel_binding("tls-unique").unwrap(), None);

    handshake(&mut client, &mut server).unwrap();
    assert_eq!(client.conn.version(), Some("TLSv1.2"));

    let ours = client.conn.get_channel_binding("tls-unique").unwrap().unwrap();
    let theirs = server.conn.get_channel_binding("tls-unique").unwrap().unwrap();
    assert!(!ours.is_empty());
    assert_eq!(ours, theirs);
}

#[test]
fn test_session_resumption() {
    let pki = TestPki::new();
    let (client_ctx, server_ctx) = tls12_pair(&pki);

    let mut client = BioPeer::new(&client_ctx, Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);
    handshake(&mut client, &mut server).unwrap();
    assert!(!client.conn.session_reused());
    let session = client.conn.session().unwrap();
    assert!(!session.id().is_empty() || session.has_ticket());
    assert!(session.context().same_context(&client_ctx));

    // Too late for this connection
    assert!(matches!(
        client.conn.set_session(&session),
        Err(TlsError::Session(SessionError::HandshakeStarted))
    ));

    let mut client = BioPeer::new(&client_ctx, Role::Client, Some("localhost"));
    client.conn.set_session(&session).unwrap();
    // Requested, not yet negotiated
    assert!(client.conn.session().is_none());
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);
    handshake(&mut client, &mut server).unwrap();
    assert!(client.conn.session_reused());
    assert_eq!(client.conn.session().unwrap(), session);
    assert!(server.conn.session_reused());
    assert!(server_ctx.session_stats().accept_good >= 2);
}

#[test]
fn test_set_session_checks() {
    let pki = TestPki::new();
    let (client_ctx, server_ctx) = tls12_pair(&pki);

    let mut client = BioPeer::new(&client_ctx, Role::Client, Some("localhost"));
    let mut server = BioPeer::new(&server_ctx, Role::Server, None);
    handshake(&mut client, &mut server).unwrap();
    let session = client.conn.session().unwrap();

    let stranger = pki.client_context();
    let mut other = BioPeer::new(&stranger, Role::Client, Some("localhost"));
    assert!(matches!(
        other.conn.set_session(&session),
        Err(TlsError::Session(SessionError::ContextMismatch))
    ));

    // A generic context can create both sides
    let both = TlsContext::new(Protocol::Tls).unwrap();
    let mut client = BioPeer::new(&both, Role::Client, None);
    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);
    handshake(&mut client, &mut server).unwrap();
    let session = client.conn.session().unwrap();
    let mut server_side = BioPeer::new(&both, Role::Server, None);
    assert!(matches!(
        server_side.conn.set_session(&session),
        Err(TlsError::Session(SessionError::ServerSide))
    ));
}

#[test]
fn test_non_blocking_read_without_data() {
    let pki = TestPki::new();
    let (mut client, _server) = connected_pair(&pki);

    let err = client.conn.read(16).unwrap_err();
    assert!(err.is_want_read());
    assert_eq!(client.conn.last_error().code, SslErrorCode::WantRead);
    assert_eq!(client.conn.pending(), 0);
}

#[test]
fn test_configure_hostname_only_before_handshake() {
    let pki = TestPki::new();
    let ctx = TlsContext::new(Protocol::Tls).unwrap();
    let mut client = BioPeer::new(&ctx, Role::Client, None);
    client.conn.configure_hostname("localhost").unwrap();
    assert_eq!(client.conn.server_hostname(), Some("localhost"));

    let mut server = BioPeer::new(&pki.server_context(), Role::Server, None);
    handshake(&mut client, &mut server).unwrap();
    assert!(matches!(
        client.conn.configure_hostname("example.com"),
        Err(TlsError::State(_))
    ));
}

#[test]
fn test_eof_mid_handshake() {
    let pki = TestPki::new();
    let mut client = BioPeer::new(&pki.client_context(), Role::Client, Some("localhost"));
    assert!(client.conn.do_handshake().unwrap_err().is_want_read());

    client.incoming.write_eof();
    let err = client.conn.do_handshake().unwrap_err();
    assert_eq!(err.ssl_code(), SslErrorCode::Eof);
}
