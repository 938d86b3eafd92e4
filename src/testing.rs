//! Scripted server end of a client connection, shared by the unit tests.
//!
//! Client output is framed and parsed the same way the client reads the
//! server, so assertions work on elements rather than on serialized text.

use std::sync::Arc;
use std::time::Duration;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::stanza::{ns, parse_element, Element};
use crate::transport::{init_crypto_provider, Frame, FrameReader};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
    xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.org' version='1.0'>";

pub(crate) const AUTH_FEATURES: &str = "<stream:features>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
    <register xmlns='http://jabber.org/features/iq-register'/>\
    </stream:features>";

pub(crate) const BIND_FEATURES: &str =
    "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>";

pub(crate) const STARTTLS_FEATURES: &str = "<stream:features>\
    <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
    </stream:features>";

/// Server side of TLS with a throwaway self-signed certificate for
/// `example.org`. Clients need `insecure_tls` to accept it.
pub(crate) fn tls_acceptor() -> TlsAcceptor {
    init_crypto_provider();
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["example.org".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

pub(crate) struct FakeServer<S = TcpStream> {
    sock: S,
    frames: FrameReader,
}

impl FakeServer<TcpStream> {
    pub(crate) async fn accept(listener: &TcpListener) -> Self {
        let (sock, _) = timeout(WAIT, listener.accept())
            .await
            .expect("timed out waiting for the client to connect")
            .unwrap();
        FakeServer::new(sock)
    }
}

impl<S> FakeServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(sock: S) -> Self {
        FakeServer { sock, frames: FrameReader::new() }
    }

    /// Give the socket back, e.g. to wrap it in TLS. Nothing may be
    /// buffered past the last frame read.
    pub(crate) fn into_inner(self) -> S {
        assert_eq!(self.frames.pending(), 0, "client sent data past the last frame");
        self.sock
    }

    pub(crate) async fn send(&mut self, xml: &str) {
        self.sock.write_all(xml.as_bytes()).await.unwrap();
    }

    pub(crate) async fn next_frame(&mut self) -> Frame {
        timeout(WAIT, self.frames.next_frame(&mut self.sock))
            .await
            .expect("timed out waiting for client data")
            .unwrap()
    }

    /// Next top-level element from the client.
    pub(crate) async fn next_element(&mut self) -> Element {
        match self.next_frame().await {
            Frame::Element(xml) => parse_element(&xml).unwrap(),
            other => panic!("expected an element, got {other:?}"),
        }
    }

    pub(crate) async fn expect_stream_open(&mut self) {
        match self.next_frame().await {
            Frame::StreamOpen(header) => assert!(header.contains("example.org"), "{header}"),
            other => panic!("expected a stream header, got {other:?}"),
        }
    }

    pub(crate) async fn expect_stream_close(&mut self) {
        match self.next_frame().await {
            Frame::StreamClose => {}
            other => panic!("expected the stream close, got {other:?}"),
        }
    }

    /// Answer a stream header with ours and the given features.
    pub(crate) async fn greet(&mut self, features: &str) {
        self.expect_stream_open().await;
        self.send(SERVER_HEADER).await;
        self.send(features).await;
    }

    /// Next element, which must be an IQ of type `kind`.
    pub(crate) async fn expect_iq(&mut self, kind: &str) -> Element {
        let el = self.next_element().await;
        assert!(el.is("iq", ns::CLIENT), "expected an iq, got <{}/>", el.name());
        assert_eq!(el.attr("type"), Some(kind));
        el
    }

    pub(crate) async fn reply_result(&mut self, request: &Element, payload: &str) {
        let id = request.attr("id").unwrap();
        self.send(&format!("<iq type='result' id='{id}'>{payload}</iq>")).await;
    }

    pub(crate) async fn reply_error(&mut self, request: &Element, condition: &str) {
        let id = request.attr("id").unwrap();
        self.send(&format!(
            "<iq type='error' id='{id}'><error type='cancel'>\
             <{condition} xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
        ))
        .await;
    }
}
