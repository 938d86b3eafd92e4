//! TCP / TLS transport to the XMPP server.
//!
//! [`Connection`] is the raw socket (plain or TLS). [`XmppStream`] pairs it
//! with a [`FrameReader`] for the negotiation phase, where exactly one task
//! both reads and writes. Once the session starts, the stream is taken apart
//! with [`XmppStream::into_parts`] and split into a read half for the
//! dispatch task and a write half behind the session's writer lock.

pub mod dns;
pub mod framing;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::stanza::{ns, parse_element, Element};
pub use dns::XmppEndpoint;
pub use framing::{Frame, FrameReader};

/// How the socket is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No TLS at all. Only for local test servers.
    Plain,
    /// TLS from the first byte (usually port 5223).
    DirectTls,
    /// Plain TCP upgraded in-band after the first stream features.
    #[default]
    #[serde(alias = "tcp")]
    StartTls,
}

/// Initialize the rustls crypto provider once per process.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Certificate verifier that accepts anything. Development servers only.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a TLS connector over the system root store, or over an accept-all
/// verifier when `insecure` is set.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector> {
    init_crypto_provider();

    if insecure {
        warn!("TLS certificate verification DISABLED (insecure_tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(Error::Connect(
            "no system root certificates found; install a CA bundle (e.g. ca-certificates)"
                .to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| Error::Connect(format!("failed to add root certificate: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// An open socket to the server.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Plain(_) => f.write_str("Connection::Plain"),
            Connection::Tls(_) => f.write_str("Connection::Tls"),
        }
    }
}

impl Connection {
    /// Dial one endpoint. Direct TLS endpoints complete the handshake here;
    /// STARTTLS endpoints stay plain until [`XmppStream::upgrade_to_tls`].
    pub async fn open(
        endpoint: &XmppEndpoint,
        tls_name: &str,
        connect_timeout: Duration,
        insecure_tls: bool,
    ) -> Result<Connection> {
        let (host, port) = (endpoint.host.as_str(), endpoint.port);
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                error!(host, port, timeout_secs = connect_timeout.as_secs(), "TCP connect timed out");
                Error::Connect(format!(
                    "TCP connect timed out after {}s to {host}:{port}",
                    connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                error!(host, port, error = %e, error_kind = ?e.kind(), "TCP connect failed");
                Error::Connect(format!("failed to connect to {host}:{port}: {e}"))
            })?;
        let _ = tcp.set_nodelay(true);

        match endpoint.mode {
            SecurityMode::DirectTls => {
                let tls = upgrade_to_tls(tcp, tls_name, insecure_tls).await?;
                info!(host, port, tls_name, "Connected (direct TLS)");
                Ok(Connection::Tls(Box::new(tls)))
            }
            SecurityMode::StartTls | SecurityMode::Plain => {
                info!(host, port, mode = ?endpoint.mode, "Connected (TCP)");
                Ok(Connection::Plain(tcp))
            }
        }
    }

    /// Try each endpoint in order, returning the first that connects.
    pub async fn open_any(
        endpoints: &[XmppEndpoint],
        tls_name: &str,
        connect_timeout: Duration,
        insecure_tls: bool,
    ) -> Result<(Connection, SecurityMode)> {
        let mut last_error = Error::Connect("no endpoints to connect to".to_string());
        for endpoint in endpoints {
            match Connection::open(endpoint, tls_name, connect_timeout, insecure_tls).await {
                Ok(conn) => return Ok((conn, endpoint.mode)),
                Err(e) => {
                    warn!(host = %endpoint.host, port = endpoint.port, error = %e,
                        "Endpoint failed, trying next");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Connection::Tls(_))
    }
}

/// Run the TLS handshake over an established TCP socket. `tls_name` is the
/// XMPP domain, used for SNI and certificate verification.
async fn upgrade_to_tls(
    tcp: TcpStream,
    tls_name: &str,
    insecure: bool,
) -> Result<TlsStream<TcpStream>> {
    let connector = create_tls_connector(insecure)?;
    let server_name = ServerName::try_from(tls_name.to_string())
        .map_err(|e| Error::Connect(format!("invalid TLS server name '{tls_name}': {e}")))?;

    connector.connect(server_name, tcp).await.map_err(|e| {
        let detail = e.to_string();
        let classification = if detail.contains("ertificate") {
            "certificate_error"
        } else if detail.contains("timed out") || detail.contains("timeout") {
            "timeout"
        } else if detail.contains("refused") || detail.contains("reset") {
            "connection_refused"
        } else {
            "other"
        };
        error!(tls_name, error = %e, error_class = classification, "TLS handshake failed");
        Error::Connect(format!("TLS handshake failed with {tls_name} ({classification}): {e}"))
    })
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Write one chunk of wire text and flush it. Shared by the negotiation
/// stream and the session's writer half.
pub(crate) async fn write_text<W>(writer: &mut W, xml: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!(target: "fluux_client::transport", xml, "send");
    writer.write_all(xml.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// A connection during negotiation: a single owner reads and writes.
#[derive(Debug)]
pub struct XmppStream {
    conn: Connection,
    frames: FrameReader,
    tls_name: String,
    insecure_tls: bool,
    closed: bool,
}

impl XmppStream {
    pub fn new(conn: Connection, tls_name: &str, insecure_tls: bool) -> Self {
        XmppStream {
            conn,
            frames: FrameReader::new(),
            tls_name: tls_name.to_string(),
            insecure_tls,
            closed: false,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.conn.is_tls()
    }

    pub async fn send(&mut self, xml: &str) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        write_text(&mut self.conn, xml).await
    }

    /// Like [`send`](Self::send), but traffic logging records only the size.
    /// For anything carrying credentials.
    pub async fn send_quiet(&mut self, xml: &str) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        debug!(target: "fluux_client::transport", bytes = xml.len(), "send (redacted)");
        self.conn.write_all(xml.as_bytes()).await?;
        self.conn.flush().await?;
        Ok(())
    }

    pub async fn send_element(&mut self, el: &Element) -> Result<()> {
        self.send(&String::from(el)).await
    }

    /// Read the next frame, giving up after `deadline`.
    pub async fn read_frame(&mut self, deadline: Duration) -> Result<Frame> {
        let frame = tokio::time::timeout(deadline, self.frames.next_frame(&mut self.conn))
            .await
            .map_err(|_| {
                Error::Negotiation(format!(
                    "timed out after {}s waiting for the server",
                    deadline.as_secs()
                ))
            })??;
        if let Frame::Element(xml) = &frame {
            debug!(target: "fluux_client::transport", xml = xml.as_str(), "recv");
        }
        Ok(frame)
    }

    /// Read the next top-level element. The stream header is skipped; a
    /// stream close or `<stream:error>` ends negotiation.
    pub async fn read_element(&mut self, deadline: Duration) -> Result<Element> {
        loop {
            match self.read_frame(deadline).await? {
                Frame::StreamOpen(_) => continue,
                Frame::StreamClose => {
                    return Err(Error::TransportRead("stream closed by server".to_string()))
                }
                Frame::Element(xml) => {
                    let el = parse_element(&xml)?;
                    if el.is("error", ns::STREAM) {
                        return Err(Error::StreamError(stream_error_condition(&el)));
                    }
                    return Ok(el);
                }
            }
        }
    }

    /// Send `<starttls/>`, require `<proceed/>`, then run the TLS handshake
    /// over the same socket.
    pub async fn upgrade_to_tls(mut self, deadline: Duration) -> Result<XmppStream> {
        if self.is_tls() {
            return Err(Error::Negotiation("connection is already encrypted".to_string()));
        }
        self.send_element(&Element::builder("starttls", ns::TLS).build())
            .await?;
        let reply = self.read_element(deadline).await?;
        if reply.is("failure", ns::TLS) {
            return Err(Error::Negotiation("server rejected STARTTLS".to_string()));
        }
        if !reply.is("proceed", ns::TLS) {
            return Err(Error::Negotiation(format!(
                "expected <proceed/> after STARTTLS, got <{}/>",
                reply.name()
            )));
        }

        let XmppStream {
            conn,
            tls_name,
            insecure_tls,
            ..
        } = self;
        let Connection::Plain(tcp) = conn else {
            return Err(Error::Negotiation("connection is already encrypted".to_string()));
        };
        info!(tls_name = %tls_name, "Received <proceed/>, upgrading to TLS");
        let tls = upgrade_to_tls(tcp, &tls_name, insecure_tls).await?;
        info!(tls_name = %tls_name, "STARTTLS: TLS handshake complete");

        // Plaintext leftovers are dropped with the old frame buffer.
        Ok(XmppStream::new(Connection::Tls(Box::new(tls)), &tls_name, insecure_tls))
    }

    /// Release the socket. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.conn.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
    }

    /// Hand the socket and any already-buffered bytes to the session.
    pub fn into_parts(self) -> (Connection, FrameReader) {
        (self.conn, self.frames)
    }
}

/// Name of the defined condition inside a `<stream:error/>`.
pub fn stream_error_condition(el: &Element) -> String {
    el.children()
        .find(|child| child.ns() == ns::STREAMS && child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}
