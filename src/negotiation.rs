//! Pre-session negotiation: stream header and features, SASL PLAIN,
//! in-band registration (XEP-0077) and resource binding.
//!
//! Everything here runs on an [`XmppStream`] owned by a single task, so
//! request/response pairs are correlated by id on the one reader. Stanzas
//! that arrive while waiting for a reply are kept as backlog and handed to
//! the session.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jid::Jid;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stanza::{ns, Element, Iq, IqType};
use crate::transport::{Frame, XmppStream};

/// What the server advertised in `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub starttls_required: bool,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// Legacy RFC 3921 session establishment, unless marked optional.
    pub session_required: bool,
    pub register: bool,
}

impl StreamFeatures {
    pub fn from_element(el: &Element) -> Self {
        let starttls = el.get_child("starttls", ns::TLS);
        let mechanisms = el
            .get_child("mechanisms", ns::SASL)
            .map(|m| {
                m.children()
                    .filter(|c| c.is("mechanism", ns::SASL))
                    .map(|c| c.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let session_required = el
            .get_child("session", ns::SESSION)
            .is_some_and(|s| !s.has_child("optional", ns::SESSION));

        StreamFeatures {
            starttls: starttls.is_some(),
            starttls_required: starttls.is_some_and(|s| s.has_child("required", ns::TLS)),
            mechanisms,
            bind: el.has_child("bind", ns::BIND),
            session_required,
            register: el.has_child("register", ns::REGISTER_FEATURE),
        }
    }

    pub fn supports_mechanism(&self, name: &str) -> bool {
        self.mechanisms.iter().any(|m| m.eq_ignore_ascii_case(name))
    }
}

fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='{}' xmlns:stream='{}'>",
        quick_xml::escape::escape(domain),
        ns::CLIENT,
        ns::STREAM
    )
}

/// Write the stream header and wait for `<stream:features/>`.
pub async fn open_stream(
    stream: &mut XmppStream,
    domain: &str,
    deadline: Duration,
) -> Result<StreamFeatures> {
    debug!(domain, "Opening stream");
    stream.send(&stream_header(domain)).await?;

    match stream.read_frame(deadline).await? {
        Frame::StreamOpen(_) => {}
        Frame::StreamClose => {
            return Err(Error::Negotiation("server closed the stream immediately".to_string()))
        }
        Frame::Element(xml) => {
            return Err(Error::Negotiation(format!(
                "expected stream header, got {xml}"
            )))
        }
    }

    let el = stream.read_element(deadline).await?;
    if !el.is("features", ns::STREAM) {
        return Err(Error::Negotiation(format!(
            "server sent <{}/> before stream features",
            el.name()
        )));
    }
    let features = StreamFeatures::from_element(&el);
    debug!(?features, "Stream features");
    Ok(features)
}

/// Write the closing stream tag. Best-effort.
pub async fn close_stream(stream: &mut XmppStream) {
    if let Err(e) = stream.send("</stream:stream>").await {
        debug!(error = %e, "Failed to send stream close");
    }
}

/// `\0username\0password`, base64-encoded.
fn plain_payload(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{username}\0{password}"))
}

/// Once a negotiation request is out, a stream error or a dropped
/// connection is that step failing. Keep the condition text.
fn step_failed(err: Error, step: fn(String) -> Error) -> Error {
    match err {
        Error::StreamError(condition) => step(condition),
        Error::TransportRead(detail) => step(detail),
        other => other,
    }
}

/// SASL PLAIN. `<success/>` is the only accepted outcome.
pub async fn authenticate(
    stream: &mut XmppStream,
    features: &StreamFeatures,
    username: &str,
    password: &str,
    deadline: Duration,
) -> Result<()> {
    if !features.supports_mechanism("PLAIN") {
        return Err(Error::Negotiation(format!(
            "server does not offer SASL PLAIN (offered: {})",
            features.mechanisms.join(", ")
        )));
    }
    if !stream.is_tls() {
        warn!(username, "Sending SASL PLAIN credentials over an unencrypted connection");
    }

    let auth = Element::builder("auth", ns::SASL)
        .attr("mechanism", "PLAIN")
        .append(plain_payload(username, password))
        .build();
    // Not via send_element: traffic logging must not see the credentials.
    stream.send_quiet(&String::from(&auth)).await?;

    let reply = stream
        .read_element(deadline)
        .await
        .map_err(|e| step_failed(e, Error::Auth))?;
    if reply.is("success", ns::SASL) {
        info!(username, "Authenticated");
        return Ok(());
    }
    if reply.is("failure", ns::SASL) {
        let condition = reply
            .children()
            .find(|c| c.name() != "text")
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "not-authorized".to_string());
        warn!(username, condition = %condition, "Authentication failed");
        return Err(Error::Auth(condition));
    }
    Err(Error::Auth(format!("unexpected <{}/> in reply to <auth/>", reply.name())))
}

/// Wait for the IQ answering `id`. Anything else is pushed onto `backlog`.
async fn await_reply(
    stream: &mut XmppStream,
    id: &str,
    deadline: Duration,
    backlog: &mut Vec<Element>,
) -> Result<Iq> {
    loop {
        let el = stream.read_element(deadline).await?;
        if el.is("iq", ns::CLIENT) && el.attr("id") == Some(id) {
            let iq = Iq::from_element(&el)?;
            if !iq.kind.is_request() {
                return Ok(iq);
            }
        }
        debug!(name = el.name(), "Holding stanza until the session starts");
        backlog.push(el);
    }
}

/// In-band registration of `username` / `password`.
pub async fn register(
    stream: &mut XmppStream,
    username: &str,
    password: &str,
    deadline: Duration,
) -> Result<()> {
    let id = uuid::Uuid::new_v4().to_string();
    let query = Element::builder("query", ns::REGISTER)
        .append(Element::builder("username", ns::REGISTER).append(username).build())
        .append(Element::builder("password", ns::REGISTER).append(password).build())
        .build();
    stream
        .send_quiet(&String::from(&Iq::set(id.as_str(), query).to_element()))
        .await?;

    let mut backlog = Vec::new();
    let reply = await_reply(stream, &id, deadline, &mut backlog).await?;
    if !backlog.is_empty() {
        debug!(dropped = backlog.len(), "Ignoring stanzas received during registration");
    }
    match (reply.kind, reply.error) {
        (IqType::Result, _) => {
            info!(username, "Account registered");
            Ok(())
        }
        (_, Some(error)) if error.is_conflict() => {
            warn!(username, "Registration conflict: username already exists");
            Err(Error::RegistrationConflict)
        }
        (_, Some(error)) => Err(Error::Registration(error.to_string())),
        (_, None) => Err(Error::Registration("undefined-condition".to_string())),
    }
}

/// Bind a resource and return the full JID the server assigned.
///
/// Stanzas that arrive before the bind result are appended to `backlog`.
pub async fn bind(
    stream: &mut XmppStream,
    features: &StreamFeatures,
    resource: Option<&str>,
    deadline: Duration,
    backlog: &mut Vec<Element>,
) -> Result<Jid> {
    if !features.bind {
        return Err(Error::Bind("server does not offer resource binding".to_string()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let mut payload = Element::builder("bind", ns::BIND);
    if let Some(resource) = resource {
        payload = payload.append(Element::builder("resource", ns::BIND).append(resource).build());
    }
    stream
        .send_element(&Iq::set(id.as_str(), payload.build()).to_element())
        .await?;

    let reply = await_reply(stream, &id, deadline, backlog)
        .await
        .map_err(|e| step_failed(e, Error::Bind))?;
    if reply.kind != IqType::Result {
        let condition = reply
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        return Err(Error::Bind(condition));
    }
    let jid_text = reply
        .payload
        .as_ref()
        .filter(|p| p.is("bind", ns::BIND))
        .and_then(|p| p.get_child("jid", ns::BIND))
        .map(|j| j.text())
        .ok_or_else(|| Error::Bind("bind result carries no jid".to_string()))?;
    let jid = Jid::new(jid_text.trim())
        .map_err(|e| Error::Bind(format!("server assigned an invalid jid: {e}")))?;
    if jid.resource().is_none() {
        return Err(Error::Bind(format!("server assigned a bare jid: {jid}")));
    }

    if features.session_required {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Element::builder("session", ns::SESSION).build();
        stream
            .send_element(&Iq::set(id.as_str(), session).to_element())
            .await?;
        let reply = await_reply(stream, &id, deadline, backlog)
            .await
            .map_err(|e| step_failed(e, Error::Bind))?;
        if reply.kind != IqType::Result {
            return Err(Error::Bind("session establishment refused".to_string()));
        }
    }

    info!(jid = %jid, "Resource bound");
    Ok(jid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::parse_element;
    use crate::testing::{FakeServer, BIND_FEATURES};
    use crate::transport::{Connection, SecurityMode, XmppEndpoint};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const FEATURES: &str = "<stream:features>\
        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms>\
        <register xmlns='http://jabber.org/features/iq-register'/>\
        </stream:features>";

    const DEADLINE: Duration = Duration::from_secs(5);

    /// Connect to a fake server running `script` on the accepted socket.
    async fn connect<F, Fut>(script: F) -> (XmppStream, JoinHandle<FakeServer>)
    where
        F: FnOnce(FakeServer) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = FakeServer> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { script(FakeServer::accept(&listener).await).await });

        let endpoint = XmppEndpoint { host: "127.0.0.1".into(), port, mode: SecurityMode::Plain };
        let conn = Connection::open(&endpoint, "example.org", DEADLINE, false).await.unwrap();
        (XmppStream::new(conn, "example.org", false), server)
    }

    #[test]
    fn test_features_parsing() {
        let el = parse_element(
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             <session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session></stream:features>",
        )
        .unwrap();
        let features = StreamFeatures::from_element(&el);
        assert!(features.starttls);
        assert!(features.starttls_required);
        assert!(features.bind);
        assert!(!features.session_required);
        assert!(features.mechanisms.is_empty());
    }

    #[test]
    fn test_plain_payload() {
        assert_eq!(plain_payload("alice", "wonderland"), "AGFsaWNlAHdvbmRlcmxhbmQ=");
    }

    #[tokio::test]
    async fn test_open_stream_reads_features() {
        let (mut stream, server) = connect(|mut server| async move {
            server.greet(FEATURES).await;
            server
        })
        .await;

        let features = open_stream(&mut stream, "example.org", DEADLINE).await.unwrap();
        assert!(features.supports_mechanism("PLAIN"));
        assert!(features.register);
        assert!(!features.starttls);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_content_before_features_is_negotiation_error() {
        let (mut stream, server) = connect(|mut server| async move {
            server.greet("<message><body>too early</body></message>").await;
            server
        })
        .await;

        let err = open_stream(&mut stream, "example.org", DEADLINE).await.unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_sasl_failure_is_auth_error() {
        let (mut stream, server) = connect(|mut server| async move {
            server.greet(FEATURES).await;
            let auth = server.next_element().await;
            assert!(auth.is("auth", ns::SASL));
            assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
            assert_eq!(auth.text(), plain_payload("alice", "wrongpw"));
            server
                .send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
                .await;
            server
        })
        .await;

        let features = open_stream(&mut stream, "example.org", DEADLINE).await.unwrap();
        let err = authenticate(&mut stream, &features, "alice", "wrongpw", DEADLINE)
            .await
            .unwrap_err();
        match err {
            Error::Auth(condition) => assert_eq!(condition, "not-authorized"),
            other => panic!("expected auth error, got {other:?}"),
        }
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_error_answering_auth_is_auth_error() {
        let (mut stream, server) = connect(|mut server| async move {
            server.greet(FEATURES).await;
            server.next_element().await;
            server
                .send("<stream:error><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
                .await;
            server
        })
        .await;

        let features = open_stream(&mut stream, "example.org", DEADLINE).await.unwrap();
        match authenticate(&mut stream, &features, "alice", "pw", DEADLINE).await {
            Err(Error::Auth(condition)) => assert_eq!(condition, "not-authorized"),
            other => panic!("expected auth error, got {other:?}"),
        }
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_registration_conflict_409() {
        let (mut stream, server) = connect(|mut server| async move {
            server.greet(FEATURES).await;
            let request = server.expect_iq("set").await;
            let query = request.get_child("query", ns::REGISTER).unwrap();
            assert_eq!(query.get_child("username", ns::REGISTER).unwrap().text(), "alice");
            assert_eq!(query.get_child("password", ns::REGISTER).unwrap().text(), "pw");
            let id = request.attr("id").unwrap();
            server
                .send(&format!(
                    "<iq type='error' id='{id}'><error code='409' type='cancel'>\
                     <conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
                ))
                .await;
            server
        })
        .await;

        open_stream(&mut stream, "example.org", DEADLINE).await.unwrap();
        let err = register(&mut stream, "alice", "pw", DEADLINE).await.unwrap_err();
        assert!(matches!(err, Error::RegistrationConflict));
        assert!(err.is_recoverable());
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_registration_other_error_is_fatal() {
        let (mut stream, server) = connect(|mut server| async move {
            server.greet(FEATURES).await;
            let request = server.expect_iq("set").await;
            server.reply_error(&request, "not-allowed").await;
            server
        })
        .await;

        open_stream(&mut stream, "example.org", DEADLINE).await.unwrap();
        let err = register(&mut stream, "alice", "pw", DEADLINE).await.unwrap_err();
        match err {
            Error::Registration(condition) => assert_eq!(condition, "not-allowed"),
            other => panic!("expected registration error, got {other:?}"),
        }
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_returns_full_jid_and_keeps_backlog() {
        let (mut stream, server) = connect(|mut server| async move {
            let request = server.expect_iq("set").await;
            let bind = request.get_child("bind", ns::BIND).unwrap();
            assert_eq!(bind.get_child("resource", ns::BIND).unwrap().text(), "phone");
            server.send("<message from='bob@example.org/x'><body>early</body></message>").await;
            server
                .reply_result(
                    &request,
                    "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.org/phone</jid></bind>",
                )
                .await;
            server
        })
        .await;

        let features = StreamFeatures { bind: true, ..Default::default() };
        let mut backlog = Vec::new();
        let jid = bind(&mut stream, &features, Some("phone"), DEADLINE, &mut backlog)
            .await
            .unwrap();
        assert_eq!(jid, Jid::new("alice@example.org/phone").unwrap());
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].name(), "message");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_error_is_bind_error() {
        let (mut stream, server) = connect(|mut server| async move {
            let request = server.expect_iq("set").await;
            assert!(!request.get_child("bind", ns::BIND).unwrap().has_child("resource", ns::BIND));
            server.reply_error(&request, "not-allowed").await;
            server
        })
        .await;

        let features = StreamFeatures { bind: true, ..Default::default() };
        let err = bind(&mut stream, &features, None, DEADLINE, &mut Vec::new())
            .await
            .unwrap_err();
        match err {
            Error::Bind(condition) => assert_eq!(condition, "not-allowed"),
            other => panic!("expected bind error, got {other:?}"),
        }
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_error_answering_bind_is_bind_error() {
        let (mut stream, server) = connect(|mut server| async move {
            server.expect_iq("set").await;
            server
                .send("<stream:error><policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
                .await;
            server
        })
        .await;

        let features = StreamFeatures::from_element(&parse_element(BIND_FEATURES).unwrap());
        match bind(&mut stream, &features, None, DEADLINE, &mut Vec::new()).await {
            Err(Error::Bind(condition)) => assert_eq!(condition, "policy-violation"),
            other => panic!("expected bind error, got {other:?}"),
        }
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_hangup_during_session_establishment_is_bind_error() {
        let (mut stream, server) = connect(|mut server| async move {
            let request = server.expect_iq("set").await;
            server
                .reply_result(
                    &request,
                    "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.org/r</jid></bind>",
                )
                .await;
            let session = server.expect_iq("set").await;
            assert!(session.has_child("session", ns::SESSION));
            server.send("</stream:stream>").await;
            server
        })
        .await;

        let features = StreamFeatures { bind: true, session_required: true, ..Default::default() };
        let err = bind(&mut stream, &features, None, DEADLINE, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bind(_)), "got {err:?}");
        drop(server.await.unwrap());
    }
}
