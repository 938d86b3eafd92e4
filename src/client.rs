//! Entry points: log in to an existing account or register a new one.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::negotiation::{self, StreamFeatures};
use crate::session::{Session, SessionEvent};
use crate::transport::{Connection, SecurityMode, XmppStream};

/// Connect, secure the transport as configured and return the stream with
/// the features advertised on the (possibly TLS) stream.
async fn establish(config: &SessionConfig) -> Result<(XmppStream, StreamFeatures)> {
    config.validate()?;
    if config.insecure_tls {
        warn!("TLS certificate verification is DISABLED for this connection");
    }
    let domain = config.xmpp_domain();
    let deadline = config.negotiation_timeout();

    let endpoints = config.endpoints().await;
    let (conn, mode) =
        Connection::open_any(&endpoints, domain, config.connect_timeout(), config.insecure_tls)
            .await?;
    let mut stream = XmppStream::new(conn, domain, config.insecure_tls);
    let features = negotiation::open_stream(&mut stream, domain, deadline).await?;

    match mode {
        SecurityMode::StartTls => {
            if !features.starttls {
                stream.close().await;
                return Err(Error::Negotiation("server does not offer STARTTLS".to_string()));
            }
            let mut stream = stream.upgrade_to_tls(deadline).await?;
            let features = negotiation::open_stream(&mut stream, domain, deadline).await?;
            Ok((stream, features))
        }
        SecurityMode::Plain if features.starttls_required => {
            stream.close().await;
            Err(Error::Negotiation(
                "server requires STARTTLS but plain mode is configured".to_string(),
            ))
        }
        SecurityMode::Plain | SecurityMode::DirectTls => Ok((stream, features)),
    }
}

/// Log in and start a session.
///
/// Connects, authenticates with SASL PLAIN, binds a resource, spawns the
/// dispatch task and announces initial availability. Construction errors
/// are returned directly; later failures arrive as
/// [`SessionEvent::Terminated`] on the returned receiver.
pub async fn login(
    config: &SessionConfig,
) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>)> {
    let (mut stream, features) = establish(config).await?;
    let domain = config.xmpp_domain();
    let deadline = config.negotiation_timeout();

    let mut backlog = Vec::new();
    let bound = async {
        negotiation::authenticate(&mut stream, &features, &config.username, &config.password, deadline)
            .await?;
        let features = negotiation::open_stream(&mut stream, domain, deadline).await?;
        negotiation::bind(&mut stream, &features, config.resource.as_deref(), deadline, &mut backlog)
            .await
    }
    .await;
    let jid = match bound {
        Ok(jid) => jid,
        Err(e) => {
            negotiation::close_stream(&mut stream).await;
            stream.close().await;
            return Err(e);
        }
    };
    if jid.to_bare() != config.account_jid()? {
        warn!(bound = %jid, "Server bound a JID outside the configured account");
    }

    let (session, events) = Session::start(stream, jid, config, backlog)?;
    if let Err(e) = session.send_presence(None, None, 0).await {
        session.close().await;
        return Err(e);
    }
    info!(jid = %session.jid(), "Logged in");

    if config.fetch_offline_messages {
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.request_offline_messages().await {
                debug!(error = %e, "Offline message retrieval unavailable");
            }
        });
    }
    Ok((session, events))
}

/// Create `config.username` on the server by in-band registration, then
/// disconnect. A taken username is [`Error::RegistrationConflict`].
pub async fn register(config: &SessionConfig) -> Result<()> {
    let (mut stream, features) = establish(config).await?;
    if !features.register {
        debug!("Server does not advertise in-band registration, trying anyway");
    }

    let result = negotiation::register(
        &mut stream,
        &config.username,
        &config.password,
        config.negotiation_timeout(),
    )
    .await;
    negotiation::close_stream(&mut stream).await;
    stream.close().await;
    result
}
