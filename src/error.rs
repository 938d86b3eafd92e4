//! Error taxonomy for connection setup, negotiation and the live session.
//!
//! Construction-phase errors (`Connect`, `Negotiation`, `Auth`, `Bind`,
//! `Registration*`) are returned directly to the caller of `login` /
//! `register`. Inside the dispatch loop, `StanzaDecode` is logged and
//! swallowed; `TransportRead` and `StreamError` end the session and are
//! delivered through `SessionEvent::Terminated`.

use crate::stanza::StanzaError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DNS, TCP or TLS dial failure. No built-in retry.
    #[error("connect error: {0}")]
    Connect(String),

    /// Protocol violation during stream or STARTTLS setup.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Bad credentials or SASL failure. The caller may re-prompt.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The requested username is already taken.
    #[error("registration conflict: username already exists")]
    RegistrationConflict,

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("resource binding failed: {0}")]
    Bind(String),

    /// Malformed XML or a stanza that does not fit its schema.
    #[error("stanza decode error: {0}")]
    StanzaDecode(String),

    /// The connection dropped or stalled.
    #[error("transport read error: {0}")]
    TransportRead(String),

    /// The server sent `<stream:error>`.
    #[error("stream error from server: {0}")]
    StreamError(String),

    /// A request was answered with an IQ of type `error`.
    #[error("request failed: {0}")]
    RequestFailed(StanzaError),

    /// The session is gone, or went away while a request was in flight.
    #[error("session closed")]
    SessionClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid jid: {0}")]
    Jid(#[from] jid::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller can sensibly retry with different input on the
    /// same server (another username, another password) or keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RegistrationConflict | Error::Auth(_) | Error::StanzaDecode(_)
        )
    }

    /// Whether this error ends a live session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::TransportRead(_) | Error::StreamError(_) | Error::SessionClosed | Error::Io(_)
        )
    }
}
