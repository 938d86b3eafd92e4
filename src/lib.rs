//! XMPP client core: connection setup, SASL authentication, resource
//! binding and a live session that tracks roster, presence and unread
//! messages while dispatching inbound stanzas.
//!
//! ```no_run
//! # async fn demo() -> fluux_client::Result<()> {
//! use fluux_client::{SecurityMode, SessionConfig, SessionEvent};
//!
//! let config = SessionConfig::new("example.org", 5222, "alice", "secret", SecurityMode::StartTls);
//! let (session, mut events) = fluux_client::login(&config).await?;
//! let contacts = session.get_contacts().await?;
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Terminated { error } = event {
//!         eprintln!("session ended: {error:?}");
//!         break;
//!     }
//! }
//! # drop(contacts);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod negotiation;
pub mod session;
pub mod stanza;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{login, register};
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use session::{ChatContext, Contact, RosterItem, Session, SessionEvent, Subscription};
pub use stanza::{
    Element, Iq, IqType, Message, MessageType, Presence, PresenceType, Show, Stanza, StanzaError,
};
pub use transport::SecurityMode;

pub use jid::{BareJid, Jid};
