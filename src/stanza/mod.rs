//! Typed stanzas and their XML encoding.
//!
//! The set of top-level stanzas is closed: anything that is not a
//! `<message/>`, `<presence/>` or `<iq/>` decodes as [`Stanza::Unknown`]
//! and is left to the caller to log and drop.

mod iq;
mod message;
pub mod ns;
mod presence;

use std::fmt;

use jid::Jid;

pub use iq::{Iq, IqType};
pub use message::{Message, MessageType};
pub use minidom::Element;
pub use presence::{Presence, PresenceType, Show};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
    Unknown(Element),
}

impl Stanza {
    pub fn decode(el: Element) -> Result<Stanza> {
        if el.ns() != ns::CLIENT {
            return Ok(Stanza::Unknown(el));
        }
        Ok(match el.name() {
            "message" => Stanza::Message(Message::from_element(&el)?),
            "presence" => Stanza::Presence(Presence::from_element(&el)?),
            "iq" => Stanza::Iq(Iq::from_element(&el)?),
            _ => Stanza::Unknown(el),
        })
    }

    pub fn parse(xml: &str) -> Result<Stanza> {
        Stanza::decode(parse_element(xml)?)
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(msg) => msg.to_element(),
            Stanza::Presence(presence) => presence.to_element(),
            Stanza::Iq(iq) => iq.to_element(),
            Stanza::Unknown(el) => el.clone(),
        }
    }

    pub fn encode(&self) -> String {
        String::from(&self.to_element())
    }
}

impl From<Message> for Stanza {
    fn from(msg: Message) -> Self {
        Stanza::Message(msg)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

/// The `<error/>` child of a stanza of type `error`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StanzaError {
    /// `type` attribute: cancel, continue, modify, auth or wait.
    pub kind: Option<String>,
    /// Legacy numeric code, still sent by some servers.
    pub code: Option<u16>,
    /// Defined condition element name, e.g. `conflict`.
    pub condition: Option<String>,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(kind: &str, condition: &str) -> Self {
        StanzaError {
            kind: Some(kind.to_string()),
            code: None,
            condition: Some(condition.to_string()),
            text: None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.condition.as_deref() == Some("conflict") || self.code == Some(409)
    }

    pub fn from_element(el: &Element) -> StanzaError {
        let condition = el
            .children()
            .find(|child| child.ns() == ns::STANZAS && child.name() != "text")
            .map(|child| child.name().to_string());
        let text = el
            .get_child("text", ns::STANZAS)
            .map(|t| t.text())
            .filter(|t| !t.is_empty());

        StanzaError {
            kind: el.attr("type").map(str::to_string),
            code: el.attr("code").and_then(|c| c.parse().ok()),
            condition,
            text,
        }
    }

    pub fn to_element(&self) -> Element {
        let condition = self
            .condition
            .as_deref()
            .map(|condition| Element::builder(condition, ns::STANZAS).build());
        let text = self
            .text
            .as_deref()
            .map(|text| Element::builder("text", ns::STANZAS).append(text).build());

        Element::builder("error", ns::CLIENT)
            .attr("type", self.kind.clone())
            .attr("code", self.code.map(|c| c.to_string()))
            .append_all(condition)
            .append_all(text)
            .build()
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.condition, self.code) {
            (Some(condition), _) => f.write_str(condition)?,
            (None, Some(code)) => write!(f, "code {code}")?,
            (None, None) => f.write_str("undefined-condition")?,
        }
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

/// Parse one framed top-level element.
///
/// Stream-level fragments arrive without their enclosing
/// `<stream:stream>`, so they are parsed inside a stand-in root that
/// carries the client namespace and the `stream` prefix. Elements without
/// their own `xmlns` inherit `jabber:client`, as they would on the wire.
pub fn parse_element(xml: &str) -> Result<Element> {
    let wrapped = format!(
        "<stream:stream xmlns=\"{}\" xmlns:stream=\"{}\">{xml}</stream:stream>",
        ns::CLIENT,
        ns::STREAM
    );
    let root: Element = wrapped
        .parse()
        .map_err(|e: minidom::Error| Error::StanzaDecode(format!("malformed XML: {e}")))?;
    root.children()
        .next()
        .cloned()
        .ok_or_else(|| Error::StanzaDecode("fragment holds no element".to_string()))
}

/// Read an optional JID attribute. A present but malformed value is a
/// decode error for the whole stanza.
pub(crate) fn jid_attr(el: &Element, name: &str) -> Result<Option<Jid>> {
    el.attr(name)
        .map(|value| {
            Jid::new(value).map_err(|e| {
                Error::StanzaDecode(format!("invalid '{name}' attribute '{value}': {e}"))
            })
        })
        .transpose()
}
