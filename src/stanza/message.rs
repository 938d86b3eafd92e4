use std::fmt;
use std::str::FromStr;

use jid::Jid;

use super::{jid_attr, ns, Element};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    /// No `type` attribute on the wire.
    #[default]
    Normal,
    Chat,
    GroupChat,
    Headline,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::Chat => "chat",
            MessageType::GroupChat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "chat" => MessageType::Chat,
            "groupchat" => MessageType::GroupChat,
            "headline" => MessageType::Headline,
            "error" => MessageType::Error,
            // Unknown types are handled as normal messages (RFC 6121 5.2.2).
            _ => MessageType::Normal,
        })
    }
}

/// A `<message/>` stanza. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: MessageType,
    pub body: Option<String>,
    pub subject: Option<String>,
    pub thread: Option<String>,
}

impl Message {
    pub fn new(to: Jid, kind: MessageType, body: impl Into<String>) -> Self {
        Message {
            id: None,
            from: None,
            to: Some(to),
            kind,
            body: Some(body.into()),
            subject: None,
            thread: None,
        }
    }

    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        Message::new(to, MessageType::Chat, body)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn has_body(&self) -> bool {
        self.body.as_deref().is_some_and(|body| !body.is_empty())
    }

    pub fn to_element(&self) -> Element {
        let kind = match self.kind {
            MessageType::Normal => None,
            other => Some(other.as_str()),
        };
        let children = [
            ("subject", &self.subject),
            ("body", &self.body),
            ("thread", &self.thread),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_ref()
                .map(|value| Element::builder(name, ns::CLIENT).append(value.as_str()).build())
        });

        Element::builder("message", ns::CLIENT)
            .attr("id", self.id.clone())
            .attr("from", self.from.as_ref().map(|j| j.to_string()))
            .attr("to", self.to.as_ref().map(|j| j.to_string()))
            .attr("type", kind)
            .append_all(children)
            .build()
    }

    pub fn from_element(el: &Element) -> Result<Self> {
        if el.name() != "message" {
            return Err(Error::StanzaDecode(format!(
                "expected <message/>, got <{}/>",
                el.name()
            )));
        }
        let child_text = |name: &str| el.get_child(name, ns::CLIENT).map(|c| c.text());

        Ok(Message {
            id: el.attr("id").map(str::to_string),
            from: jid_attr(el, "from")?,
            to: jid_attr(el, "to")?,
            kind: el.attr("type").map(MessageType::from_str).transpose()?.unwrap_or_default(),
            body: child_text("body"),
            subject: child_text("subject"),
            thread: child_text("thread"),
        })
    }
}
