use std::str::FromStr;

use jid::Jid;

use super::{jid_attr, ns, Element};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceType {
    /// No `type` attribute on the wire.
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceType::Available => "available",
            PresenceType::Unavailable => "unavailable",
            PresenceType::Subscribe => "subscribe",
            PresenceType::Subscribed => "subscribed",
            PresenceType::Unsubscribe => "unsubscribe",
            PresenceType::Unsubscribed => "unsubscribed",
            PresenceType::Probe => "probe",
            PresenceType::Error => "error",
        }
    }

    /// Subscription management rather than availability.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            PresenceType::Subscribe
                | PresenceType::Subscribed
                | PresenceType::Unsubscribe
                | PresenceType::Unsubscribed
        )
    }
}

impl FromStr for PresenceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "available" => Ok(PresenceType::Available),
            "unavailable" => Ok(PresenceType::Unavailable),
            "subscribe" => Ok(PresenceType::Subscribe),
            "subscribed" => Ok(PresenceType::Subscribed),
            "unsubscribe" => Ok(PresenceType::Unsubscribe),
            "unsubscribed" => Ok(PresenceType::Unsubscribed),
            "probe" => Ok(PresenceType::Probe),
            "error" => Ok(PresenceType::Error),
            other => Err(Error::StanzaDecode(format!("unknown presence type '{other}'"))),
        }
    }
}

/// Availability sub-state carried in `<show/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Show {
    Chat,
    Away,
    Dnd,
    Xa,
}

impl Show {
    pub fn as_str(&self) -> &'static str {
        match self {
            Show::Chat => "chat",
            Show::Away => "away",
            Show::Dnd => "dnd",
            Show::Xa => "xa",
        }
    }

    fn parse(s: &str) -> Option<Show> {
        match s.trim() {
            "chat" => Some(Show::Chat),
            "away" => Some(Show::Away),
            "dnd" => Some(Show::Dnd),
            "xa" => Some(Show::Xa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Presence {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: PresenceType,
    pub show: Option<Show>,
    pub status: Option<String>,
    pub priority: i8,
}

impl Presence {
    pub fn new(kind: PresenceType) -> Self {
        Presence {
            kind,
            ..Default::default()
        }
    }

    pub fn available() -> Self {
        Presence::new(PresenceType::Available)
    }

    pub fn unavailable() -> Self {
        Presence::new(PresenceType::Unavailable)
    }

    /// A directed presence of the given type, e.g. `subscribe` to a contact.
    pub fn directed(to: Jid, kind: PresenceType) -> Self {
        Presence {
            to: Some(to),
            ..Presence::new(kind)
        }
    }

    pub fn with_show(mut self, show: Option<Show>) -> Self {
        self.show = show;
        self
    }

    pub fn with_status(mut self, status: Option<String>) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn to_element(&self) -> Element {
        let kind = match self.kind {
            PresenceType::Available => None,
            other => Some(other.as_str()),
        };
        let mut builder = Element::builder("presence", ns::CLIENT)
            .attr("id", self.id.clone())
            .attr("from", self.from.as_ref().map(|j| j.to_string()))
            .attr("to", self.to.as_ref().map(|j| j.to_string()))
            .attr("type", kind);
        if let Some(show) = self.show {
            builder = builder.append(Element::builder("show", ns::CLIENT).append(show.as_str()).build());
        }
        if let Some(status) = &self.status {
            builder = builder.append(Element::builder("status", ns::CLIENT).append(status.as_str()).build());
        }
        if self.priority != 0 {
            builder = builder.append(
                Element::builder("priority", ns::CLIENT)
                    .append(self.priority.to_string())
                    .build(),
            );
        }
        builder.build()
    }

    pub fn from_element(el: &Element) -> Result<Self> {
        if el.name() != "presence" {
            return Err(Error::StanzaDecode(format!(
                "expected <presence/>, got <{}/>",
                el.name()
            )));
        }
        let kind = match el.attr("type") {
            Some(kind) => kind.parse()?,
            None => PresenceType::Available,
        };
        let priority = match el.get_child("priority", ns::CLIENT) {
            Some(p) => p.text().trim().parse::<i8>().map_err(|e| {
                Error::StanzaDecode(format!("invalid priority '{}': {e}", p.text()))
            })?,
            None => 0,
        };

        Ok(Presence {
            id: el.attr("id").map(str::to_string),
            from: jid_attr(el, "from")?,
            to: jid_attr(el, "to")?,
            kind,
            show: el.get_child("show", ns::CLIENT).and_then(|s| Show::parse(&s.text())),
            status: el.get_child("status", ns::CLIENT).map(|s| s.text()),
            priority,
        })
    }
}
