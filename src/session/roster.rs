//! Roster items and their materialization into contacts.

use std::collections::HashMap;
use std::fmt;

use jid::BareJid;
use tracing::warn;

use crate::stanza::{ns, Element, Presence, PresenceType, Show};

/// Subscription state of a roster item (RFC 6121 2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `<item/>` of the server-side roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub jid: BareJid,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// An outbound subscription request is awaiting approval.
    pub ask: bool,
}

/// An item as carried by a roster result or push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterUpdate {
    Upsert(RosterItem),
    Remove(BareJid),
}

/// Parse the items of a `jabber:iq:roster` query. Items with an invalid
/// JID or an unknown subscription value are skipped.
pub fn parse_query(query: &Element) -> Vec<RosterUpdate> {
    query
        .children()
        .filter(|c| c.is("item", ns::ROSTER))
        .filter_map(|item| {
            let raw = item.attr("jid")?;
            let jid = match BareJid::new(raw) {
                Ok(jid) => jid,
                Err(e) => {
                    warn!(jid = raw, error = %e, "Skipping roster item with invalid jid");
                    return None;
                }
            };
            let subscription = match item.attr("subscription").unwrap_or("none") {
                "remove" => return Some(RosterUpdate::Remove(jid)),
                "none" => Subscription::None,
                "to" => Subscription::To,
                "from" => Subscription::From,
                "both" => Subscription::Both,
                other => {
                    warn!(jid = raw, subscription = other, "Skipping roster item with unknown subscription");
                    return None;
                }
            };
            Some(RosterUpdate::Upsert(RosterItem {
                jid,
                name: item.attr("name").filter(|n| !n.is_empty()).map(str::to_string),
                subscription,
                ask: item.attr("ask") == Some("subscribe"),
            }))
        })
        .collect()
}

/// `<query xmlns='jabber:iq:roster'><item jid='..' subscription='remove'/></query>`
pub fn remove_query(jid: &BareJid) -> Element {
    Element::builder("query", ns::ROSTER)
        .append(
            Element::builder("item", ns::ROSTER)
                .attr("jid", jid.to_string())
                .attr("subscription", "remove")
                .build(),
        )
        .build()
}

/// A roster entry with the latest known presence laid over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub jid: BareJid,
    pub name: Option<String>,
    pub subscription: Subscription,
    pub show: Option<Show>,
    /// Explicit status text, else "Online" when available, else "Offline".
    pub status: String,
    pub available: bool,
}

impl Contact {
    fn from_item(item: &RosterItem) -> Self {
        Contact {
            jid: item.jid.clone(),
            name: item.name.clone(),
            subscription: item.subscription,
            show: None,
            status: "Offline".to_string(),
            available: false,
        }
    }

    /// Replace the presence-derived fields. No merge with the old values.
    fn apply_presence(&mut self, presence: Option<&Presence>) {
        let available = presence.is_some_and(|p| p.kind == PresenceType::Available);
        self.available = available;
        self.show = presence.and_then(|p| p.show);
        self.status = status_text(presence.and_then(|p| p.status.as_deref()), available);
    }
}

fn status_text(explicit: Option<&str>, available: bool) -> String {
    match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => text.to_string(),
        None if available => "Online".to_string(),
        None => "Offline".to_string(),
    }
}

/// Build the contact list for `items`, in roster order.
pub fn materialize(items: &[RosterItem], presence: &HashMap<BareJid, Presence>) -> Vec<Contact> {
    items
        .iter()
        .map(|item| {
            let mut contact = Contact::from_item(item);
            contact.apply_presence(presence.get(&item.jid));
            contact
        })
        .collect()
}

/// Re-apply the presence table onto an earlier snapshot.
pub fn refresh(contacts: &[Contact], presence: &HashMap<BareJid, Presence>) -> Vec<Contact> {
    contacts
        .iter()
        .map(|contact| {
            let mut contact = contact.clone();
            contact.apply_presence(presence.get(&contact.jid));
            contact
        })
        .collect()
}
