//! Mutable session state, guarded by the session-wide lock.
//!
//! Nothing in here awaits; every method runs to completion while the lock
//! is held.

use std::collections::{HashMap, VecDeque};

use jid::BareJid;
use tokio::sync::mpsc;

use super::pending::PendingRequests;
use super::roster::{RosterItem, RosterUpdate};
use crate::stanza::{Message, Presence};

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Handed to an attached chat context.
    Delivered,
    /// Appended to the sender's queue.
    Queued,
}

struct AttachedChat {
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub struct SessionState {
    /// Set once the session has terminated; no new requests are accepted.
    pub closed: bool,
    roster: HashMap<BareJid, RosterItem>,
    presence: HashMap<BareJid, Presence>,
    queues: HashMap<BareJid, VecDeque<Message>>,
    chats: HashMap<BareJid, AttachedChat>,
    next_generation: u64,
    subscription_requests: Vec<BareJid>,
    pub pending: PendingRequests,
}

impl SessionState {
    pub fn roster(&self) -> impl Iterator<Item = &RosterItem> {
        self.roster.values()
    }

    /// Replace the whole cache with a fresh roster result.
    pub fn replace_roster(&mut self, items: &[RosterItem]) {
        self.roster = items
            .iter()
            .map(|item| (item.jid.clone(), item.clone()))
            .collect();
    }

    pub fn apply_roster_update(&mut self, update: RosterUpdate) {
        match update {
            RosterUpdate::Upsert(item) => {
                self.roster.insert(item.jid.clone(), item);
            }
            RosterUpdate::Remove(jid) => {
                self.roster.remove(&jid);
            }
        }
    }

    pub fn remove_roster_item(&mut self, jid: &BareJid) {
        self.roster.remove(jid);
    }

    pub fn presence_table(&self) -> &HashMap<BareJid, Presence> {
        &self.presence
    }

    /// Last write wins: the new presence replaces the old one entirely.
    pub fn record_presence(&mut self, jid: BareJid, presence: Presence) {
        self.presence.insert(jid, presence);
    }

    pub fn presence_of(&self, jid: &BareJid) -> Option<&Presence> {
        self.presence.get(jid)
    }

    /// Deliver to the attached chat for `from`, or queue.
    pub fn route_message(&mut self, from: &BareJid, msg: Message) -> Routed {
        let msg = match self.chats.get(from) {
            Some(chat) => match chat.tx.send(msg) {
                Ok(()) => return Routed::Delivered,
                // The context's receiver is gone without a detach.
                Err(mpsc::error::SendError(msg)) => {
                    self.chats.remove(from);
                    msg
                }
            },
            None => msg,
        };
        self.queues.entry(from.clone()).or_default().push_back(msg);
        Routed::Queued
    }

    /// Attach a chat for `jid`. The queue is drained into the new channel
    /// ahead of any live message. Replaces any earlier attachment.
    pub fn attach_chat(&mut self, jid: &BareJid) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        for msg in self.queues.remove(jid).unwrap_or_default() {
            // The receiver is alive in this scope, so the send cannot fail.
            let _ = tx.send(msg);
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.chats.insert(jid.clone(), AttachedChat { generation, tx });
        (generation, rx)
    }

    /// Detach `jid`, but only if `generation` still names the current
    /// attachment (or any attachment when `None`).
    pub fn detach_chat(&mut self, jid: &BareJid, generation: Option<u64>) -> bool {
        match (self.chats.get(jid), generation) {
            (Some(chat), Some(generation)) if chat.generation != generation => false,
            (Some(_), _) => {
                self.chats.remove(jid);
                true
            }
            (None, _) => false,
        }
    }

    pub fn queued_count(&self, jid: &BareJid) -> usize {
        self.queues.get(jid).map_or(0, VecDeque::len)
    }

    pub fn queued_counts(&self) -> HashMap<BareJid, usize> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(jid, queue)| (jid.clone(), queue.len()))
            .collect()
    }

    pub fn add_subscription_request(&mut self, from: BareJid) {
        if !self.subscription_requests.contains(&from) {
            self.subscription_requests.push(from);
        }
    }

    pub fn take_subscription_request(&mut self, from: &BareJid) -> bool {
        let before = self.subscription_requests.len();
        self.subscription_requests.retain(|jid| jid != from);
        before != self.subscription_requests.len()
    }

    pub fn subscription_requests(&self) -> &[BareJid] {
        &self.subscription_requests
    }

    /// Mark the session closed: waiting requests fail and chat contexts end.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.chats.clear();
        self.pending.fail_all()
    }
}
