//! Outstanding IQ requests, keyed by stanza id.
//!
//! Callers register before writing their request; the dispatch task is the
//! only one that resolves entries.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::stanza::Iq;

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: HashMap<String, oneshot::Sender<Iq>>,
}

impl PendingRequests {
    pub fn register(&mut self, id: &str) -> Result<oneshot::Receiver<Iq>> {
        if self.waiters.contains_key(id) {
            return Err(Error::Config(format!("iq id '{id}' is already awaiting a reply")));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Hand `iq` to whoever waits on its id. Returns the stanza back when
    /// nobody does.
    pub fn resolve(&mut self, iq: Iq) -> Option<Iq> {
        match self.waiters.remove(&iq.id) {
            // A dropped receiver means the caller gave up; the reply is consumed either way.
            Some(tx) => {
                let _ = tx.send(iq);
                None
            }
            None => Some(iq),
        }
    }

    pub fn cancel(&mut self, id: &str) {
        self.waiters.remove(id);
    }

    /// Drop every waiter; their receivers observe the closed channel.
    pub fn fail_all(&mut self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
