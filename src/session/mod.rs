//! A live, authenticated XMPP session.
//!
//! One spawned dispatch task is the only reader of the socket. It decodes
//! each top-level stanza, updates [`SessionState`](state::SessionState) and
//! emits [`SessionEvent`]s. Caller operations write through a single writer
//! lock and, when they expect an answer, register in the pending-request
//! table that the dispatch task resolves.

pub mod pending;
pub mod roster;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use jid::{BareJid, Jid};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::stanza::{
    ns, parse_element, Element, Iq, IqType, Message, MessageType, Presence, PresenceType, Show,
    Stanza,
};
use crate::transport::{self, stream_error_condition, Connection, Frame, FrameReader, XmppStream};
use roster::RosterUpdate;
use state::{Routed, SessionState};

pub use roster::{Contact, RosterItem, Subscription};

/// Everything the session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// A message was queued because no chat context is attached for `from`.
    Message { from: BareJid, message: Message },
    /// The presence table entry for `jid` was replaced.
    PresenceChanged {
        jid: BareJid,
        show: Option<Show>,
        status: Option<String>,
        available: bool,
    },
    /// `from` asks to see our presence. Answer with
    /// [`Session::answer_subscription`]; there is no timeout.
    SubscriptionRequest { from: BareJid },
    /// `subscribed`, `unsubscribe` or `unsubscribed` from a contact.
    SubscriptionUpdate { from: BareJid, kind: PresenceType },
    /// The server pushed a roster change for `jid`.
    RosterChanged { jid: BareJid },
    /// The dispatch loop has exited. `None` after a local close.
    Terminated { error: Option<Error> },
}

struct Shared {
    jid: Jid,
    account: BareJid,
    server: BareJid,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<WriteHalf<Connection>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: broadcast::Sender<()>,
    /// Set when the owner starts a local close.
    closing: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, receiver is gone");
        }
    }

    async fn send(&self, xml: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::SessionClosed)?;
        transport::write_text(writer, xml).await
    }

    async fn send_stanza(&self, stanza: impl Into<Stanza>) -> Result<()> {
        self.send(&stanza.into().encode()).await
    }

    /// Close the write half once. Returns false when already closed.
    async fn close_writer(&self, stream_close: bool) -> bool {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return false;
        };
        if stream_close {
            if let Err(e) = transport::write_text(&mut writer, "</stream:stream>").await {
                debug!(error = %e, "Failed to send stream close");
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        true
    }
}

/// Handle to a live session. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("jid", &self.shared.jid)
            .finish_non_exhaustive()
    }
}

/// Timing knobs for the dispatch loop.
#[derive(Debug, Clone, Copy)]
struct Timers {
    keepalive: Duration,
    read_timeout: Duration,
}

impl Session {
    /// Take over a bound stream and spawn the dispatch task.
    ///
    /// `backlog` holds stanzas that arrived during negotiation; they are
    /// dispatched before anything read afterwards.
    pub fn start(
        stream: XmppStream,
        jid: Jid,
        config: &SessionConfig,
        backlog: Vec<Element>,
    ) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>)> {
        let server = BareJid::new(config.xmpp_domain())?;
        let (conn, frames) = stream.into_parts();
        let (reader, writer) = tokio::io::split(conn);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            account: jid.to_bare(),
            jid,
            server,
            state: Mutex::new(SessionState::default()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            events: events_tx,
            shutdown: shutdown_tx,
            closing: AtomicBool::new(false),
        });
        let timers = Timers {
            keepalive: config.keepalive_interval(),
            read_timeout: config.read_timeout(),
        };

        info!(jid = %shared.jid, "Session started");
        tokio::spawn(dispatch_loop(
            Arc::clone(&shared),
            reader,
            frames,
            backlog,
            shutdown_rx,
            timers,
        ));
        Ok((Session { shared }, events_rx))
    }

    /// The full JID bound for this session.
    pub fn jid(&self) -> &Jid {
        &self.shared.jid
    }

    pub fn account(&self) -> &BareJid {
        &self.shared.account
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Send an IQ request and wait for its `result` or `error`.
    ///
    /// The entry is registered before writing so a fast reply is never
    /// missed, and removed again however this future ends, including when
    /// the caller drops it. An `error` reply becomes
    /// [`Error::RequestFailed`].
    pub async fn request(&self, iq: Iq) -> Result<Iq> {
        let id = iq.id.clone();
        let rx = {
            let mut state = self.shared.state();
            if state.closed {
                return Err(Error::SessionClosed);
            }
            state.pending.register(&id)?
        };
        let _entry = PendingEntry { shared: &self.shared, id: &id };

        self.shared.send_stanza(iq).await?;
        let reply = rx.await.map_err(|_| Error::SessionClosed)?;
        match reply.kind {
            IqType::Error => Err(Error::RequestFailed(reply.error.unwrap_or_default())),
            _ => Ok(reply),
        }
    }

    /// Ask the server to flush messages stored while we were offline
    /// (XEP-0013). They arrive as ordinary messages.
    pub async fn request_offline_messages(&self) -> Result<()> {
        let offline = Element::builder("offline", ns::OFFLINE)
            .append(Element::builder("fetch", ns::OFFLINE).build())
            .build();
        self.request(Iq::get(new_id(), offline)).await?;
        debug!("Offline messages flushed");
        Ok(())
    }

    /// Fetch the roster and overlay the current presence table onto it.
    /// Also refreshes the local roster cache.
    pub async fn get_contacts(&self) -> Result<Vec<Contact>> {
        let query = Element::builder("query", ns::ROSTER).build();
        let reply = self.request(Iq::get(new_id(), query)).await?;

        let items: Vec<RosterItem> = reply
            .payload
            .as_ref()
            .filter(|p| p.is("query", ns::ROSTER))
            .map(roster::parse_query)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|update| match update {
                RosterUpdate::Upsert(item) => Some(item),
                RosterUpdate::Remove(_) => None,
            })
            .collect();

        let mut state = self.shared.state();
        state.replace_roster(&items);
        let contacts = roster::materialize(&items, state.presence_table());
        debug!(count = contacts.len(), "Roster fetched");
        Ok(contacts)
    }

    /// Re-apply the presence table to an earlier snapshot, without a round trip.
    pub fn refresh_presence(&self, contacts: &[Contact]) -> Vec<Contact> {
        roster::refresh(contacts, self.shared.state().presence_table())
    }

    /// Cached roster entries as of the last fetch or push.
    pub fn roster(&self) -> Vec<RosterItem> {
        self.shared.state().roster().cloned().collect()
    }

    /// Latest presence received from `jid`.
    pub fn presence_of(&self, jid: &BareJid) -> Option<Presence> {
        self.shared.state().presence_of(jid).cloned()
    }

    /// Ask `jid` for a presence subscription. Returns once written; the
    /// answer arrives later as a [`SessionEvent::SubscriptionUpdate`].
    pub async fn add_contact(&self, jid: &BareJid) -> Result<()> {
        info!(contact = %jid, "Requesting presence subscription");
        self.shared
            .send_stanza(Presence::directed(Jid::from(jid.clone()), PresenceType::Subscribe))
            .await
    }

    /// Unsubscribe from `jid` and remove it from the server roster.
    pub async fn remove_contact(&self, jid: &BareJid) -> Result<()> {
        info!(contact = %jid, "Removing contact");
        self.shared
            .send_stanza(Presence::directed(Jid::from(jid.clone()), PresenceType::Unsubscribe))
            .await?;
        self.request(Iq::set(new_id(), roster::remove_query(jid))).await?;
        self.shared.state().remove_roster_item(jid);
        Ok(())
    }

    /// Accept or refuse a pending subscription request from `jid`.
    pub async fn answer_subscription(&self, jid: &BareJid, accept: bool) -> Result<()> {
        let kind = if accept {
            PresenceType::Subscribed
        } else {
            PresenceType::Unsubscribed
        };
        self.shared
            .send_stanza(Presence::directed(Jid::from(jid.clone()), kind))
            .await?;
        self.shared.state().take_subscription_request(jid);
        info!(contact = %jid, accept, "Answered subscription request");
        Ok(())
    }

    /// Subscription requests not answered yet, oldest first.
    pub fn pending_subscriptions(&self) -> Vec<BareJid> {
        self.shared.state().subscription_requests().to_vec()
    }

    /// Write a chat message. Success means handed to the transport, not
    /// delivered.
    pub async fn send_message(&self, to: &Jid, body: &str) -> Result<()> {
        self.shared
            .send_stanza(Message::chat(to.clone(), body).with_id(new_id()))
            .await
    }

    pub async fn send_headline(&self, to: &Jid, body: &str) -> Result<()> {
        self.shared
            .send_stanza(Message::new(to.clone(), MessageType::Headline, body).with_id(new_id()))
            .await
    }

    /// Broadcast our own availability.
    pub async fn send_presence(
        &self,
        show: Option<Show>,
        status: Option<String>,
        priority: i8,
    ) -> Result<()> {
        let presence = Presence::available()
            .with_show(show)
            .with_status(status)
            .with_priority(priority);
        self.shared.send_stanza(presence).await
    }

    /// Attach a chat context for `jid`. It yields the queued messages first,
    /// in arrival order, then live ones. Dropping it detaches.
    pub fn attach_chat(&self, jid: &BareJid) -> ChatContext {
        let (generation, rx) = self.shared.state().attach_chat(jid);
        debug!(contact = %jid, "Chat attached");
        ChatContext {
            jid: jid.clone(),
            generation,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn detach_chat(&self, jid: &BareJid) -> bool {
        self.shared.state().detach_chat(jid, None)
    }

    pub fn queued_count(&self, jid: &BareJid) -> usize {
        self.shared.state().queued_count(jid)
    }

    pub fn queued_counts(&self) -> HashMap<BareJid, usize> {
        self.shared.state().queued_counts()
    }

    /// Send unavailable presence, then close the stream.
    pub async fn logout(&self) -> Result<()> {
        info!(jid = %self.shared.jid, "Logging out");
        let sent = self
            .shared
            .send_stanza(Presence::unavailable().with_status(Some("Logging out".to_string())))
            .await;
        self.close().await;
        sent
    }

    /// Delete the account on the server (XEP-0077 cancellation), then close.
    pub async fn remove_account(&self) -> Result<()> {
        let query = Element::builder("query", ns::REGISTER)
            .append(Element::builder("remove", ns::REGISTER).build())
            .build();
        let to = Jid::from(self.shared.server.clone());
        self.request(Iq::set(new_id(), query).with_to(Some(to))).await?;
        warn!(account = %self.shared.account, "Account removed");
        self.close().await;
        Ok(())
    }

    /// Close the stream and stop the dispatch task. Idempotent.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if self.shared.close_writer(true).await {
            debug!(jid = %self.shared.jid, "Session closing");
        }
        // No receiver means the dispatch task has already exited.
        let _ = self.shared.shutdown.send(());
    }
}

/// Pending-table entry owned by one [`Session::request`] call.
struct PendingEntry<'a> {
    shared: &'a Shared,
    id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        // No-op when the dispatch task already resolved it.
        self.shared.state().pending.cancel(self.id);
    }
}

/// Inbound messages for one contact while a conversation is open.
pub struct ChatContext {
    jid: BareJid,
    generation: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
}

impl ChatContext {
    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    /// Next message; `None` once detached or the session ended.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ChatContext {
    fn drop(&mut self) {
        self.shared
            .state()
            .detach_chat(&self.jid, Some(self.generation));
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Why the loop stopped.
enum Exit {
    Shutdown,
    Failed(Error),
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<Connection>,
    mut frames: FrameReader,
    backlog: Vec<Element>,
    mut shutdown: broadcast::Receiver<()>,
    timers: Timers,
) {
    let exit = 'run: {
        for el in backlog {
            if let Err(e) = handle_element(&shared, el).await {
                break 'run Exit::Failed(e);
            }
        }

        let mut last_read = Instant::now();
        let mut last_ping = last_read;
        loop {
            let idle = last_read.elapsed();
            if idle >= timers.read_timeout {
                break 'run Exit::Failed(Error::TransportRead(format!(
                    "no data from server for {}s",
                    idle.as_secs()
                )));
            }
            let wait = timers
                .keepalive
                .min(timers.read_timeout - idle)
                .max(Duration::from_millis(10));

            let frame = tokio::select! {
                _ = shutdown.recv() => None,
                read = tokio::time::timeout(wait, frames.next_frame(&mut reader)) => Some(read),
            };
            let Some(frame) = frame else {
                break 'run Exit::Shutdown;
            };

            match frame {
                Err(_elapsed) => {
                    if last_read.elapsed() >= timers.keepalive
                        && last_ping.elapsed() >= timers.keepalive
                    {
                        last_ping = Instant::now();
                        if let Err(e) = send_ping(&shared).await {
                            break 'run Exit::Failed(e);
                        }
                    }
                }
                Ok(Ok(frame)) => {
                    last_read = Instant::now();
                    let result = match frame {
                        Frame::StreamOpen(_) => Ok(()),
                        Frame::StreamClose => {
                            Err(Error::TransportRead("stream closed by server".to_string()))
                        }
                        Frame::Element(xml) => {
                            debug!(target: "fluux_client::transport", xml = xml.as_str(), "recv");
                            match parse_element(&xml) {
                                Ok(el) => handle_element(&shared, el).await,
                                Err(e) => {
                                    warn!(error = %e, "Dropping undecodable stanza");
                                    Ok(())
                                }
                            }
                        }
                    };
                    if let Err(e) = result {
                        break 'run Exit::Failed(e);
                    }
                }
                Ok(Err(e @ Error::StanzaDecode(_))) => {
                    last_read = Instant::now();
                    warn!(error = %e, "Skipped malformed data");
                }
                Ok(Err(e)) => break 'run Exit::Failed(e),
            }
        }
    };

    let error = match exit {
        Exit::Shutdown => None,
        // The server hanging up after our own close is not a failure.
        Exit::Failed(_) if shared.closing.load(Ordering::SeqCst) => None,
        Exit::Failed(e) => Some(e),
    };
    terminate(&shared, error).await;
}

async fn terminate(shared: &Shared, error: Option<Error>) {
    let orphaned = shared.state().close();
    shared.close_writer(false).await;
    match &error {
        Some(e) => warn!(jid = %shared.jid, error = %e, orphaned, "Session terminated"),
        None => info!(jid = %shared.jid, orphaned, "Session closed"),
    }
    shared.emit(SessionEvent::Terminated { error });
}

async fn send_ping(shared: &Shared) -> Result<()> {
    debug!("Idle, sending keepalive ping");
    let ping = Iq::get(new_id(), Element::builder("ping", ns::PING).build())
        .with_to(Some(Jid::from(shared.server.clone())));
    shared.send_stanza(ping).await
}

/// Handle one parsed top-level element. Only errors that end the session
/// are returned.
async fn handle_element(shared: &Shared, el: Element) -> Result<()> {
    if el.is("error", ns::STREAM) {
        return Err(Error::StreamError(stream_error_condition(&el)));
    }
    match Stanza::decode(el) {
        Ok(Stanza::Message(msg)) => handle_message(shared, msg),
        Ok(Stanza::Presence(presence)) => handle_presence(shared, presence),
        Ok(Stanza::Iq(iq)) => handle_iq(shared, iq).await?,
        Ok(Stanza::Unknown(el)) => {
            debug!(name = el.name(), ns = %el.ns(), "Ignoring unknown element");
        }
        Err(e) => warn!(error = %e, "Dropping undecodable stanza"),
    }
    Ok(())
}

fn handle_message(shared: &Shared, msg: Message) {
    let from = msg
        .from
        .as_ref()
        .map(Jid::to_bare)
        .unwrap_or_else(|| shared.server.clone());
    if !msg.has_body() {
        debug!(from = %from, kind = %msg.kind, "Ignoring message without body");
        return;
    }

    let routed = shared.state().route_message(&from, msg.clone());
    match routed {
        Routed::Delivered => debug!(from = %from, "Message delivered to open chat"),
        Routed::Queued => {
            debug!(from = %from, "No chat open, message queued");
            shared.emit(SessionEvent::Message { from, message: msg });
        }
    }
}

fn handle_presence(shared: &Shared, presence: Presence) {
    let Some(from) = presence.from.as_ref().map(Jid::to_bare) else {
        debug!("Ignoring presence without sender");
        return;
    };

    match presence.kind {
        PresenceType::Available | PresenceType::Unavailable => {
            let event = SessionEvent::PresenceChanged {
                jid: from.clone(),
                show: presence.show,
                status: presence.status.clone(),
                available: presence.kind == PresenceType::Available,
            };
            shared.state().record_presence(from, presence);
            shared.emit(event);
        }
        PresenceType::Subscribe => {
            info!(from = %from, "Subscription request");
            shared.state().add_subscription_request(from.clone());
            shared.emit(SessionEvent::SubscriptionRequest { from });
        }
        kind @ (PresenceType::Subscribed
        | PresenceType::Unsubscribe
        | PresenceType::Unsubscribed) => {
            info!(from = %from, kind = kind.as_str(), "Subscription update");
            shared.emit(SessionEvent::SubscriptionUpdate { from, kind });
        }
        PresenceType::Probe | PresenceType::Error => {
            debug!(from = %from, kind = presence.kind.as_str(), "Ignoring presence");
        }
    }
}

async fn handle_iq(shared: &Shared, iq: Iq) -> Result<()> {
    match iq.kind {
        IqType::Result | IqType::Error => {
            if let Some(iq) = shared.state().pending.resolve(iq) {
                debug!(id = %iq.id, kind = iq.kind.as_str(), "Unmatched IQ reply");
            }
            Ok(())
        }
        IqType::Get | IqType::Set => answer_request(shared, iq).await,
    }
}

async fn answer_request(shared: &Shared, iq: Iq) -> Result<()> {
    let reply = match (iq.kind, iq.payload_ns().as_deref()) {
        (_, None) | (IqType::Get, Some(ns::PING)) => Iq::result_for(&iq),
        (IqType::Get, Some(ns::VERSION)) => Iq::result_for(&iq).with_payload(
            Element::builder("query", ns::VERSION)
                .append(Element::builder("name", ns::VERSION).append(env!("CARGO_PKG_NAME")).build())
                .append(
                    Element::builder("version", ns::VERSION)
                        .append(env!("CARGO_PKG_VERSION"))
                        .build(),
                )
                .append(Element::builder("os", ns::VERSION).append(std::env::consts::OS).build())
                .build(),
        ),
        (IqType::Set, Some(ns::ROSTER)) => {
            let trusted = iq
                .from
                .as_ref()
                .map_or(true, |from| from.to_bare() == shared.account);
            if !trusted {
                warn!(from = ?iq.from, "Ignoring roster push from foreign sender");
                return Ok(());
            }
            let updates = iq.payload.as_ref().map(roster::parse_query).unwrap_or_default();
            let mut changed = Vec::with_capacity(updates.len());
            {
                let mut state = shared.state();
                for update in updates {
                    changed.push(match &update {
                        RosterUpdate::Upsert(item) => item.jid.clone(),
                        RosterUpdate::Remove(jid) => jid.clone(),
                    });
                    state.apply_roster_update(update);
                }
            }
            for jid in changed {
                shared.emit(SessionEvent::RosterChanged { jid });
            }
            Iq::result_for(&iq)
        }
        (_, Some(other)) => {
            debug!(id = %iq.id, ns = other, "Dropping request for unhandled namespace");
            return Ok(());
        }
    };
    send_reply(shared, reply).await
}

/// Write errors on replies end the session: the writer is gone.
async fn send_reply(shared: &Shared, reply: Iq) -> Result<()> {
    match shared.send_stanza(reply).await {
        Ok(()) => Ok(()),
        Err(Error::SessionClosed) => Ok(()),
        Err(e) => Err(Error::TransportRead(e.to_string())),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeServer, WAIT};
    use crate::transport::{SecurityMode, XmppEndpoint};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn config() -> SessionConfig {
        SessionConfig::new("127.0.0.1", 5222, "alice", "pw", SecurityMode::Plain)
            .with_domain("example.org")
    }

    fn bare(s: &str) -> BareJid {
        BareJid::new(s).unwrap()
    }

    async fn start_with(
        config: SessionConfig,
        backlog: Vec<Element>,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>, FakeServer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { FakeServer::accept(&listener).await });

        let endpoint = XmppEndpoint { host: "127.0.0.1".into(), port, mode: SecurityMode::Plain };
        let conn = Connection::open(&endpoint, "example.org", WAIT, false).await.unwrap();
        let server = accept.await.unwrap();
        let stream = XmppStream::new(conn, "example.org", false);
        let jid = Jid::new("alice@example.org/test").unwrap();
        let (session, events) = Session::start(stream, jid, &config, backlog).unwrap();
        (session, events, server)
    }

    async fn start() -> (Session, mpsc::UnboundedReceiver<SessionEvent>, FakeServer) {
        start_with(config(), Vec::new()).await
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn body_of(event: SessionEvent) -> (BareJid, String) {
        match event {
            SessionEvent::Message { from, message } => (from, message.body.unwrap()),
            other => panic!("expected message event, got {other:?}"),
        }
    }

    /// Next element, which must be a presence of type `kind` sent to `to`.
    async fn expect_presence(server: &mut FakeServer, to: &str, kind: &str) {
        let el = server.next_element().await;
        assert!(el.is("presence", ns::CLIENT), "expected presence, got <{}/>", el.name());
        assert_eq!(el.attr("to"), Some(to));
        assert_eq!(el.attr("type"), Some(kind));
    }

    #[tokio::test]
    async fn test_unknown_and_undecodable_stanzas_do_not_stop_dispatch() {
        let (_session, mut events, mut server) = start().await;
        server.send("<r xmlns='urn:xmpp:sm:3'/>").await;
        server.send("<message from='@example.org'><body>bad sender</body></message>").await;
        server.send("<presence from='bob@example.org' type='bogus'/>").await;
        server.send("<message from='bob@example.org/x'><body>still here</body></message>").await;

        let (from, body) = body_of(next_event(&mut events).await);
        assert_eq!(from, bare("bob@example.org"));
        assert_eq!(body, "still here");
    }

    #[tokio::test]
    async fn test_presence_last_write_wins() {
        let (session, mut events, mut server) = start().await;
        server
            .send("<presence from='bob@example.org/phone'><show>away</show><status>lunch</status></presence>")
            .await;
        server.send("<presence from='bob@example.org/laptop'/>").await;

        for _ in 0..2 {
            assert!(matches!(next_event(&mut events).await, SessionEvent::PresenceChanged { .. }));
        }
        let latest = session.presence_of(&bare("bob@example.org")).unwrap();
        assert_eq!(latest.show, None);
        assert_eq!(latest.status, None);

        let snapshot = vec![Contact {
            jid: bare("bob@example.org"),
            name: None,
            subscription: Subscription::Both,
            show: Some(Show::Away),
            status: "lunch".to_string(),
            available: true,
        }];
        let refreshed = session.refresh_presence(&snapshot);
        assert_eq!(refreshed[0].show, None);
        assert_eq!(refreshed[0].status, "Online");
    }

    #[tokio::test]
    async fn test_queue_drains_in_order_then_live_messages_flow_to_chat() {
        let (session, mut events, mut server) = start().await;
        for body in ["one", "two", "three"] {
            server
                .send(&format!("<message from='bob@example.org/x' type='chat'><body>{body}</body></message>"))
                .await;
        }
        for _ in 0..3 {
            body_of(next_event(&mut events).await);
        }
        let bob = bare("bob@example.org");
        assert_eq!(session.queued_count(&bob), 3);
        assert_eq!(session.queued_counts()[&bob], 3);

        let mut chat = session.attach_chat(&bob);
        assert_eq!(session.queued_count(&bob), 0);
        for expected in ["one", "two", "three"] {
            assert_eq!(chat.recv().await.unwrap().body.as_deref(), Some(expected));
        }

        server.send("<message from='bob@example.org/y' type='chat'><body>four</body></message>").await;
        let live = timeout(WAIT, chat.recv()).await.unwrap().unwrap();
        assert_eq!(live.body.as_deref(), Some("four"));
        assert!(events.try_recv().is_err());
        assert_eq!(session.queued_count(&bob), 0);

        drop(chat);
        server.send("<message from='bob@example.org/y'><body>five</body></message>").await;
        body_of(next_event(&mut events).await);
        assert_eq!(session.queued_count(&bob), 1);
    }

    #[tokio::test]
    async fn test_bodyless_and_senderless_messages() {
        let (_session, mut events, mut server) = start().await;
        server
            .send("<message from='bob@example.org/x'><composing xmlns='http://jabber.org/protocol/chatstates'/></message>")
            .await;
        server.send("<message><body>maintenance at noon</body></message>").await;

        let (from, body) = body_of(next_event(&mut events).await);
        assert_eq!(from, bare("example.org"));
        assert_eq!(body, "maintenance at noon");
    }

    #[tokio::test]
    async fn test_backlog_is_dispatched_first() {
        let early = parse_element("<message from='bob@example.org/x'><body>early</body></message>").unwrap();
        let (_session, mut events, _server) = start_with(config(), vec![early]).await;
        assert_eq!(body_of(next_event(&mut events).await).1, "early");
    }

    #[tokio::test]
    async fn test_send_message_succeeds_on_write() {
        let (session, _events, mut server) = start().await;
        let bob = Jid::new("bob@example.org").unwrap();
        session.send_message(&bob, "hi").await.unwrap();

        let sent = server.next_element().await;
        assert!(sent.is("message", ns::CLIENT));
        assert_eq!(sent.attr("to"), Some("bob@example.org"));
        assert_eq!(sent.attr("type"), Some("chat"));
        assert!(sent.attr("id").is_some());
        assert_eq!(sent.get_child("body", ns::CLIENT).unwrap().text(), "hi");
    }

    #[tokio::test]
    async fn test_send_headline() {
        let (session, _events, mut server) = start().await;
        let bob = Jid::new("bob@example.org/desk").unwrap();
        session.send_headline(&bob, "Build #42 passed").await.unwrap();

        let sent = server.next_element().await;
        let msg = Message::from_element(&sent).unwrap();
        assert_eq!(msg.kind, MessageType::Headline);
        assert_eq!(msg.to, Some(bob));
        assert_eq!(msg.body.as_deref(), Some("Build #42 passed"));
        assert!(msg.id.is_some());
    }

    #[tokio::test]
    async fn test_add_contact_then_subscribed_shows_in_roster() {
        let (session, mut events, mut server) = start().await;
        let bob = bare("bob@example.org");
        assert!(session.roster().is_empty());

        session.add_contact(&bob).await.unwrap();
        expect_presence(&mut server, "bob@example.org", "subscribe").await;
        server.send("<presence from='bob@example.org' type='subscribed'/>").await;
        match next_event(&mut events).await {
            SessionEvent::SubscriptionUpdate { from, kind } => {
                assert_eq!(from, bob);
                assert_eq!(kind, PresenceType::Subscribed);
            }
            other => panic!("unexpected {other:?}"),
        }

        let fetch = {
            let session = session.clone();
            tokio::spawn(async move { session.get_contacts().await })
        };
        let request = server.expect_iq("get").await;
        assert!(request.has_child("query", ns::ROSTER));
        server
            .reply_result(
                &request,
                "<query xmlns='jabber:iq:roster'><item jid='bob@example.org' subscription='to'/></query>",
            )
            .await;

        let contacts = fetch.await.unwrap().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].jid, bob);
        assert_eq!(contacts[0].subscription, Subscription::To);
        assert_eq!(contacts[0].status, "Offline");
        assert_eq!(session.roster().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_request_waits_for_answer() {
        let (session, mut events, mut server) = start().await;
        server.send("<presence from='carol@example.org/x' type='subscribe'/>").await;
        match next_event(&mut events).await {
            SessionEvent::SubscriptionRequest { from } => assert_eq!(from, bare("carol@example.org")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.pending_subscriptions(), vec![bare("carol@example.org")]);

        session.answer_subscription(&bare("carol@example.org"), true).await.unwrap();
        expect_presence(&mut server, "carol@example.org", "subscribed").await;
        assert!(session.pending_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_roster_push_and_courtesy_replies() {
        let (session, mut events, mut server) = start().await;
        server
            .send("<iq type='set' id='push1'><query xmlns='jabber:iq:roster'>\
                   <item jid='carol@example.org' name='Carol' subscription='both'/></query></iq>")
            .await;
        let ack = server.expect_iq("result").await;
        assert_eq!(ack.attr("id"), Some("push1"));
        assert_eq!(ack.children().count(), 0);
        match next_event(&mut events).await {
            SessionEvent::RosterChanged { jid } => assert_eq!(jid, bare("carol@example.org")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.roster()[0].name.as_deref(), Some("Carol"));

        server
            .send("<iq type='set' id='push2' from='mallory@evil.example'><query xmlns='jabber:iq:roster'>\
                   <item jid='mallory@evil.example' subscription='both'/></query></iq>")
            .await;
        server.send("<iq type='get' id='unknown1' from='example.org'><foo xmlns='urn:example:foo'/></iq>").await;
        server.send("<iq type='set' id='empty1' from='example.org'/>").await;
        server.send("<iq type='get' id='ping1' from='example.org'><ping xmlns='urn:xmpp:ping'/></iq>").await;

        // push2 and unknown1 get no reply, so the next two are ours.
        for id in ["empty1", "ping1"] {
            let reply = server.expect_iq("result").await;
            assert_eq!(reply.attr("id"), Some(id));
            assert_eq!(reply.attr("to"), Some("example.org"));
        }
        assert_eq!(session.roster().len(), 1);
    }

    #[tokio::test]
    async fn test_version_query_answered() {
        let (_session, _events, mut server) = start().await;
        server
            .send("<iq type='get' id='v1' from='bob@example.org/x'><query xmlns='jabber:iq:version'/></iq>")
            .await;
        let reply = server.expect_iq("result").await;
        assert_eq!(reply.attr("id"), Some("v1"));
        assert_eq!(reply.attr("to"), Some("bob@example.org/x"));
        let query = reply.get_child("query", ns::VERSION).unwrap();
        assert_eq!(query.get_child("name", ns::VERSION).unwrap().text(), "fluux-client");
        assert_eq!(
            query.get_child("version", ns::VERSION).unwrap().text(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_request_failed() {
        let (session, _events, mut server) = start().await;
        let remove = {
            let session = session.clone();
            tokio::spawn(async move { session.remove_contact(&bare("bob@example.org")).await })
        };
        expect_presence(&mut server, "bob@example.org", "unsubscribe").await;
        let request = server.expect_iq("set").await;
        let item = request
            .get_child("query", ns::ROSTER)
            .and_then(|q| q.get_child("item", ns::ROSTER))
            .unwrap();
        assert_eq!(item.attr("subscription"), Some("remove"));
        server.reply_error(&request, "item-not-found").await;

        match remove.await.unwrap() {
            Err(Error::RequestFailed(e)) => assert_eq!(e.condition.as_deref(), Some("item-not-found")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abandoned_requests_leave_no_pending_entries() {
        let (session, mut events, mut server) = start().await;
        let mut last = None;
        for _ in 0..5 {
            let attempt = timeout(Duration::from_millis(50), session.get_contacts()).await;
            assert!(attempt.is_err());
            last = Some(server.expect_iq("get").await);
        }
        assert_eq!(session.shared.state().pending.len(), 0);

        // A late reply to an abandoned id is dropped without disturbing dispatch.
        server.reply_result(&last.unwrap(), "<query xmlns='jabber:iq:roster'/>").await;
        server.send("<message from='bob@example.org/x'><body>after</body></message>").await;
        assert_eq!(body_of(next_event(&mut events).await).1, "after");
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_offline_message_fetch() {
        let (session, mut events, mut server) = start().await;
        let fetch = {
            let session = session.clone();
            tokio::spawn(async move { session.request_offline_messages().await })
        };
        let request = server.expect_iq("get").await;
        let offline = request.get_child("offline", ns::OFFLINE).unwrap();
        assert!(offline.has_child("fetch", ns::OFFLINE));

        server
            .send("<message from='bob@example.org/x' type='chat'><body>while you were out</body></message>")
            .await;
        server.reply_result(&request, "").await;
        fetch.await.unwrap().unwrap();
        assert_eq!(body_of(next_event(&mut events).await).1, "while you were out");
    }

    #[tokio::test]
    async fn test_remove_account_closes_session() {
        let (session, mut events, mut server) = start().await;
        let remove = {
            let session = session.clone();
            tokio::spawn(async move { session.remove_account().await })
        };
        let request = server.expect_iq("set").await;
        assert_eq!(request.attr("to"), Some("example.org"));
        let query = request.get_child("query", ns::REGISTER).unwrap();
        assert!(query.has_child("remove", ns::REGISTER));
        server.reply_result(&request, "").await;

        remove.await.unwrap().unwrap();
        server.expect_stream_close().await;
        match next_event(&mut events).await {
            SessionEvent::Terminated { error: None } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.is_closed());
        assert_eq!(session.shared.state().pending.len(), 0);
    }

    #[tokio::test]
    async fn test_remove_account_refused_keeps_session() {
        let (session, _events, mut server) = start().await;
        let remove = {
            let session = session.clone();
            tokio::spawn(async move { session.remove_account().await })
        };
        let request = server.expect_iq("set").await;
        server.reply_error(&request, "not-allowed").await;

        match remove.await.unwrap() {
            Err(Error::RequestFailed(e)) => assert_eq!(e.condition.as_deref(), Some("not-allowed")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!session.is_closed());
        assert_eq!(session.shared.state().pending.len(), 0);

        let bob = Jid::new("bob@example.org").unwrap();
        session.send_message(&bob, "still here").await.unwrap();
        assert!(server.next_element().await.is("message", ns::CLIENT));
    }

    #[tokio::test]
    async fn test_connection_loss_terminates_and_fails_pending() {
        let (session, mut events, mut server) = start().await;
        let fetch = {
            let session = session.clone();
            tokio::spawn(async move { session.get_contacts().await })
        };
        server.expect_iq("get").await;
        drop(server);

        assert!(matches!(fetch.await.unwrap(), Err(Error::SessionClosed)));
        match next_event(&mut events).await {
            SessionEvent::Terminated { error: Some(Error::TransportRead(_)) } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.is_closed());
        let bob = Jid::new("bob@example.org").unwrap();
        assert!(matches!(session.send_message(&bob, "hi").await, Err(Error::SessionClosed)));
        assert!(matches!(session.get_contacts().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_stream_error_terminates_session() {
        let (_session, mut events, mut server) = start().await;
        server
            .send("<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
            .await;
        match next_event(&mut events).await {
            SessionEvent::Terminated { error: Some(Error::StreamError(condition)) } => {
                assert_eq!(condition, "conflict")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_logout_sends_unavailable_and_closes() {
        let (session, mut events, mut server) = start().await;
        session.logout().await.unwrap();
        let presence = Presence::from_element(&server.next_element().await).unwrap();
        assert_eq!(presence.kind, PresenceType::Unavailable);
        server.expect_stream_close().await;
        match next_event(&mut events).await {
            SessionEvent::Terminated { error: None } => {}
            other => panic!("unexpected {other:?}"),
        }
        // Second close is a no-op.
        session.close().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_keepalive_ping_then_read_timeout() {
        let mut config = config();
        config.keepalive_interval_secs = 1;
        config.read_timeout_secs = 3;
        let (_session, mut events, mut server) = start_with(config, Vec::new()).await;

        let ping = server.expect_iq("get").await;
        assert!(ping.has_child("ping", ns::PING));
        assert_eq!(ping.attr("to"), Some("example.org"));
        match next_event(&mut events).await {
            SessionEvent::Terminated { error: Some(Error::TransportRead(_)) } => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
