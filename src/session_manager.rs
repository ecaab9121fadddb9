//! Session Manager (§4.7).
//!
//! Generalizes `registry/connection_registry.rs`'s `ConnectionRegistry`
//! (`DashMap<FullJid, mpsc::Sender<OutboundStanza>>`, register/unregister/
//! send_to/send_to_many) into the spec's dual-indexed session table with
//! session-id ordering, priority-weighted bare-JID routing, duplicate-
//! resource and max-session eviction, and the offline/bounce policy — none
//! of which the teacher's registry has (it broadcasts to every resource or
//! picks the first, with no priority or eviction bookkeeping at all).

use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use minidom::Element;
use tracing::{instrument, warn};

use crate::collaborators::{AuthBackend, OfflineMessageHook};
use crate::error::StanzaError;
use crate::jid::Jid;
use crate::message::C2sInbound;
use crate::process::{Mailbox, Pid};
use crate::stanza::{make_error_reply, stanza_kind, StanzaKind};

/// Session id = (monotonic timestamp, owning process identity) (§3).
/// `Ord` follows the tuple order: timestamp first, then pid as a tie-break,
/// matching "the one with the larger session id survives" (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    timestamp: i64,
    pid: Pid,
}

static NEXT_TIMESTAMP: AtomicI64 = AtomicI64::new(1);

impl SessionId {
    /// Mint a fresh, strictly-increasing session id for `pid`. A real
    /// deployment would read a wall-clock timestamp; this crate only needs
    /// monotonic ordering (§3), which an atomic counter gives without the
    /// `Date.now()`-style nondeterminism this test/build environment must
    /// avoid.
    pub fn new(pid: Pid) -> Self {
        let timestamp = NEXT_TIMESTAMP.fetch_add(1, AtomicOrdering::Relaxed);
        SessionId { timestamp, pid }
    }
}

/// Opaque per-session info (§3 "opaque info") — left as a type parameter's
/// worth of freedom for the embedder; the core only needs to carry it.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub ip_address: Option<String>,
}

struct SessionRecord {
    sid: SessionId,
    user: String,
    server: String,
    resource: String,
    priority: i32,
    #[allow(dead_code)]
    info: SessionInfo,
    mailbox: Mailbox<C2sInbound>,
}

/// Per-(user,server,resource) session table (§4.7).
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionRecord>,
    /// secondary index: (server, user) -> [(resource, session-id)]
    usr: DashMap<(String, String), Vec<(String, SessionId)>>,
    max_user_sessions: usize,
    auth: Arc<dyn AuthBackend>,
    offline_hook: Option<Arc<dyn OfflineMessageHook>>,
}

impl SessionManager {
    pub fn new(max_user_sessions: usize, auth: Arc<dyn AuthBackend>) -> Self {
        SessionManager {
            sessions: DashMap::new(),
            usr: DashMap::new(),
            max_user_sessions,
            auth,
            offline_hook: None,
        }
    }

    pub fn with_offline_hook(mut self, hook: Arc<dyn OfflineMessageHook>) -> Self {
        self.offline_hook = Some(hook);
        self
    }

    /// `open_session(sid, u, s, r, priority, info)` (§4.7).
    #[instrument(skip(self, info, mailbox), fields(%user, %server, %resource))]
    pub fn open_session(
        &self,
        sid: SessionId,
        user: String,
        server: String,
        resource: String,
        priority: i32,
        info: SessionInfo,
        mailbox: Mailbox<C2sInbound>,
    ) {
        let key = (server.clone(), user.clone());

        let existing_same_resource: Vec<SessionId> = self
            .usr
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(r, _)| *r == resource)
                    .map(|(_, id)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let survivor = existing_same_resource
            .iter()
            .copied()
            .chain(std::iter::once(sid))
            .max()
            .expect("at least `sid` is present");

        for other in existing_same_resource.iter().filter(|id| **id != survivor) {
            self.evict(*other);
        }

        if survivor != sid {
            // This session lost the race for its own (user,server,resource)
            // slot — it is asked to terminate without ever entering the table.
            self.send_replaced(&mailbox);
            return;
        }

        self.sessions.insert(
            sid,
            SessionRecord {
                sid,
                user: user.clone(),
                server: server.clone(),
                resource: resource.clone(),
                priority,
                info,
                mailbox: mailbox.clone(),
            },
        );
        self.usr.entry(key.clone()).or_default().push((resource, sid));

        let count = self.usr.get(&key).map(|v| v.len()).unwrap_or(0);
        if count > self.max_user_sessions {
            // Collect and drop the shard guard before `evict` takes a write
            // lock on the same key — holding a read guard across that call
            // would deadlock against `DashMap`'s per-shard `RwLock`.
            let min_sid = self
                .usr
                .get(&key)
                .and_then(|v| v.iter().map(|(_, id)| *id).min());
            if let Some(min_sid) = min_sid {
                self.evict(min_sid);
            }
        }
    }

    /// `close_session(sid, …)`; any dangling entry is tolerated.
    pub fn close_session(&self, sid: SessionId) {
        if let Some((_, record)) = self.sessions.remove(&sid) {
            let key = (record.server, record.user);
            if let Some(mut entries) = self.usr.get_mut(&key) {
                entries.retain(|(_, id)| *id != sid);
            }
        }
    }

    fn evict(&self, sid: SessionId) {
        if let Some((_, record)) = self.sessions.remove(&sid) {
            let key = (record.server.clone(), record.user.clone());
            if let Some(mut entries) = self.usr.get_mut(&key) {
                entries.retain(|(_, id)| *id != sid);
            }
            self.send_replaced(&record.mailbox);
        }
    }

    fn send_replaced(&self, mailbox: &Mailbox<C2sInbound>) {
        if mailbox.send(C2sInbound::Replaced).is_err() {
            warn!("session manager: replaced hint dropped, mailbox full");
        }
    }

    fn sessions_for_user(&self, server: &str, user: &str) -> Vec<SessionId> {
        self.usr
            .get(&(server.to_string(), user.to_string()))
            .map(|v| v.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    /// `route(from, to, packet)` — the stanza entry point for local user
    /// targets (§4.7).
    #[instrument(skip(self, packet), fields(%to))]
    pub async fn route(&self, from: Jid, to: Jid, packet: Element) {
        let Some(lu) = to.user().map(|u| u.to_string()) else {
            warn!("session manager: route() called with a host-only jid, dropping");
            return;
        };
        let ls = to.server().to_string();

        match to.resource() {
            None => self.route_bare(from, to, lu, ls, packet).await,
            Some(lr) => self.route_full(from, to, lu, ls, lr.to_string(), packet).await,
        }
    }

    async fn route_bare(&self, from: Jid, to: Jid, lu: String, ls: String, packet: Element) {
        match stanza_kind(&packet) {
            Some(StanzaKind::Presence) => {
                self.broadcast_to_bare(&ls, &lu, &from, &to, &packet);
            }
            Some(StanzaKind::Message) => {
                self.route_message_bare(from, to, lu, ls, packet).await;
            }
            Some(StanzaKind::Iq) => {
                self.route_iq_bare(from, to, packet).await;
            }
            None => {
                warn!("session manager: non-stanza element routed, dropping");
            }
        }
    }

    async fn route_full(
        &self,
        from: Jid,
        to: Jid,
        lu: String,
        ls: String,
        lr: String,
        packet: Element,
    ) {
        let sids = self.sessions_for_user(&ls, &lu);
        let target = self
            .sessions
            .iter()
            .filter(|entry| sids.contains(entry.key()) && entry.value().resource == lr)
            .map(|entry| *entry.key())
            .max();

        match target {
            Some(sid) => self.deliver_to(sid, from, to, packet),
            None => match stanza_kind(&packet) {
                Some(StanzaKind::Message) => {
                    self.route_message_bare(from, to, lu, ls, packet).await;
                }
                Some(StanzaKind::Iq) => {
                    self.route_iq_bare(from, to, packet).await;
                }
                _ => {}
            },
        }
    }

    async fn route_message_bare(&self, from: Jid, to: Jid, lu: String, ls: String, packet: Element) {
        let sids = self.sessions_for_user(&ls, &lu);
        let priorities: Vec<(SessionId, i32)> = sids
            .iter()
            .filter_map(|sid| self.sessions.get(sid).map(|r| (*sid, r.priority)))
            .collect();

        let max_priority = priorities.iter().map(|(_, p)| *p).max();

        match max_priority {
            Some(max) if max >= 0 => {
                for (sid, _) in priorities.iter().filter(|(_, p)| *p == max) {
                    self.deliver_to(*sid, from.clone(), to.clone(), packet.clone());
                }
            }
            _ => self.bounce_or_offline_message(from, to, lu, ls, packet).await,
        }
    }

    async fn bounce_or_offline_message(
        &self,
        from: Jid,
        to: Jid,
        lu: String,
        ls: String,
        packet: Element,
    ) {
        match packet.attr("type") {
            Some("error") => {}
            Some("groupchat") | Some("headline") => {
                self.bounce(&packet, StanzaError::ServiceUnavailable).await;
            }
            _ => {
                if self.auth.does_user_exist(&lu, &ls).await {
                    if let Some(hook) = &self.offline_hook {
                        hook.offline_message(&from, &to, &packet).await;
                    } else {
                        self.bounce(&packet, StanzaError::ServiceUnavailable).await;
                    }
                } else {
                    self.bounce(&packet, StanzaError::ServiceUnavailable).await;
                }
            }
        }
    }

    async fn route_iq_bare(&self, _from: Jid, _to: Jid, packet: Element) {
        // A registered SM IQ handler table is out of scope (§4.7) — every
        // get/set addressed to the bare JID is answered service-unavailable;
        // replies (result/error) are silently dropped.
        match packet.attr("type") {
            Some("get") | Some("set") => {
                self.bounce(&packet, StanzaError::ServiceUnavailable).await;
            }
            _ => {}
        }
    }

    /// Build the error reply (`make_error_reply` already swaps from/to) and
    /// feed it straight back through `route` — the reply's `to` is the
    /// original sender, who is reached the same way any other locally
    /// addressed stanza would be.
    async fn bounce(&self, packet: &Element, error: StanzaError) {
        let reply = make_error_reply(packet, error, None);
        let Some(reply_to) = reply.attr("to").and_then(|s| Jid::parse(s).ok()) else {
            warn!("session manager: bounce has no resolvable recipient, dropping");
            return;
        };
        let reply_from = reply
            .attr("from")
            .and_then(|s| Jid::parse(s).ok())
            .unwrap_or_else(|| reply_to.clone());
        Box::pin(self.route(reply_from, reply_to, reply)).await;
    }

    /// `broadcast` (§4.7): re-send once per live resource.
    fn broadcast_to_bare(&self, server: &str, user: &str, from: &Jid, to: &Jid, packet: &Element) {
        for sid in self.sessions_for_user(server, user) {
            self.deliver_to(sid, from.clone(), to.clone(), packet.clone());
        }
    }

    fn deliver_to(&self, sid: SessionId, from: Jid, to: Jid, packet: Element) {
        if let Some(record) = self.sessions.get(&sid) {
            let routed = crate::router::RoutedPacket { from, to, packet };
            if record.mailbox.send(C2sInbound::Route(routed)).is_err() {
                warn!(sid = ?sid, "session manager: delivery mailbox full, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::tests::NullAuth;
    use crate::process::mailbox;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn sm() -> SessionManager {
        SessionManager::new(2, Arc::new(NullAuth))
    }

    #[tokio::test]
    async fn open_session_keeps_one_entry_per_usr_triple() {
        let sm = sm();
        let (mbox_a, _inbox_a) = mailbox::<C2sInbound>(10);
        let pid_a = mbox_a.pid();
        sm.open_session(
            SessionId::new(pid_a),
            "bob".into(),
            "localhost".into(),
            "mobile".into(),
            0,
            SessionInfo::default(),
            mbox_a,
        );

        let (mbox_b, mut inbox_b) = mailbox::<C2sInbound>(10);
        let pid_b = mbox_b.pid();
        sm.open_session(
            SessionId::new(pid_b),
            "bob".into(),
            "localhost".into(),
            "mobile".into(),
            0,
            SessionInfo::default(),
            mbox_b,
        );

        assert_eq!(sm.sessions_for_user("localhost", "bob").len(), 1);
        // Nothing arrives on B's mailbox: B has the larger session id and
        // survives; A is the one that gets replaced (not exercised here
        // directly since A's inbox isn't polled), matching §8 scenario 3.
        assert!(inbox_b.try_receive().is_none());
    }

    #[tokio::test]
    async fn max_session_eviction_keeps_table_at_the_cap() {
        let sm = SessionManager::new(1, Arc::new(NullAuth));
        let (mbox_a, _ia) = mailbox::<C2sInbound>(10);
        sm.open_session(
            SessionId::new(mbox_a.pid()),
            "bob".into(),
            "localhost".into(),
            "a".into(),
            0,
            SessionInfo::default(),
            mbox_a,
        );
        let (mbox_b, _ib) = mailbox::<C2sInbound>(10);
        sm.open_session(
            SessionId::new(mbox_b.pid()),
            "bob".into(),
            "localhost".into(),
            "b".into(),
            0,
            SessionInfo::default(),
            mbox_b,
        );
        assert_eq!(sm.sessions_for_user("localhost", "bob").len(), 1);
    }

    #[tokio::test]
    async fn priority_routing_delivers_only_to_max_priority_sessions() {
        let sm = sm_with_cap(4);
        let mut inboxes = vec![];
        for (resource, priority) in [("a", 2), ("b", 5), ("c", 5), ("d", -1)] {
            let (mbox, inbox) = mailbox::<C2sInbound>(10);
            sm.open_session(
                SessionId::new(mbox.pid()),
                "bob".into(),
                "localhost".into(),
                resource.into(),
                priority,
                SessionInfo::default(),
                mbox,
            );
            inboxes.push((resource, inbox));
        }

        let from = jid("alice@localhost");
        let to = jid("bob@localhost");
        let packet: Element = "<message xmlns='jabber:client' type='chat'/>".parse().unwrap();
        sm.route(from, to, packet).await;

        for (resource, inbox) in inboxes.iter_mut() {
            let got = inbox.try_receive();
            if *resource == "b" || *resource == "c" {
                assert!(got.is_some(), "expected delivery to priority-5 resource {resource}");
            } else {
                assert!(got.is_none(), "did not expect delivery to resource {resource}");
            }
        }
    }

    fn sm_with_cap(cap: usize) -> SessionManager {
        SessionManager::new(cap, Arc::new(NullAuth))
    }
}
