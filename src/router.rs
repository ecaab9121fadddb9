//! Router (§4.6): domain -> handler table.
//!
//! Generalized from the teacher's `StanzaRouter` in `routing.rs`, which
//! always dispatches uniformly to its connection registry or S2S pool. This
//! module adds the two things the spec requires that the teacher's router
//! does not distinguish: a synchronous in-process shortcut fast path
//! alongside the mailbox path, and single-writer/concurrent-reader
//! discipline on the route table itself (§5).

use std::sync::Arc;

use dashmap::DashMap;
use minidom::Element;
use tracing::{instrument, warn};

use crate::jid::Jid;
use crate::process::Mailbox;

/// A routed packet: `route(from, to, packet)` (§4.6).
#[derive(Debug, Clone)]
pub struct RoutedPacket {
    pub from: Jid,
    pub to: Jid,
    pub packet: Element,
}

/// A synchronous shortcut, invoked in-process instead of a mailbox hop.
pub trait RouteShortcut: Send + Sync {
    fn handle(&self, packet: RoutedPacket);
}

/// A route table entry: a mailbox, optionally paired with a shortcut.
#[derive(Clone)]
struct Route {
    mailbox: Mailbox<RoutedPacket>,
    shortcut: Option<Arc<dyn RouteShortcut>>,
}

/// Invoked on a domain-table miss (§9 Open Questions: s2s routing is a stub
/// interface only — no dialback/connection logic is implemented here).
#[async_trait::async_trait]
pub trait S2sFallback: Send + Sync {
    async fn handle(&self, packet: RoutedPacket);
}

/// Domain routing table (§4.6). Readers are concurrent; writers register
/// only for the domain they own (§5 "single-writer discipline").
pub struct Router {
    routes: DashMap<String, Route>,
    s2s_fallback: Option<Arc<dyn S2sFallback>>,
}

impl Router {
    pub fn new() -> Self {
        Router {
            routes: DashMap::new(),
            s2s_fallback: None,
        }
    }

    pub fn with_s2s_fallback(mut self, fallback: Arc<dyn S2sFallback>) -> Self {
        self.s2s_fallback = Some(fallback);
        self
    }

    /// `register_route(domain, pid, ?shortcut)`.
    pub fn register_route(
        &self,
        domain: String,
        mailbox: Mailbox<RoutedPacket>,
        shortcut: Option<Arc<dyn RouteShortcut>>,
    ) {
        self.routes.insert(domain, Route { mailbox, shortcut });
    }

    /// `unregister_route(domain, pid)`; no-op if absent or if a different
    /// process now owns the domain.
    pub fn unregister_route(&self, domain: &str, pid: crate::process::Pid) {
        self.routes.remove_if(domain, |_, route| route.mailbox.pid() == pid);
    }

    /// `route(from, to, packet)` (§4.6). Any exception raised by a handler
    /// is logged and swallowed — a routing failure must never tear down the
    /// router.
    #[instrument(skip(self, packet), fields(to = %to))]
    pub async fn route(&self, from: Jid, to: Jid, packet: Element) {
        let domain = to.server().to_string();
        let routed = RoutedPacket { from, to, packet };

        let route = self.routes.get(&domain).map(|r| r.clone());
        match route {
            Some(route) => {
                if let Some(shortcut) = &route.shortcut {
                    shortcut.handle(routed);
                } else if let Err(err) = route.mailbox.send(routed) {
                    warn!(%domain, error = %err, "router: handler mailbox rejected packet, dropping");
                }
            }
            None => {
                if let Some(fallback) = &self.s2s_fallback {
                    fallback.handle(routed).await;
                } else {
                    warn!(%domain, "router: no route and no s2s fallback configured, dropping");
                }
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mailbox;

    fn test_packet(to_domain: &str) -> (Jid, Jid, Element) {
        let from = Jid::parse("alice@example.com").unwrap();
        let to = Jid::parse(&format!("bob@{to_domain}")).unwrap();
        let el: Element = "<message xmlns='jabber:client'/>".parse().unwrap();
        (from, to, el)
    }

    #[tokio::test]
    async fn delivers_to_registered_mailbox() {
        let router = Router::new();
        let (mbox, mut inbox) = mailbox::<RoutedPacket>(10);
        router.register_route("example.com".to_string(), mbox, None);

        let (from, to, el) = test_packet("example.com");
        router.route(from, to, el).await;

        let delivered = inbox.receive().await.unwrap();
        assert_eq!(delivered.to.server(), "example.com");
    }

    #[tokio::test]
    async fn miss_without_fallback_is_swallowed() {
        let router = Router::new();
        let (from, to, el) = test_packet("nowhere.example");
        router.route(from, to, el).await; // must not panic
    }

    struct RecordingShortcut {
        tx: tokio::sync::mpsc::UnboundedSender<RoutedPacket>,
    }
    impl RouteShortcut for RecordingShortcut {
        fn handle(&self, packet: RoutedPacket) {
            self.tx.send(packet).ok();
        }
    }

    #[tokio::test]
    async fn shortcut_is_invoked_synchronously_instead_of_mailbox() {
        let router = Router::new();
        let (mbox, _inbox) = mailbox::<RoutedPacket>(10);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        router.register_route(
            "example.com".to_string(),
            mbox,
            Some(Arc::new(RecordingShortcut { tx })),
        );

        let (from, to, el) = test_packet("example.com");
        router.route(from, to, el).await;

        assert!(rx.recv().await.is_some());
    }
}
