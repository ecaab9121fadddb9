//! Local handler (§4.9): the route registered for each served host.
//!
//! Generalizes `routing.rs`'s "local, not MUC" branch — which always
//! forwards to the `ConnectionRegistry` regardless of whether the
//! destination names a user or the bare server hostname — into the split
//! the spec requires: an IQ-handler table keyed by XML namespace for
//! stanzas addressed straight to the host, bare-host drop rules for
//! presence/message, and a fallthrough into the Session Manager for
//! anything that does name a user.

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;

use crate::error::StanzaError;
use crate::jid::Jid;
use crate::router::{RouteShortcut, RoutedPacket};
use crate::session_manager::SessionManager;
use crate::stanza::{iq_query_info, make_error_reply, stanza_kind, IqClassification, StanzaKind};

/// A handler registered for one XML namespace on the host's IQ table
/// (§4.9 "dispatch to the IQ-handler table keyed by (xmlns, host)"). Given
/// the sender and the full `<iq/>`, it returns the complete reply element
/// (result or error, from/to already swapped, `id` preserved).
#[async_trait]
pub trait HostIqHandler: Send + Sync {
    async fn handle(&self, from: &Jid, iq: &Element, payload: &Element) -> Element;
}

pub struct LocalHandler {
    iq_handlers: dashmap::DashMap<String, Arc<dyn HostIqHandler>>,
    session_manager: Arc<SessionManager>,
}

impl LocalHandler {
    pub fn new(session_manager: Arc<SessionManager>) -> Self {
        LocalHandler {
            iq_handlers: dashmap::DashMap::new(),
            session_manager,
        }
    }

    /// Register a handler for IQ payloads in `xmlns` addressed to this host.
    pub fn register_iq_handler(&self, xmlns: String, handler: Arc<dyn HostIqHandler>) {
        self.iq_handlers.insert(xmlns, handler);
    }

    /// `route(from, to, packet)` dispatch table (§4.9).
    pub async fn route(&self, from: Jid, to: Jid, packet: Element) {
        if to.user().is_some() {
            self.session_manager.route(from, to, packet).await;
            return;
        }

        if to.resource().is_some() {
            // Addressed to host/resource: only error/result replies are
            // even well-formed here, and nothing on this host is waiting
            // for one — every shape is dropped.
            return;
        }

        match stanza_kind(&packet) {
            Some(StanzaKind::Iq) => self.dispatch_host_iq(from, to, packet).await,
            _ => {
                // presence/message to the bare host: no interested party.
            }
        }
    }

    async fn dispatch_host_iq(&self, from: Jid, to: Jid, packet: Element) {
        let (xmlns, payload) = match iq_query_info(&packet) {
            IqClassification::ValidRequest { payload, .. } => {
                let xmlns = payload
                    .attr("xmlns")
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| payload.ns().to_string());
                (xmlns, payload.clone())
            }
            // Malformed get/set, or a result/error reply nobody registered
            // to receive: drop.
            _ => return,
        };

        // Clone the handler out and drop the map guard before awaiting it —
        // holding a `DashMap` shard lock across a suspension point is asking
        // for trouble the moment a handler itself touches this table.
        let handler = self.iq_handlers.get(&xmlns).map(|h| Arc::clone(h.value()));
        let reply = match handler {
            Some(handler) => handler.handle(&from, &packet, &payload).await,
            None => make_error_reply(&packet, StanzaError::ServiceUnavailable, None),
        };

        self.session_manager.route(to, from, reply).await;
    }
}

impl RouteShortcut for Arc<LocalHandler> {
    fn handle(&self, packet: RoutedPacket) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.route(packet.from, packet.to, packet.packet).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::tests::NullAuth;
    use crate::message::C2sInbound;
    use crate::process::mailbox;
    use crate::session_manager::{SessionId, SessionInfo};

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    struct EchoVersion;

    #[async_trait]
    impl HostIqHandler for EchoVersion {
        async fn handle(&self, _from: &Jid, iq: &Element, _payload: &Element) -> Element {
            crate::stanza::make_result_iq_reply(iq)
        }
    }

    fn handler_with_session() -> (Arc<LocalHandler>, crate::process::Inbox<C2sInbound>) {
        let sm = Arc::new(SessionManager::new(10, Arc::new(NullAuth)));
        let (mbox, inbox) = mailbox::<C2sInbound>(10);
        sm.open_session(
            SessionId::new(mbox.pid()),
            "alice".into(),
            "localhost".into(),
            "home".into(),
            0,
            SessionInfo::default(),
            mbox,
        );
        let handler = Arc::new(LocalHandler::new(sm));
        (handler, inbox)
    }

    #[tokio::test]
    async fn registered_namespace_replies_and_routes_to_the_requester() {
        let (handler, mut inbox) = handler_with_session();
        handler.register_iq_handler("jabber:iq:version".into(), Arc::new(EchoVersion));

        let from = jid("alice@localhost/home");
        let to = jid("localhost");
        let packet: Element =
            "<iq xmlns='jabber:client' id='1' type='get' from='alice@localhost/home' to='localhost'><query xmlns='jabber:iq:version'/></iq>"
                .parse()
                .unwrap();
        handler.route(from, to, packet).await;

        match inbox.receive().await.unwrap() {
            C2sInbound::Route(routed) => assert_eq!(routed.packet.attr("type"), Some("result")),
            other => panic!("expected a routed reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_namespace_bounces_service_unavailable() {
        let (handler, mut inbox) = handler_with_session();

        let from = jid("alice@localhost/home");
        let to = jid("localhost");
        let packet: Element =
            "<iq xmlns='jabber:client' id='2' type='get' from='alice@localhost/home' to='localhost'><query xmlns='urn:unknown'/></iq>"
                .parse()
                .unwrap();
        handler.route(from, to, packet).await;

        match inbox.receive().await.unwrap() {
            C2sInbound::Route(routed) => {
                assert_eq!(routed.packet.attr("type"), Some("error"));
                assert!(routed.packet.children().any(|c| c.name() == "error"));
            }
            other => panic!("expected a routed bounce, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_to_bare_host_is_dropped() {
        let (handler, mut inbox) = handler_with_session();
        let from = jid("alice@localhost/home");
        let to = jid("localhost");
        let packet: Element = "<presence xmlns='jabber:client'/>".parse().unwrap();
        handler.route(from, to, packet).await;
        assert!(inbox.try_receive().is_none());
    }

    #[tokio::test]
    async fn user_addressed_stanza_falls_through_to_session_manager() {
        let (handler, mut inbox) = handler_with_session();
        let from = jid("bob@localhost/phone");
        let to = jid("alice@localhost/home");
        let packet: Element = "<message xmlns='jabber:client' type='chat'/>".parse().unwrap();
        handler.route(from, to, packet).await;

        match inbox.receive().await.unwrap() {
            C2sInbound::Route(routed) => assert_eq!(routed.to.resource(), Some("home")),
            other => panic!("expected a routed message, got {other:?}"),
        }
    }
}
