//! Collaborator hooks the session loop calls out to, left unopinionated by
//! design (§9 Open Questions: "Privacy lists" and "Hooks"). Neither has a
//! prescribed body; the defaults below are the permissive no-ops a reader
//! would expect from an endpoint that does not implement either feature.

use async_trait::async_trait;
use minidom::Element;

use crate::jid::Jid;

/// Outbound/inbound privacy check consulted before routing a stanza out of
/// `SessionEstablished` (§4.8). Absent any list, everything is allowed.
pub trait PrivacyCheck: Send + Sync {
    fn allows(&self, from: &Jid, to: &Jid, stanza: &Element) -> bool;
}

/// The default: no privacy lists configured, nothing is blocked.
pub struct AllowAll;

impl PrivacyCheck for AllowAll {
    fn allows(&self, _from: &Jid, _to: &Jid, _stanza: &Element) -> bool {
        true
    }
}

/// Roster-subscription side effect (§4.8 presence_track: subscribe/
/// subscribed/unsubscribe/unsubscribed). Roster storage itself is out of
/// scope (§1); this is the seam an embedder with a roster store hangs off.
#[async_trait]
pub trait RosterHook: Send + Sync {
    async fn on_subscription_event(&self, from: &Jid, to: &Jid, kind: &str);
}

pub struct NoopRosterHook;

#[async_trait]
impl RosterHook for NoopRosterHook {
    async fn on_subscription_event(&self, _from: &Jid, _to: &Jid, _kind: &str) {}
}
