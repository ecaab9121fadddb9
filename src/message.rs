//! Process message variants (§9 "Polymorphic message variants").
//!
//! Each process's mailbox carries one tagged union of inputs. Per the design
//! note, this is a single `match` per message rather than dynamic dispatch
//! through a table of callbacks.

use crate::router::RoutedPacket;

/// Everything a C2S process may receive from outside its own socket and XML
/// reader (§4.6 Router, §4.7 Session Manager).
#[derive(Debug)]
pub enum C2sInbound {
    /// Session Manager eviction hint (§4.7 duplicate-resource / max-session
    /// eviction, §7 "Authorization / policy"). The receiving C2S process is
    /// expected to terminate.
    Replaced,
    /// A stanza routed to this session by the Router or Session Manager.
    Route(RoutedPacket),
}
