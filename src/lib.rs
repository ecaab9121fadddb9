//! Core XMPP client-to-server endpoint.
//!
//! A process-per-connection C2S implementation: each accepted socket becomes
//! one task running the state machine in [`c2s`], driven off two typed
//! mailboxes (raw socket events, and stanzas the [`router`]/
//! [`session_manager`] deliver back to it) rather than shared mutable state.
//! [`jid`] and [`stanza`] give the wire-level data model; [`sasl`] is the
//! pluggable PLAIN/DIGEST-MD5 negotiation engine; [`config`] and
//! [`collaborators`] are the seams an embedder fills in (served hostnames,
//! password/account lookups, offline-message storage).

pub mod c2s;
pub mod collaborators;
pub mod config;
pub mod jid;
pub mod local_handler;
pub mod message;
pub mod parser;
pub mod process;
pub mod router;
pub mod sasl;
pub mod session_manager;
pub mod socket;
pub mod stanza;

mod error;

pub use error::{ErrorType, StanzaError, StreamError, XmppError};
