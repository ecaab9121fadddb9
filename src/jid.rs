//! JID data model (§3).
//!
//! A [`Jid`] keeps both the raw string each field arrived as on the wire and
//! its stringprep-canonicalised form (nodeprep/nameprep/resourceprep). The
//! external `jid` crate already performs that canonicalisation internally
//! when constructing a [`jid::BareJid`]/[`jid::FullJid`] — we drive it from
//! the canonical strings we compute ourselves so we can additionally retain
//! the raw strings the spec requires, and so that JID equality/ordering
//! follows this crate's own triple rather than whatever the underlying
//! library's `Ord` impl happens to do.

use std::cmp::Ordering;
use std::fmt;

/// JID parse failure (§3 parsing rules).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidParseError {
    #[error("jid starts with '@' or '/'")]
    LeadingSeparator,
    #[error("'@' appears with an empty local part, or appears twice")]
    BadAt,
    #[error("'/' immediately follows '@' with nothing between")]
    EmptyServer,
    #[error("stringprep failed on the {0} part: {1}")]
    Stringprep(&'static str, String),
    #[error("invalid jid: {0}")]
    Underlying(String),
}

/// A parsed JID: `[user@]server[/resource]`, raw and canonical forms of each part.
#[derive(Debug, Clone)]
pub struct Jid {
    raw_user: Option<String>,
    raw_server: String,
    raw_resource: Option<String>,
    canon_user: Option<String>,
    canon_server: String,
    canon_resource: Option<String>,
}

impl Jid {
    /// Parse a wire-form JID string, applying the exact failure rules of §3
    /// and canonicalising each present part.
    pub fn parse(raw: &str) -> Result<Self, JidParseError> {
        if raw.starts_with('@') || raw.starts_with('/') {
            return Err(JidParseError::LeadingSeparator);
        }

        let (raw_user, rest) = match raw.find('@') {
            Some(at) => {
                let user = &raw[..at];
                if user.is_empty() {
                    return Err(JidParseError::BadAt);
                }
                let rest = &raw[at + 1..];
                if rest.find('@').is_some() {
                    return Err(JidParseError::BadAt);
                }
                if rest.starts_with('/') {
                    return Err(JidParseError::EmptyServer);
                }
                (Some(user.to_string()), rest)
            }
            None => (None, raw),
        };

        let (raw_server, raw_resource) = match rest.find('/') {
            Some(slash) => {
                let server = &rest[..slash];
                let resource = &rest[slash + 1..];
                (server.to_string(), Some(resource.to_string()))
            }
            None => (rest.to_string(), None),
        };

        let canon_user = raw_user
            .as_deref()
            .map(nodeprep)
            .transpose()?;
        let canon_server = nameprep(&raw_server)?;
        let canon_resource = raw_resource
            .as_deref()
            .map(resourceprep)
            .transpose()?;

        Ok(Jid {
            raw_user,
            raw_server,
            raw_resource,
            canon_user,
            canon_server,
            canon_resource,
        })
    }

    /// Build a JID directly from already-canonical parts (no stringprep
    /// re-applied); used by components that mint JIDs internally (bind,
    /// session seeding) rather than parsing client input.
    pub fn from_canonical_parts(
        user: Option<String>,
        server: String,
        resource: Option<String>,
    ) -> Self {
        Jid {
            raw_user: user.clone(),
            raw_server: server.clone(),
            raw_resource: resource.clone(),
            canon_user: user,
            canon_server: server,
            canon_resource: resource,
        }
    }

    pub fn raw_user(&self) -> Option<&str> {
        self.raw_user.as_deref()
    }

    pub fn raw_server(&self) -> &str {
        &self.raw_server
    }

    pub fn raw_resource(&self) -> Option<&str> {
        self.raw_resource.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.canon_user.as_deref()
    }

    pub fn server(&self) -> &str {
        &self.canon_server
    }

    pub fn resource(&self) -> Option<&str> {
        self.canon_resource.as_deref()
    }

    /// True when the resource is absent (§3 "bare JID").
    pub fn is_bare(&self) -> bool {
        self.canon_resource.is_none()
    }

    /// The bare (resource-stripped) form of this JID.
    pub fn to_bare(&self) -> Jid {
        Jid {
            raw_user: self.raw_user.clone(),
            raw_server: self.raw_server.clone(),
            raw_resource: None,
            canon_user: self.canon_user.clone(),
            canon_server: self.canon_server.clone(),
            canon_resource: None,
        }
    }

    /// Build a full JID by attaching a resource to this JID's bare part.
    pub fn with_resource(&self, raw_resource: &str) -> Result<Jid, JidParseError> {
        let canon_resource = resourceprep(raw_resource)?;
        Ok(Jid {
            raw_user: self.raw_user.clone(),
            raw_server: self.raw_server.clone(),
            raw_resource: Some(raw_resource.to_string()),
            canon_user: self.canon_user.clone(),
            canon_server: self.canon_server.clone(),
            canon_resource: Some(canon_resource),
        })
    }

    /// The canonical `(user, server, resource)` triple, used as the Session
    /// Manager's index key (§4.7).
    pub fn canonical_triple(&self) -> (Option<&str>, &str, Option<&str>) {
        (self.user(), self.server(), self.resource())
    }
}

impl fmt::Display for Jid {
    /// Renders the *raw* form, matching what the client sent (round-trip
    /// property in §8: `jid_to_string(string_to_jid_exn(s)) == s` whenever
    /// stringprep left every part unchanged).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.raw_user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.raw_server)?;
        if let Some(resource) = &self.raw_resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_triple() == other.canonical_triple()
    }
}
impl Eq for Jid {}

impl PartialOrd for Jid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Jid {
    /// Lexicographic on the canonicalised `(user, server, resource)` triple (§3).
    fn cmp(&self, other: &Self) -> Ordering {
        self.canon_user
            .cmp(&other.canon_user)
            .then_with(|| self.canon_server.cmp(&other.canon_server))
            .then_with(|| self.canon_resource.cmp(&other.canon_resource))
    }
}

/// Apply the nodeprep stringprep profile directly (used by the SASL engine
/// to post-validate a `username`, §4.5, independent of full JID parsing).
pub fn nodeprep(s: &str) -> Result<String, JidParseError> {
    stringprep::nodeprep(s)
        .map(|c| c.into_owned())
        .map_err(|e| JidParseError::Stringprep("user", format!("{:?}", e)))
}

fn nameprep(s: &str) -> Result<String, JidParseError> {
    stringprep::nameprep(s)
        .map(|c| c.into_owned())
        .map_err(|e| JidParseError::Stringprep("server", format!("{:?}", e)))
}

fn resourceprep(s: &str) -> Result<String, JidParseError> {
    stringprep::resourceprep(s)
        .map(|c| c.into_owned())
        .map_err(|e| JidParseError::Stringprep("resource", format!("{:?}", e)))
}
