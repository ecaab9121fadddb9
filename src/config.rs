//! Configuration surface (§1c, §6 "CLI/env").
//!
//! The core does not parse a config file itself (out of scope, §1) — the
//! embedder builds an [`XmppdConfig`] from whatever source it likes (env
//! vars, a file, hard-coded values in a test) and hands it in. Modeled on
//! the teacher's `XmppServerConfig`/`Default` pair in `server.rs`, narrowed
//! to the knobs the spec actually names.

use std::net::SocketAddr;

use crate::error::XmppError;
use crate::process::DEFAULT_MAILBOX_CAPACITY;

/// Runtime configuration for the C2S endpoint.
#[derive(Debug, Clone)]
pub struct XmppdConfig {
    /// TCP listen address (§6: default port 5222).
    pub listen_addr: SocketAddr,
    /// Hostnames this endpoint serves, already nameprep-canonicalised.
    served_hosts: Vec<String>,
    /// Per-(user,server) session cap used by §4.7's max-session eviction.
    pub max_user_sessions: usize,
    /// Mailbox capacity override (§4.1 default 10 000).
    pub mailbox_capacity: usize,
}

impl XmppdConfig {
    /// Construct a config, nameprep-canonicalising and validating every
    /// served hostname up front — a bad hostname fails fast here rather
    /// than surfacing later as a mysterious "host-unknown" for a name the
    /// operator thought they had configured.
    pub fn new(
        listen_addr: SocketAddr,
        served_hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, XmppError> {
        let served_hosts = served_hosts
            .into_iter()
            .map(|h| {
                let raw = h.into();
                stringprep::nameprep(&raw)
                    .map(|c| c.into_owned())
                    .map_err(|_| XmppError::config(format!("invalid served hostname: {raw}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if served_hosts.is_empty() {
            return Err(XmppError::config("at least one served hostname is required"));
        }
        Ok(XmppdConfig {
            listen_addr,
            served_hosts,
            max_user_sessions: 5,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        })
    }

    /// True when `host` (already nameprep-canonicalised) is served locally.
    pub fn serves_host(&self, host: &str) -> bool {
        self.served_hosts.iter().any(|h| h == host)
    }

    pub fn served_hosts(&self) -> &[String] {
        &self.served_hosts
    }

    /// The primary served hostname, used as the `from` attribute on stream headers.
    pub fn primary_host(&self) -> &str {
        &self.served_hosts[0]
    }
}

impl Default for XmppdConfig {
    fn default() -> Self {
        XmppdConfig::new("0.0.0.0:5222".parse().unwrap(), ["localhost"]).expect(
            "default config is always well-formed: \"localhost\" is a valid nameprep input",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalises_and_accepts_served_hosts() {
        let cfg = XmppdConfig::new("127.0.0.1:5222".parse().unwrap(), ["Example.com"]).unwrap();
        assert!(cfg.serves_host("example.com"));
    }

    #[test]
    fn rejects_empty_host_list() {
        let hosts: Vec<String> = vec![];
        assert!(XmppdConfig::new("127.0.0.1:5222".parse().unwrap(), hosts).is_err());
    }
}
