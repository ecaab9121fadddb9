//! SASL negotiation engine (§4.5).
//!
//! A pluggable mechanism registry, styled after `auth/scram.rs`'s
//! struct-based stepping state machine (a state enum, `process_*` methods,
//! a parser for the wire grammar, a full-exchange test plus a negative
//! test) but implementing the two mechanisms the spec names — PLAIN and
//! DIGEST-MD5 — rather than SCRAM-SHA-256.

pub mod digest_md5;
pub mod plain;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::AuthBackend;
use crate::jid;

/// Outcome of feeding a mechanism one client input (§4.5).
pub enum SaslStep {
    /// Authentication succeeded.
    Done(SaslProps),
    /// Server sends `server_output` as a `challenge` frame and awaits the
    /// next client `response`.
    Continue(Vec<u8>),
    /// Abort with a named failure condition (no offending user to log).
    Error(&'static str),
    /// Abort with a named failure condition, naming the offending user for logs.
    ErrorUser(&'static str, String),
}

/// Properties produced by a successful SASL exchange (§4.5 `Done(props)`).
#[derive(Debug, Clone)]
pub struct SaslProps {
    pub username: String,
    pub authzid: Option<String>,
    pub auth_module: String,
}

/// A steppable SASL mechanism instance.
#[async_trait]
pub trait SaslMechanism: Send {
    /// Feed one client input (already base64-decoded) and advance the state machine.
    async fn step(&mut self, client_input: &[u8]) -> SaslStep;
}

/// Inputs available to every mechanism factory (§4.5: "server-fqdn,
/// password-provider, password-checker, digest-checker").
#[derive(Clone)]
pub struct SaslContext {
    pub server_fqdn: String,
    pub auth: Arc<dyn AuthBackend>,
}

type MechanismFactory = Box<dyn Fn(SaslContext) -> Box<dyn SaslMechanism> + Send + Sync>;

/// Mechanism registry: name -> factory. Populated at startup, read-only
/// thereafter (§5 "Shared resources").
pub struct SaslRegistry {
    factories: HashMap<&'static str, MechanismFactory>,
}

impl SaslRegistry {
    pub fn new() -> Self {
        SaslRegistry {
            factories: HashMap::new(),
        }
    }

    /// The server's default registry: PLAIN and DIGEST-MD5.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("PLAIN", |ctx| Box::new(plain::PlainMechanism::new(ctx)));
        reg.register("DIGEST-MD5", |ctx| {
            Box::new(digest_md5::DigestMd5Mechanism::new(ctx))
        });
        reg
    }

    pub fn register(
        &mut self,
        name: &'static str,
        factory: impl Fn(SaslContext) -> Box<dyn SaslMechanism> + Send + Sync + 'static,
    ) {
        self.factories.insert(name, Box::new(factory));
    }

    /// The mechanism names advertised in `<stream:features>` (§4.8 WaitForStream).
    pub fn mechanism_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// `SASL.server_start` (§4.8 WaitForFeatureRequest): instantiate the
    /// named mechanism, or `None` if it is not registered.
    pub fn start(&self, name: &str, ctx: SaslContext) -> Option<Box<dyn SaslMechanism>> {
        self.factories.get(name).map(|factory| factory(ctx))
    }
}

impl Default for SaslRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Post-validate a `Done` result (§4.5): `username` must nodeprep to a
/// non-empty value, else the result is rewritten to `Error(not-authorized)`.
pub(crate) fn validate_done(props: SaslProps) -> SaslStep {
    match jid::nodeprep(&props.username) {
        Ok(ref canon) if !canon.is_empty() => SaslStep::Done(props),
        _ => SaslStep::Error("not-authorized"),
    }
}
