//! SASL PLAIN (§4.5).

use async_trait::async_trait;

use super::{validate_done, SaslContext, SaslMechanism, SaslProps, SaslStep};

/// PLAIN is a single round trip: one client input, then done.
pub struct PlainMechanism {
    ctx: SaslContext,
    done: bool,
}

impl PlainMechanism {
    pub fn new(ctx: SaslContext) -> Self {
        PlainMechanism { ctx, done: false }
    }
}

#[async_trait]
impl SaslMechanism for PlainMechanism {
    async fn step(&mut self, client_input: &[u8]) -> SaslStep {
        if self.done {
            return SaslStep::Error("bad-protocol");
        }
        self.done = true;

        let (authzid, user, pass) = match parse_plain(client_input) {
            Some(parts) => parts,
            None => return SaslStep::Error("bad-protocol"),
        };

        let user = match crate::jid::nodeprep(&user) {
            Ok(u) if !u.is_empty() => u,
            _ => return SaslStep::ErrorUser("not-authorized", user),
        };

        match self
            .ctx
            .auth
            .check_password_with_authmodule(&user, &self.ctx.server_fqdn, &pass)
            .await
        {
            Some(auth_module) => validate_done(SaslProps {
                username: user,
                authzid,
                auth_module,
            }),
            None => SaslStep::ErrorUser("not-authorized", user),
        }
    }
}

/// Parse `authzid\0user\0pass` or `\0user[@domain]\0pass` (§4.5).
/// The domain suffix, if present, is discarded here — authentication is
/// scoped by `server_fqdn` from the context, not by a domain embedded in
/// the authcid.
fn parse_plain(input: &[u8]) -> Option<(Option<String>, String, String)> {
    let s = std::str::from_utf8(input).ok()?;
    let mut parts = s.splitn(3, '\0');
    let authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    if authcid.is_empty() || password.is_empty() {
        return None;
    }
    let user = authcid.split('@').next().unwrap_or(authcid).to_string();
    let authzid = if authzid.is_empty() {
        None
    } else {
        Some(authzid.to_string())
    };
    Some((authzid, user, password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::AuthBackend;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedAuth;

    #[async_trait]
    impl AuthBackend for FixedAuth {
        async fn check_password_with_authmodule(
            &self,
            user: &str,
            _server: &str,
            pass: &str,
        ) -> Option<String> {
            (user == "test" && pass == "secret").then(|| "none".to_string())
        }

        async fn check_password_digest_with_authmodule(
            &self,
            _user: &str,
            _server: &str,
            _response: &str,
            _digest_gen: &(dyn Fn(&str) -> String + Send + Sync),
        ) -> Option<String> {
            None
        }

        async fn get_password_with_authmodule(
            &self,
            _user: &str,
            _server: &str,
        ) -> Option<(String, String)> {
            None
        }

        async fn does_user_exist(&self, _user: &str, _server: &str) -> bool {
            false
        }
    }

    fn ctx() -> SaslContext {
        SaslContext {
            server_fqdn: "localhost".into(),
            auth: Arc::new(FixedAuth),
        }
    }

    #[tokio::test]
    async fn accepts_valid_credentials() {
        let mut mech = PlainMechanism::new(ctx());
        let step = mech.step(b"\0test\0secret").await;
        match step {
            SaslStep::Done(props) => assert_eq!(props.username, "test"),
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let mut mech = PlainMechanism::new(ctx());
        let step = mech.step(b"\0test\0wrong").await;
        assert!(matches!(step, SaslStep::ErrorUser("not-authorized", _)));
    }

    #[tokio::test]
    async fn rejects_malformed_payload() {
        let mut mech = PlainMechanism::new(ctx());
        let step = mech.step(b"no-nulls-here").await;
        assert!(matches!(step, SaslStep::Error("bad-protocol")));
    }

    #[tokio::test]
    async fn second_step_is_bad_protocol() {
        let mut mech = PlainMechanism::new(ctx());
        let _ = mech.step(b"\0test\0secret").await;
        let step = mech.step(b"\0test\0secret").await;
        assert!(matches!(step, SaslStep::Error("bad-protocol")));
    }
}
