//! External collaborator contracts (§6).
//!
//! Narrowed from the teacher's single do-everything `AppState` trait in
//! `lib.rs` (which also covers MUC rooms, MAM storage, upload slots — none
//! of which this spec calls for) down to exactly the two contracts §6 names:
//! an authentication backend and an offline-message hook. The password
//! store, digest verification, and offline persistence themselves are out
//! of scope (§1) — only the shape of the call is specified here.

use async_trait::async_trait;
use minidom::Element;

use crate::jid::Jid;

/// The authentication backend collaborator (§6).
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// `Auth.check_password_with_authmodule(user, server, pass) -> Option<module>`.
    async fn check_password_with_authmodule(
        &self,
        user: &str,
        server: &str,
        pass: &str,
    ) -> Option<String>;

    /// `Auth.check_password_digest_with_authmodule(user, server, response, digest, digest_gen) -> Option<module>`
    /// where `digest_gen(pwd)` produces the expected digest. Modeled as a
    /// closure parameter so the caller supplies the exact digest function
    /// for its authentication path (e.g. `SHA1(streamid ++ password)` for
    /// the legacy `jabber:iq:auth` path in §4.8's `WaitForAuth`).
    async fn check_password_digest_with_authmodule(
        &self,
        user: &str,
        server: &str,
        response: &str,
        digest_gen: &(dyn Fn(&str) -> String + Send + Sync),
    ) -> Option<String>;

    /// `Auth.get_password_with_authmodule(user, server) -> Option<(password, module)>`.
    async fn get_password_with_authmodule(&self, user: &str, server: &str) -> Option<(String, String)>;

    /// `Auth.does_user_exist(user, server) -> bool`.
    async fn does_user_exist(&self, user: &str, server: &str) -> bool;
}

/// The offline-message hook collaborator (§6). Absent (`None` at the call
/// site in the Session Manager) means "bounce with service-unavailable"
/// per §4.7/§7.
#[async_trait]
pub trait OfflineMessageHook: Send + Sync {
    /// `offline_message(from, to, packet)`.
    async fn offline_message(&self, from: &Jid, to: &Jid, packet: &Element);
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// An `AuthBackend` that accepts nothing — used by other modules' unit
    /// tests that only need *some* `Arc<dyn AuthBackend>` to satisfy a
    /// context constructor, not a meaningful authentication outcome.
    pub struct NullAuth;

    #[async_trait]
    impl AuthBackend for NullAuth {
        async fn check_password_with_authmodule(
            &self,
            _user: &str,
            _server: &str,
            _pass: &str,
        ) -> Option<String> {
            None
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
}
