//! Binary entry point: load configuration, wire the shared collaborators,
//! and accept connections onto the C2S state machine (§4.8).

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use xmppd_core::c2s::{self, C2sDeps};
use xmppd_core::collaborators::AuthBackend;
use xmppd_core::config::XmppdConfig;
use xmppd_core::local_handler::LocalHandler;
use xmppd_core::process::mailbox;
use xmppd_core::router::{Router, RoutedPacket};
use xmppd_core::session_manager::SessionManager;

/// An `AuthBackend` that never succeeds. Placeholder until an embedder
/// wires a real password/account store through `C2sDeps`.
struct DenyAllAuth;

#[async_trait::async_trait]
impl AuthBackend for DenyAllAuth {
    async fn check_password_with_authmodule(&self, _user: &str, _server: &str, _pass: &str) -> Option<String> {
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

    async fn get_password_with_authmodule(&self, _user: &str, _server: &str) -> Option<(String, String)> {
        None
    }

    async fn does_user_exist(&self, _user: &str, _server: &str) -> bool {
        false
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(XmppdConfig::default());
    let auth: Arc<dyn AuthBackend> = Arc::new(DenyAllAuth);
    let router = Arc::new(Router::new());
    let session_manager = Arc::new(SessionManager::new(config.max_user_sessions, auth.clone()));

    let local_handler = Arc::new(LocalHandler::new(session_manager.clone()));
    for host in config.served_hosts() {
        // The shortcut below handles every route synchronously; the mailbox
        // side of this pair is never read from.
        let (unused_mailbox, _unused_inbox) = mailbox::<RoutedPacket>(1);
        let shortcut: Arc<dyn xmppd_core::router::RouteShortcut> = Arc::new(local_handler.clone());
        router.register_route(host.clone(), unused_mailbox, Some(shortcut));
    }

    let deps = C2sDeps::new(config.clone(), auth, router, session_manager);

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "xmppd: listening for c2s connections");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "xmppd: accepted connection");
        let deps = deps.clone();
        tokio::spawn(async move {
            c2s::run(stream, deps).await;
        });
    }
}
