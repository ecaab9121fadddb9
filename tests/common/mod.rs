//! Shared harness for the end-to-end tests: a real TCP listener running the
//! C2S state machine, plus a minimal raw client that speaks the wire
//! protocol directly (no XMPP library on the test side, deliberately, so the
//! assertions are about bytes actually sent, not some other parser's
//! interpretation of them).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use xmppd_core::c2s::{self, C2sDeps};
use xmppd_core::collaborators::AuthBackend;
use xmppd_core::config::XmppdConfig;
use xmppd_core::local_handler::LocalHandler;
use xmppd_core::process::mailbox;
use xmppd_core::router::{Router, RoutedPacket};
use xmppd_core::session_manager::SessionManager;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// An `AuthBackend` backed by a fixed in-memory `user -> password` table,
/// accepting plain passwords and legacy SHA1-digest auth alike.
pub struct FixedAuth {
    passwords: Mutex<HashMap<String, String>>,
}

impl FixedAuth {
    pub fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        let mut map = HashMap::new();
        for (user, pass) in entries {
            map.insert(user.to_string(), pass.to_string());
        }
        Arc::new(FixedAuth {
            passwords: Mutex::new(map),
        })
    }
}

#[async_trait::async_trait]
impl AuthBackend for FixedAuth {
    async fn check_password_with_authmodule(&self, user: &str, _server: &str, pass: &str) -> Option<String> {
        let guard = self.passwords.lock().unwrap();
        (guard.get(user).map(|p| p.as_str()) == Some(pass)).then(|| "plain".to_string())
    }

    async fn check_password_digest_with_authmodule(
        &self,
        user: &str,
        _server: &str,
        response: &str,
        digest_gen: &(dyn Fn(&str) -> String + Send + Sync),
    ) -> Option<String> {
        let guard = self.passwords.lock().unwrap();
        let pass = guard.get(user)?;
        (digest_gen(pass) == response).then(|| "digest".to_string())
    }

    async fn get_password_with_authmodule(&self, user: &str, _server: &str) -> Option<(String, String)> {
        let guard = self.passwords.lock().unwrap();
        guard.get(user).map(|p| (p.clone(), "plain".to_string()))
    }

    async fn does_user_exist(&self, user: &str, _server: &str) -> bool {
        self.passwords.lock().unwrap().contains_key(user)
    }
}

/// A running test instance of the C2S endpoint, wired the same way
/// `main.rs` wires production, minus TLS.
pub struct TestServer {
    pub addr: SocketAddr,
    pub domain: String,
}

impl TestServer {
    pub async fn start(domain: &str, auth: Arc<dyn AuthBackend>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
        let addr = listener.local_addr().unwrap();

        let config = Arc::new(XmppdConfig::new(addr, [domain]).unwrap());
        let router = Arc::new(Router::new());
        let session_manager = Arc::new(SessionManager::new(config.max_user_sessions, auth.clone()));

        let local_handler = Arc::new(LocalHandler::new(session_manager.clone()));
        for host in config.served_hosts() {
            let (unused_mailbox, _unused_inbox) = mailbox::<RoutedPacket>(1);
            let shortcut: Arc<dyn xmppd_core::router::RouteShortcut> = Arc::new(local_handler.clone());
            router.register_route(host.clone(), unused_mailbox, Some(shortcut));
        }

        let deps = C2sDeps::new(config.clone(), auth, router, session_manager);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else { return };
                let deps = deps.clone();
                tokio::spawn(async move { c2s::run(stream, deps).await });
            }
        });

        TestServer {
            addr,
            domain: domain.to_string(),
        }
    }

    pub async fn connect(&self) -> RawClient {
        let stream = TcpStream::connect(self.addr).await.expect("connect to test server");
        RawClient {
            stream,
            buffer: String::new(),
        }
    }
}

/// A bare TCP client that writes exact bytes and scans the accumulated
/// response buffer for a substring, the way a hand-rolled interop test would.
pub struct RawClient {
    stream: TcpStream,
    buffer: String,
}

impl RawClient {
    pub async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn read_until(&mut self, pattern: &str) -> String {
        let start = std::time::Instant::now();
        loop {
            if self.buffer.contains(pattern) {
                return self.buffer.clone();
            }
            if start.elapsed() > DEFAULT_TIMEOUT {
                panic!("timed out waiting for {pattern:?} in {:?}", self.buffer);
            }
            let mut buf = [0u8; 4096];
            let remaining = DEFAULT_TIMEOUT.saturating_sub(start.elapsed());
            let n = match timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => panic!("connection closed before {pattern:?} appeared"),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => panic!("read error: {e}"),
                Err(_) => panic!("timed out waiting for {pattern:?}"),
            };
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// True if the connection closes (EOF) within the timeout without the
    /// pattern ever appearing.
    pub async fn expect_close(&mut self) {
        let start = std::time::Instant::now();
        loop {
            if start.elapsed() > DEFAULT_TIMEOUT {
                panic!("expected connection close, but it is still open");
            }
            let mut buf = [0u8; 4096];
            let remaining = DEFAULT_TIMEOUT.saturating_sub(start.elapsed());
            match timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => self.buffer.push_str(&String::from_utf8_lossy(&buf[..n])),
                Ok(Err(_)) => return,
                Err(_) => panic!("timed out waiting for connection close"),
            }
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub async fn open_stream(&mut self, domain: &str) {
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='{domain}' version='1.0'>"
        ))
        .await;
        self.read_until("<stream:stream").await;
        self.read_until("</stream:features>").await;
        self.clear();
    }

    pub async fn sasl_plain(&mut self, user: &str, pass: &str) {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        let payload = BASE64.encode(format!("\0{user}\0{pass}"));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{payload}</auth>"
        ))
        .await;
    }

    pub async fn bind(&mut self, resource: Option<&str>) -> String {
        let body = resource.map(|r| format!("<resource>{r}</resource>")).unwrap_or_default();
        self.send(&format!(
            "<iq type='set' id='bind1' xmlns='jabber:client'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{body}</bind></iq>"
        ))
        .await;
        self.read_until("</iq>").await
    }

    pub async fn establish_session(&mut self) {
        self.send("<iq type='set' id='sess1' xmlns='jabber:client'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>").await;
        self.read_until("</iq>").await;
        self.clear();
    }

    /// Full happy path: open stream, SASL PLAIN, restart, bind, session.
    /// Returns the bound JID extracted from the bind reply.
    pub async fn log_in(&mut self, domain: &str, user: &str, pass: &str, resource: Option<&str>) -> String {
        self.open_stream(domain).await;
        self.sasl_plain(user, pass).await;
        self.read_until("<success").await;
        self.clear();
        self.open_stream(domain).await;
        let bind_reply = self.bind(resource).await;
        self.establish_session().await;
        extract_bound_jid(&bind_reply).expect("bind reply carries a jid")
    }
}

pub fn extract_bound_jid(response: &str) -> Option<String> {
    let start = response.find("<jid>")?;
    let end = response.find("</jid>")?;
    Some(response[start + 5..end].to_string())
}
