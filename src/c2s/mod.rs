//! C2S protocol state machine (§4.8): the seven-state automaton driving one
//! client connection from stream-open through authentication, resource
//! binding, session establishment, and the steady-state stanza pump.
//!
//! Plays the role the teacher's `ConnectionActor` in `connection.rs` plays —
//! one task per connection, multiplexing socket events against routed
//! deliveries via `tokio::select!` between two independent receive sources
//! (`process_stanzas`'s `inbound_result`/`outbound` select, generalized here
//! to the typed [`SocketEvent`]/[`C2sInbound`] inboxes this crate uses) — but
//! replaces the teacher's `xmpp_parsers`-typed stanza handling with the
//! generic `minidom::Element` pump this crate's data model calls for.

pub mod hooks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tracing::{info, instrument, warn};

use crate::collaborators::AuthBackend;
use crate::config::XmppdConfig;
use crate::error::{StanzaError, StreamError};
use crate::jid::Jid;
use crate::message::C2sInbound;
use crate::parser::{find_attr, find_lang, StreamEvent, StreamReader};
use crate::process::{mailbox, Mailbox};
use crate::router::{RoutedPacket, Router};
use crate::sasl::{SaslContext, SaslMechanism, SaslRegistry, SaslStep};
use crate::session_manager::{SessionId, SessionInfo, SessionManager};
use crate::socket::{Socket, SocketEvent};
use crate::stanza::{
    iq_query_info, make_result_iq_reply, remove_attr, set_attr, set_from_to, stanza_kind,
    IqClassification, IqType, StanzaKind,
};

use hooks::{AllowAll, NoopRosterHook, PrivacyCheck, RosterHook};

const STREAMS_NS: &str = "http://etherx.jabber.org/streams";
const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";
const AUTH_NS: &str = "jabber:iq:auth";
const MAX_LANG_LEN: usize = 35;

/// Shared collaborators a C2S session needs (§4.8, §6). Built once at
/// startup and cloned (cheaply, behind `Arc`s) into every accepted
/// connection.
#[derive(Clone)]
pub struct C2sDeps {
    pub config: Arc<XmppdConfig>,
    pub sasl_registry: Arc<SaslRegistry>,
    pub auth: Arc<dyn AuthBackend>,
    pub router: Arc<Router>,
    pub session_manager: Arc<SessionManager>,
    pub privacy: Arc<dyn PrivacyCheck>,
    pub roster_hook: Arc<dyn RosterHook>,
}

impl C2sDeps {
    /// Build the defaults (all mechanisms registered, no privacy lists, no
    /// roster hook) around the four collaborators that do need a real
    /// implementation from the embedder.
    pub fn new(
        config: Arc<XmppdConfig>,
        auth: Arc<dyn AuthBackend>,
        router: Arc<Router>,
        session_manager: Arc<SessionManager>,
    ) -> Self {
        C2sDeps {
            config,
            sasl_registry: Arc::new(SaslRegistry::with_defaults()),
            auth,
            router,
            session_manager,
            privacy: Arc::new(AllowAll),
            roster_hook: Arc::new(NoopRosterHook),
        }
    }
}

enum State {
    WaitForStream,
    WaitForAuth,
    WaitForFeatureRequest,
    WaitForSaslResponse(Box<dyn SaslMechanism>),
    WaitForBind,
    WaitForSession,
    SessionEstablished,
}

/// One connection's worth of state (§3 "connection state", §4.8).
struct C2s {
    deps: C2sDeps,
    socket: Socket,
    reader: StreamReader,
    state: State,
    stream_id: String,
    server: String,
    lang: Option<String>,
    authenticated: bool,
    user: Option<String>,
    resource: Option<String>,
    full_jid: Option<Jid>,
    sid: Option<SessionId>,
    priority: i32,
    invisible: bool,
    pres_last: Option<Element>,
    pres_f: HashSet<String>,
    pres_t: HashSet<String>,
    pres_a: HashSet<String>,
    pres_i: HashSet<String>,
    own_mailbox: Option<Mailbox<C2sInbound>>,
    stopped: bool,
}

/// Drive one accepted TCP connection through the full C2S lifecycle (§4.8).
/// Returns once the stream closes, in either direction.
pub async fn run(stream: TcpStream, deps: C2sDeps) {
    let (sock_mbox, mut sock_inbox) = mailbox::<SocketEvent>(1024);
    let socket = Socket::of_tcp(stream, sock_mbox, Duration::from_secs(120), 1 << 20);
    let (own_mailbox, mut inbox) = mailbox::<C2sInbound>(deps.config.mailbox_capacity);

    let server = deps.config.primary_host().to_string();
    let mut c2s = C2s {
        deps,
        socket,
        reader: StreamReader::new(),
        state: State::WaitForStream,
        stream_id: gen_id(),
        server,
        lang: None,
        authenticated: false,
        user: None,
        resource: None,
        full_jid: None,
        sid: None,
        priority: 0,
        invisible: false,
        pres_last: None,
        pres_f: HashSet::new(),
        pres_t: HashSet::new(),
        pres_a: HashSet::new(),
        pres_i: HashSet::new(),
        own_mailbox: Some(own_mailbox),
        stopped: false,
    };

    loop {
        tokio::select! {
            event = sock_inbox.receive() => {
                match event {
                    Some(SocketEvent::TcpData(bytes)) => {
                        c2s.reader.feed(&bytes);
                        let events = c2s.reader.drain_events();
                        for ev in events {
                            c2s.handle_stream_event(ev).await;
                            if c2s.stopped {
                                break;
                            }
                        }
                    }
                    Some(SocketEvent::TcpClose) | None => break,
                }
            }
            inbound = inbox.receive() => {
                match inbound {
                    Some(C2sInbound::Replaced) => {
                        c2s.fail_stream(StreamError::Conflict).await;
                    }
                    Some(C2sInbound::Route(routed)) => c2s.deliver_routed(routed),
                    None => break,
                }
            }
        }
        if c2s.stopped {
            break;
        }
    }

    c2s.cleanup();
}

impl C2s {
    fn send_async(&self, el: &Element) {
        self.socket.send_async(serialize(el));
    }

    fn send_raw(&self, text: &str) {
        self.socket.send_async(text.as_bytes().to_vec());
    }

    fn send_stream_header(&self, version: Option<&str>) {
        let mut header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='{STREAMS_NS}' id='{}' from='{}'",
            self.stream_id, self.server,
        );
        if let Some(version) = version {
            header.push_str(&format!(" version='{version}'"));
        }
        if let Some(lang) = &self.lang {
            header.push_str(&format!(" xml:lang='{lang}'"));
        }
        header.push('>');
        self.send_raw(&header);
    }

    fn send_trailer(&self) {
        self.send_raw("</stream:stream>");
    }

    /// Emit a `<stream:error/>` plus the closing tag and mark this
    /// connection done (§4.9 "end of stream/errors").
    async fn fail_stream(&mut self, err: StreamError) {
        self.send_raw(&serialize_to_string(&err.to_element()));
        self.send_trailer();
        self.stopped = true;
        self.socket.close();
    }

    /// A stanza-level error reply that does not echo the request's children
    /// back to the client — used for anything that might be carrying a
    /// password or other sensitive payload (§4.8 WaitForAuth).
    fn reply_error_stripped(&self, el: &Element, error: StanzaError, text: Option<&str>) {
        let id = el.attr("id");
        let from = el.attr("to");
        let to = el.attr("from");
        let mut builder = Element::builder(el.name(), el.ns()).attr("type", "error");
        if let Some(id) = id {
            builder = builder.attr("id", id);
        }
        if let Some(from) = from {
            builder = builder.attr("from", from);
        }
        if let Some(to) = to {
            builder = builder.attr("to", to);
        }
        let mut reply = builder.build();
        reply.append_child(error.to_element(text));
        self.send_async(&reply);
    }

    async fn handle_stream_event(&mut self, ev: StreamEvent) {
        match &ev {
            StreamEvent::StreamEnd => {
                self.send_trailer();
                self.stopped = true;
                self.socket.close();
                return;
            }
            StreamEvent::StreamError(msg) => {
                warn!(error = %msg, "c2s: malformed xml, closing stream");
                self.fail_stream(StreamError::XmlNotWellFormed).await;
                return;
            }
            _ => {}
        }

        match std::mem::replace(&mut self.state, State::WaitForStream) {
            State::WaitForStream => self.on_wait_for_stream(ev).await,
            State::WaitForAuth => self.on_wait_for_auth(ev).await,
            State::WaitForFeatureRequest => self.on_wait_for_feature_request(ev).await,
            State::WaitForSaslResponse(mech) => self.on_wait_for_sasl_response(ev, mech).await,
            State::WaitForBind => self.on_wait_for_bind(ev).await,
            State::WaitForSession => self.on_wait_for_session(ev).await,
            State::SessionEstablished => self.on_session_established(ev).await,
        }
    }

    /// `WaitForStream` (§4.8): validate the opening tag, emit our own
    /// header, and dispatch into whichever next state the connection's
    /// already-known auth/bind status calls for.
    async fn on_wait_for_stream(&mut self, ev: StreamEvent) {
        let StreamEvent::StreamStart { ns, attrs, .. } = ev else {
            self.fail_stream(StreamError::XmlNotWellFormed).await;
            return;
        };

        self.lang = find_lang(&attrs).map(truncate_lang);
        let version = find_attr(&attrs, "version").map(|s| s.to_string());

        if ns != STREAMS_NS {
            self.send_stream_header(version.as_deref());
            self.fail_stream(StreamError::InvalidNamespace).await;
            return;
        }

        let Some(to_raw) = find_attr(&attrs, "to") else {
            self.send_stream_header(version.as_deref());
            self.fail_stream(StreamError::HostUnknown).await;
            return;
        };
        let Ok(host) = stringprep::nameprep(to_raw).map(|c| c.into_owned()) else {
            self.send_stream_header(version.as_deref());
            self.fail_stream(StreamError::HostUnknown).await;
            return;
        };
        if !self.deps.config.serves_host(&host) {
            self.send_stream_header(version.as_deref());
            self.fail_stream(StreamError::HostUnknown).await;
            return;
        }
        self.server = host;
        self.send_stream_header(version.as_deref());

        let is_1_0 = version.as_deref() == Some("1.0");
        match (is_1_0, self.authenticated, self.resource.is_some()) {
            (true, false, _) => {
                self.send_features_sasl();
                self.state = State::WaitForFeatureRequest;
            }
            (true, true, false) => {
                self.send_features_bind();
                self.state = State::WaitForBind;
            }
            (true, true, true) => {
                self.send_raw("<stream:features/>");
                self.state = State::WaitForSession;
            }
            _ => {
                self.state = State::WaitForAuth;
            }
        }
    }

    fn send_features_sasl(&self) {
        let mut body = format!("<stream:features><mechanisms xmlns='{SASL_NS}'>");
        for name in self.deps.sasl_registry.mechanism_names() {
            body.push_str(&format!("<mechanism>{name}</mechanism>"));
        }
        body.push_str("</mechanisms></stream:features>");
        self.send_raw(&body);
    }

    fn send_features_bind(&self) {
        self.send_raw(&format!(
            "<stream:features><bind xmlns='{BIND_NS}'/><session xmlns='{SESSION_NS}'/></stream:features>"
        ));
    }

    /// `WaitForAuth` (§4.8): the legacy `jabber:iq:auth` path, for clients
    /// that never negotiated SASL.
    async fn on_wait_for_auth(&mut self, ev: StreamEvent) {
        let StreamEvent::StreamElement(el) = ev else {
            self.fail_stream(StreamError::XmlNotWellFormed).await;
            return;
        };

        match iq_query_info(&el) {
            IqClassification::ValidRequest { ty: IqType::Get, payload } if is_ns(payload, AUTH_NS) => {
                self.send_auth_form(&el);
            }
            IqClassification::ValidRequest { ty: IqType::Set, payload } if is_ns(payload, AUTH_NS) => {
                let payload = payload.clone();
                self.handle_legacy_auth_set(&el, &payload).await;
                return;
            }
            IqClassification::ValidRequest { .. } => {
                self.reply_error_stripped(&el, StanzaError::ServiceUnavailable, None);
            }
            _ => {}
        }
        self.state = State::WaitForAuth;
    }

    fn send_auth_form(&self, el: &Element) {
        let id = el.attr("id").unwrap_or("auth1");
        let from = el.attr("to");
        let to = el.attr("from");
        let mut builder = Element::builder("iq", "jabber:client").attr("type", "result").attr("id", id);
        if let Some(from) = from {
            builder = builder.attr("from", from);
        }
        if let Some(to) = to {
            builder = builder.attr("to", to);
        }
        let mut reply = builder.build();
        let mut query = Element::bare("query", AUTH_NS);
        for name in ["username", "password", "digest", "resource"] {
            query.append_child(Element::bare(name, AUTH_NS));
        }
        reply.append_child(query);
        self.send_async(&reply);
    }

    async fn handle_legacy_auth_set(&mut self, el: &Element, payload: &Element) {
        let username = payload.get_child("username", AUTH_NS).map(|e| e.text());
        let password = payload.get_child("password", AUTH_NS).map(|e| e.text());
        let digest = payload.get_child("digest", AUTH_NS).map(|e| e.text());
        let resource = payload
            .get_child("resource", AUTH_NS)
            .map(|e| e.text())
            .filter(|r| !r.is_empty());

        let (Some(username), Some(resource)) = (username, resource) else {
            self.reply_error_stripped(el, StanzaError::NotAcceptable, Some("username and resource are required"));
            self.state = State::WaitForAuth;
            return;
        };

        let Ok(base) = Jid::parse(&format!("{username}@{}", self.server)) else {
            self.reply_error_stripped(el, StanzaError::JidMalformed, None);
            self.state = State::WaitForAuth;
            return;
        };
        let Ok(full) = base.with_resource(&resource) else {
            self.reply_error_stripped(el, StanzaError::JidMalformed, None);
            self.state = State::WaitForAuth;
            return;
        };

        let user = base.user().unwrap_or(&username).to_string();
        let auth_ok = if let Some(digest) = digest.filter(|d| !d.is_empty()) {
            let stream_id = self.stream_id.clone();
            let digest_gen = move |pwd: &str| sha1_hex(&format!("{stream_id}{pwd}"));
            self.deps
                .auth
                .check_password_digest_with_authmodule(&user, &self.server, &digest, &digest_gen)
                .await
        } else if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.deps
                .auth
                .check_password_with_authmodule(&user, &self.server, &password)
                .await
        } else {
            None
        };

        match auth_ok {
            Some(_module) => {
                self.authenticated = true;
                self.user = Some(user);
                self.resource = full.resource().map(|s| s.to_string());
                self.full_jid = Some(full);
                let reply = make_result_iq_reply(el);
                self.send_async(&reply);
                self.enter_session_established().await;
            }
            None => {
                self.reply_error_stripped(el, StanzaError::NotAuthorized, None);
                self.state = State::WaitForAuth;
            }
        }
    }

    /// `WaitForFeatureRequest` (§4.8): the client's `<auth/>` naming a SASL
    /// mechanism.
    async fn on_wait_for_feature_request(&mut self, ev: StreamEvent) {
        let StreamEvent::StreamElement(el) = ev else {
            self.fail_stream(StreamError::XmlNotWellFormed).await;
            return;
        };

        if el.name() != "auth" || el.ns() != SASL_NS {
            if matches!(stanza_kind(&el), Some(StanzaKind::Iq)) {
                self.reply_error_stripped(&el, StanzaError::ServiceUnavailable, None);
            }
            self.state = State::WaitForFeatureRequest;
            return;
        }

        let Some(mechanism) = el.attr("mechanism").map(|s| s.to_string()) else {
            self.send_sasl_failure("bad-protocol");
            self.state = State::WaitForFeatureRequest;
            return;
        };

        let Some(client_input) = decode_b64_body(&el) else {
            self.send_sasl_failure("incorrect-encoding");
            self.state = State::WaitForFeatureRequest;
            return;
        };

        let ctx = SaslContext {
            server_fqdn: self.server.clone(),
            auth: self.deps.auth.clone(),
        };
        let Some(mut mech) = self.deps.sasl_registry.start(&mechanism, ctx) else {
            self.send_sasl_failure("invalid-mechanism");
            self.state = State::WaitForFeatureRequest;
            return;
        };

        let step = mech.step(&client_input).await;
        self.apply_sasl_step(step, mech).await;
    }

    /// `WaitForSaslResponse(step)` (§4.8): a mid-exchange `<response/>`.
    async fn on_wait_for_sasl_response(&mut self, ev: StreamEvent, mut mech: Box<dyn SaslMechanism>) {
        let StreamEvent::StreamElement(el) = ev else {
            self.fail_stream(StreamError::XmlNotWellFormed).await;
            return;
        };

        if el.name() != "response" || el.ns() != SASL_NS {
            if matches!(stanza_kind(&el), Some(StanzaKind::Iq)) {
                self.reply_error_stripped(&el, StanzaError::ServiceUnavailable, None);
            }
            self.state = State::WaitForSaslResponse(mech);
            return;
        }

        let Some(client_input) = decode_b64_body(&el) else {
            self.send_sasl_failure("incorrect-encoding");
            self.state = State::WaitForFeatureRequest;
            return;
        };

        let step = mech.step(&client_input).await;
        self.apply_sasl_step(step, mech).await;
    }

    async fn apply_sasl_step(&mut self, step: SaslStep, mech: Box<dyn SaslMechanism>) {
        match step {
            SaslStep::Done(props) => {
                self.send_raw(&format!("<success xmlns='{SASL_NS}'/>"));
                self.reader.reset_stream();
                self.authenticated = true;
                self.user = Some(props.username);
                self.stream_id = gen_id();
                self.state = State::WaitForStream;
            }
            SaslStep::Continue(server_output) => {
                let body = BASE64.encode(server_output);
                self.send_raw(&format!("<challenge xmlns='{SASL_NS}'>{body}</challenge>"));
                self.state = State::WaitForSaslResponse(mech);
            }
            SaslStep::Error(condition) => {
                self.send_sasl_failure(condition);
                self.state = State::WaitForFeatureRequest;
            }
            SaslStep::ErrorUser(condition, user) => {
                warn!(%user, %condition, "c2s: sasl authentication failed");
                self.send_sasl_failure(condition);
                self.state = State::WaitForFeatureRequest;
            }
        }
    }

    fn send_sasl_failure(&self, condition: &str) {
        self.send_raw(&format!("<failure xmlns='{SASL_NS}'><{condition}/></failure>"));
    }

    /// `WaitForBind` (§4.8): resource binding, with a random fallback
    /// resource when the client doesn't ask for a specific one.
    async fn on_wait_for_bind(&mut self, ev: StreamEvent) {
        let StreamEvent::StreamElement(el) = ev else {
            self.fail_stream(StreamError::XmlNotWellFormed).await;
            return;
        };

        let classification = iq_query_info(&el);
        let is_bind_set = matches!(
            &classification,
            IqClassification::ValidRequest { ty: IqType::Set, payload } if is_ns(payload, BIND_NS)
        );
        if !is_bind_set {
            self.reply_error_stripped(&el, StanzaError::NotAllowed, None);
            self.state = State::WaitForBind;
            return;
        }

        let requested = match classification {
            IqClassification::ValidRequest { payload, .. } => {
                payload.get_child("resource", BIND_NS).map(|e| e.text())
            }
            _ => None,
        };
        let resource = requested.filter(|r| !r.is_empty()).unwrap_or_else(random_resource);

        let user = self.user.clone().unwrap_or_default();
        let base = match Jid::parse(&format!("{user}@{}", self.server)) {
            Ok(jid) => jid,
            Err(_) => {
                self.reply_error_stripped(&el, StanzaError::BadRequest, None);
                self.state = State::WaitForBind;
                return;
            }
        };

        match base.with_resource(&resource) {
            Ok(full) => {
                self.resource = full.resource().map(|s| s.to_string());
                self.send_bind_result(&el, &full);
                self.full_jid = Some(full);
                self.state = State::WaitForSession;
            }
            Err(_) => {
                self.reply_error_stripped(&el, StanzaError::BadRequest, None);
                self.state = State::WaitForBind;
            }
        }
    }

    fn send_bind_result(&self, el: &Element, full: &Jid) {
        let id = el.attr("id").unwrap_or("bind1");
        let mut reply = Element::builder("iq", "jabber:client")
            .attr("type", "result")
            .attr("id", id)
            .build();
        let mut bind = Element::bare("bind", BIND_NS);
        let jid_el = Element::builder("jid", BIND_NS).append(full.to_string()).build();
        bind.append_child(jid_el);
        reply.append_child(bind);
        self.send_async(&reply);
    }

    /// `WaitForSession` (§4.8): the (now-vestigial, but still required by
    /// many clients) session-establishment IQ.
    async fn on_wait_for_session(&mut self, ev: StreamEvent) {
        let StreamEvent::StreamElement(el) = ev else {
            self.fail_stream(StreamError::XmlNotWellFormed).await;
            return;
        };

        let is_session_set = matches!(
            iq_query_info(&el),
            IqClassification::ValidRequest { ty: IqType::Set, payload } if is_ns(payload, SESSION_NS)
        );
        if !is_session_set {
            self.reply_error_stripped(&el, StanzaError::NotAllowed, None);
            self.state = State::WaitForSession;
            return;
        }

        let reply = make_result_iq_reply(&el);
        self.send_async(&reply);
        self.enter_session_established().await;
    }

    /// Seed the roster bookkeeping (§4.8: pres_f/pres_t default to the
    /// account's own bare JID absent a real roster store, §9) and register
    /// the session with the Session Manager.
    async fn enter_session_established(&mut self) {
        let full = self.full_jid.clone().expect("bound before session establishment");
        let key = bare_key(&full);
        self.pres_f.insert(key.clone());
        self.pres_t.insert(key);

        let mailbox = self
            .own_mailbox
            .take()
            .expect("enter_session_established runs at most once per connection");
        let sid = SessionId::new(mailbox.pid());
        self.sid = Some(sid);
        self.deps.session_manager.open_session(
            sid,
            self.user.clone().unwrap_or_default(),
            self.server.clone(),
            self.resource.clone().unwrap_or_default(),
            self.priority,
            SessionInfo::default(),
            mailbox,
        );

        self.state = State::SessionEstablished;
    }

    /// `SessionEstablished` (§4.8): the steady-state stanza pump.
    #[instrument(skip_all)]
    async fn on_session_established(&mut self, ev: StreamEvent) {
        let StreamEvent::StreamElement(mut el) = ev else {
            self.fail_stream(StreamError::XmlNotWellFormed).await;
            return;
        };

        if let Some(from_raw) = el.attr("from") {
            if !self.from_attr_matches(from_raw) {
                self.fail_stream(StreamError::InvalidFrom).await;
                return;
            }
        }

        let from = self.full_jid.clone().expect("session established implies a bound jid");

        let to = match el.attr("to") {
            None => from.to_bare(),
            Some(raw) => match Jid::parse(raw) {
                Ok(jid) => jid,
                Err(_) => {
                    if !matches!(el.attr("type"), Some("error") | Some("result")) {
                        self.reply_error_stripped(&el, StanzaError::JidMalformed, None);
                    }
                    self.state = State::SessionEstablished;
                    return;
                }
            },
        };

        el = remove_attr("xmlns", &el);

        if el.attr("xml:lang").is_none() {
            if let Some(lang) = self.lang.clone() {
                el = set_attr(&el, "xml:lang", &lang);
            }
        }

        match stanza_kind(&el) {
            Some(StanzaKind::Presence) => {
                if to.is_bare() && to == from.to_bare() {
                    self.presence_update(el).await;
                } else {
                    self.presence_track(to, el).await;
                }
            }
            Some(StanzaKind::Iq) | Some(StanzaKind::Message) => {
                self.privacy_route(from, to, el).await;
            }
            None => {}
        }

        self.state = State::SessionEstablished;
    }

    fn from_attr_matches(&self, raw: &str) -> bool {
        let Ok(parsed) = Jid::parse(raw) else { return false };
        let Some(full) = &self.full_jid else { return false };
        &parsed == full || (parsed.is_bare() && parsed == full.to_bare())
    }

    async fn privacy_route(&self, from: Jid, to: Jid, el: Element) {
        if self.deps.privacy.allows(&from, &to, &el) {
            self.deps.router.route(from, to, el).await;
        } else {
            self.reply_error_stripped(&el, StanzaError::NotAcceptable, Some("blocked by privacy list"));
        }
    }

    /// Directed presence at one's own bare JID: update availability, then
    /// fan out per §4.8's `presence_update` rules.
    async fn presence_update(&mut self, el: Element) {
        match el.attr("type") {
            Some("unavailable") => {
                self.broadcast_presence(&el, true).await;
                self.pres_a.clear();
                self.pres_i.clear();
                self.pres_last = None;
            }
            Some("invisible") => {
                if !self.invisible {
                    self.broadcast_presence(&el, true).await;
                    self.pres_a.clear();
                    self.pres_i.clear();
                    self.invisible = true;
                    self.pres_last = None;
                }
                self.first_presence_broadcast().await;
            }
            Some("error") | Some("probe") | Some("subscribe") | Some("subscribed")
            | Some("unsubscribe") | Some("unsubscribed") => {}
            _ => {
                let was_first = self.pres_last.is_none() || self.invisible;
                let old_priority = self.priority;
                self.priority = parse_priority(&el);
                self.invisible = false;
                self.pres_last = Some(el.clone());

                if was_first {
                    self.first_presence_broadcast().await;
                } else {
                    self.broadcast_to_fa_intersection(&el).await;
                }
                if old_priority < 0 && self.priority >= 0 {
                    info!("c2s: priority went non-negative; offline-message resend is out of scope");
                }
            }
        }
    }

    async fn broadcast_presence(&self, el: &Element, include_invisible_targets: bool) {
        let from = self.full_jid.as_ref().expect("bound").to_bare();
        let mut targets: HashSet<String> = self.pres_a.clone();
        if include_invisible_targets {
            targets.extend(self.pres_i.iter().cloned());
        }
        for target in targets {
            if let Ok(to) = Jid::parse(&target) {
                self.deps.router.route(from.clone(), to, el.clone()).await;
            }
        }
    }

    async fn broadcast_to_fa_intersection(&self, el: &Element) {
        let from = self.full_jid.as_ref().expect("bound").to_bare();
        for target in self.pres_f.intersection(&self.pres_a) {
            if let Ok(to) = Jid::parse(target) {
                self.deps.router.route(from.clone(), to, el.clone()).await;
            }
        }
    }

    /// Probe every entry in `pres_t` and, unless invisible, send the current
    /// presence to every entry in `pres_f` (§4.8 `first_presence_broadcast`).
    async fn first_presence_broadcast(&mut self) {
        let from = self.full_jid.as_ref().expect("bound").to_bare();

        for target in self.pres_t.clone() {
            if let Ok(to) = Jid::parse(&target) {
                let probe = Element::builder("presence", "jabber:client").attr("type", "probe").build();
                self.deps.router.route(from.clone(), to, probe).await;
            }
        }

        if self.invisible {
            return;
        }

        let current = self
            .pres_last
            .clone()
            .unwrap_or_else(|| Element::builder("presence", "jabber:client").build());
        for target in self.pres_f.clone() {
            let Ok(to) = Jid::parse(&target) else { continue };
            if self.deps.privacy.allows(&from, &to, &current) {
                self.deps.router.route(from.clone(), to, current.clone()).await;
                self.pres_a.insert(target);
            }
        }
    }

    /// Presence directed at someone other than oneself: subscription
    /// management and availability tracking (§4.8 `presence_track`).
    async fn presence_track(&mut self, to: Jid, el: Element) {
        let from = self.full_jid.clone().expect("bound");
        let bare_to = bare_key(&to);

        match el.attr("type") {
            Some("unavailable") => {
                self.privacy_route(from, to, el).await;
                self.pres_i.remove(&bare_to);
                self.pres_a.remove(&bare_to);
            }
            Some("invisible") => {
                self.privacy_route(from, to, el).await;
                self.pres_i.insert(bare_to.clone());
                self.pres_a.remove(&bare_to);
            }
            Some(kind @ ("subscribe" | "subscribed" | "unsubscribe" | "unsubscribed")) => {
                let kind = kind.to_string();
                self.privacy_route(from.clone(), to.clone(), el).await;
                self.deps.roster_hook.on_subscription_event(&from, &to, &kind).await;
            }
            Some("error") | Some("probe") => {
                self.privacy_route(from, to, el).await;
            }
            _ => {
                self.privacy_route(from, to, el).await;
                self.pres_a.insert(bare_to.clone());
                self.pres_i.remove(&bare_to);
            }
        }
    }

    fn deliver_routed(&mut self, routed: RoutedPacket) {
        let el = set_from_to(&routed.packet, &routed.from.to_string(), &routed.to.to_string());
        self.send_async(&el);
    }

    fn cleanup(&mut self) {
        if let Some(sid) = self.sid.take() {
            self.deps.session_manager.close_session(sid);
        }
    }
}

fn is_ns(el: &Element, ns: &str) -> bool {
    match el.attr("xmlns") {
        Some(explicit) => explicit == ns,
        None => el.ns() == ns,
    }
}

fn decode_b64_body(el: &Element) -> Option<Vec<u8>> {
    let text = el.text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    BASE64.decode(trimmed).ok()
}

fn parse_priority(el: &Element) -> i32 {
    el.get_child("priority", el.ns())
        .and_then(|c| c.text().trim().parse::<i32>().ok())
        .unwrap_or(0)
}

fn truncate_lang(s: &str) -> String {
    s.chars().take(MAX_LANG_LEN).collect()
}

/// Canonical `user@server` (or bare `server`) key used for the pres_f/t/a/i
/// membership sets, independent of however the client happened to spell it.
fn bare_key(jid: &Jid) -> String {
    match jid.user() {
        Some(user) => format!("{user}@{}", jid.server()),
        None => jid.server().to_string(),
    }
}

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn gen_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

fn random_resource() -> String {
    format!("{:x}", rand::rng().random::<u64>())
}

fn serialize(el: &Element) -> Vec<u8> {
    let mut buf = Vec::new();
    el.write_to(&mut buf).expect("writing xml to a Vec<u8> cannot fail");
    buf
}

fn serialize_to_string(el: &Element) -> String {
    String::from_utf8(serialize(el)).expect("xml writer only emits valid utf-8")
}
