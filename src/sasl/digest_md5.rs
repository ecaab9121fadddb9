//! SASL DIGEST-MD5 (RFC 2831 subset, §4.5).
//!
//! MD5 remains mechanism-mandated (§9 "Random and crypto") even though the
//! rest of this crate prefers SHA1/SCRAM-grade primitives elsewhere; nonces
//! use `rand`'s CSPRNG rather than the integer-mod pseudo-random the design
//! notes call out as a known weakness of the original.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::RngCore;

use super::{validate_done, SaslContext, SaslMechanism, SaslProps, SaslStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    One,
    Three,
    Five,
}

pub struct DigestMd5Mechanism {
    ctx: SaslContext,
    state: State,
    nonce: String,
    /// username recorded once Three succeeds, for Done's props and for logging on error.
    username: Option<String>,
}

impl DigestMd5Mechanism {
    pub fn new(ctx: SaslContext) -> Self {
        DigestMd5Mechanism {
            ctx,
            state: State::One,
            nonce: generate_nonce(),
            username: None,
        }
    }
}

#[async_trait]
impl SaslMechanism for DigestMd5Mechanism {
    async fn step(&mut self, client_input: &[u8]) -> SaslStep {
        match self.state {
            State::One => {
                self.state = State::Three;
                let challenge = format!(
                    "nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
                    self.nonce
                );
                SaslStep::Continue(challenge.into_bytes())
            }
            State::Three => self.step_three(client_input).await,
            State::Five => {
                if client_input.is_empty() {
                    match self.username.take() {
                        Some(username) => validate_done(SaslProps {
                            username,
                            authzid: None,
                            auth_module: "digest-md5".to_string(),
                        }),
                        None => SaslStep::Error("bad-protocol"),
                    }
                } else {
                    SaslStep::Error("bad-protocol")
                }
            }
        }
    }
}

impl DigestMd5Mechanism {
    async fn step_three(&mut self, client_input: &[u8]) -> SaslStep {
        let text = match std::str::from_utf8(client_input) {
            Ok(s) => s,
            Err(_) => return SaslStep::Error("bad-protocol"),
        };
        let Some(kv) = parse_kv(text) else {
            return SaslStep::Error("bad-protocol");
        };

        let (username, realm, nonce, cnonce, nc, qop, digest_uri, response) = match (
            kv.get("username"),
            kv.get("realm"),
            kv.get("nonce"),
            kv.get("cnonce"),
            kv.get("nc"),
            kv.get("qop"),
            kv.get("digest-uri"),
            kv.get("response"),
        ) {
            (Some(u), r, Some(n), Some(cn), Some(nc), q, Some(du), Some(resp)) => (
                u.clone(),
                r.cloned().unwrap_or_default(),
                n.clone(),
                cn.clone(),
                nc.clone(),
                q.cloned().unwrap_or_else(|| "auth".to_string()),
                du.clone(),
                resp.clone(),
            ),
            _ => return SaslStep::Error("bad-protocol"),
        };

        if nonce != self.nonce {
            return SaslStep::Error("bad-protocol");
        }
        if !validate_digest_uri(&digest_uri, &self.ctx.server_fqdn) {
            return SaslStep::Error("bad-protocol");
        }

        let canon_username = match crate::jid::nodeprep(&username) {
            Ok(u) if !u.is_empty() => u,
            _ => return SaslStep::ErrorUser("not-authorized", username),
        };

        let authzid = kv.get("authzid").cloned();

        let Some((password, _module)) = self
            .ctx
            .auth
            .get_password_with_authmodule(&canon_username, &self.ctx.server_fqdn)
            .await
        else {
            return SaslStep::ErrorUser("not-authorized", canon_username);
        };

        let a1 = compute_a1(
            &canon_username,
            &realm,
            &password,
            &nonce,
            &cnonce,
            authzid.as_deref(),
        );
        let a2 = a2_string("AUTHENTICATE:", &digest_uri, &qop);
        let expected = compute_response(&a1, &nonce, &nc, &cnonce, &qop, &a2);

        if expected != response {
            return SaslStep::ErrorUser("not-authorized", canon_username);
        }

        let rspauth_a2 = a2_string("", &digest_uri, &qop);
        let rspauth = compute_response(&a1, &nonce, &nc, &cnonce, &qop, &rspauth_a2);

        self.username = Some(canon_username);
        self.state = State::Five;
        SaslStep::Continue(format!("rspauth={rspauth}").into_bytes())
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn validate_digest_uri(digest_uri: &str, server_fqdn: &str) -> bool {
    let plain = format!("xmpp/{server_fqdn}");
    if digest_uri == plain {
        return true;
    }
    let with_servname = format!("{plain}/{server_fqdn}");
    digest_uri == with_servname
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// `A1 = MD5(user:realm:pass) ":" nonce ":" cnonce [":" authzid]` (§4.5).
fn compute_a1(
    user: &str,
    realm: &str,
    pass: &str,
    nonce: &str,
    cnonce: &str,
    authzid: Option<&str>,
) -> Vec<u8> {
    let inner = format!("{user}:{realm}:{pass}");
    let digest = md5::compute(inner.as_bytes());
    let mut a1 = Vec::with_capacity(16 + nonce.len() + cnonce.len() + 32);
    a1.extend_from_slice(&*digest);
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    if let Some(authzid) = authzid {
        a1.extend_from_slice(format!(":{authzid}").as_bytes());
    }
    a1
}

/// `A2 = "AUTHENTICATE:" digest-uri` for the response, or an empty prefix
/// for `rspauth`; qop != "auth" appends the fixed all-zero suffix (§4.5).
fn a2_string(prefix: &str, digest_uri: &str, qop: &str) -> String {
    if qop == "auth" {
        format!("{prefix}{digest_uri}")
    } else {
        format!("{prefix}{digest_uri}:00000000000000000000000000000000")
    }
}

/// `HEX(MD5( HEX(MD5(A1)) ":" nonce ":" nc ":" cnonce ":" qop ":" HEX(MD5(A2)) ))` (§4.5).
fn compute_response(a1: &[u8], nonce: &str, nc: &str, cnonce: &str, qop: &str, a2: &str) -> String {
    let ha1 = md5_hex(a1);
    let ha2 = md5_hex(a2.as_bytes());
    let kd_input = format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}");
    md5_hex(kd_input.as_bytes())
}

/// RFC 2831 key/value grammar: comma-separated `key=value` or
/// `key="quoted value with \\ escapes"`; an unterminated quote is malformed.
fn parse_kv(s: &str) -> Option<HashMap<String, String>> {
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    let mut i = 0;
    let mut map = HashMap::new();
    while i < n {
        while i < n && (chars[i] == ',' || chars[i].is_whitespace()) {
            i += 1;
        }
        if i >= n {
            break;
        }
        let key_start = i;
        while i < n && chars[i] != '=' {
            i += 1;
        }
        if i >= n {
            return None;
        }
        let key: String = chars[key_start..i].iter().collect::<String>().trim().to_string();
        i += 1;
        if i < n && chars[i] == '"' {
            i += 1;
            let mut value = String::new();
            let mut closed = false;
            while i < n {
                match chars[i] {
                    '\\' if i + 1 < n => {
                        value.push(chars[i + 1]);
                        i += 2;
                    }
                    '"' => {
                        closed = true;
                        i += 1;
                        break;
                    }
                    c => {
                        value.push(c);
                        i += 1;
                    }
                }
            }
            if !closed {
                return None;
            }
            map.insert(key, value);
        } else {
            let value_start = i;
            while i < n && chars[i] != ',' {
                i += 1;
            }
            let value: String = chars[value_start..i].iter().collect();
            map.insert(key, value);
        }
    }
    Some(map)
}
