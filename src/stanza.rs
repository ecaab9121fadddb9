//! Stanza/XML element helpers (§3, §4.4).
//!
//! The wire-level element tree is `minidom::Element` directly — the spec's
//! data model (§3) is a generic tagged-element tree with ordered attributes,
//! not a library of typed per-extension stanza payloads, so there is no
//! `xmpp_parsers`-shaped dependency pulled in here; stanzas are classified
//! and rewritten in place as plain `Element`s.

use minidom::Element;

use crate::error::StanzaError;

/// The three legal top-level stanza tag names (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// Classify a top-level element as a stanza, if it is one.
pub fn stanza_kind(el: &Element) -> Option<StanzaKind> {
    match el.name() {
        "message" => Some(StanzaKind::Message),
        "presence" => Some(StanzaKind::Presence),
        "iq" => Some(StanzaKind::Iq),
        _ => None,
    }
}

/// The four legal IQ `type` attribute values (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }
}

/// Result of classifying a top-level element as an IQ (`iq_query_info`, §4.4).
#[derive(Debug)]
pub enum IqClassification<'a> {
    /// A well-formed get/set with a payload child whose `xmlns` names it.
    ValidRequest { ty: IqType, payload: &'a Element },
    /// A well-formed result/error reply.
    ValidReply { ty: IqType },
    /// An `<iq/>` that fails the shape rules (bad/missing `type`, missing id,
    /// a get/set with no payload child or an empty/absent `xmlns`).
    Invalid,
    /// Not an `<iq/>` element at all.
    NotIq,
}

/// Classify a top-level element per §3/§4.4.
pub fn iq_query_info(el: &Element) -> IqClassification<'_> {
    if el.name() != "iq" {
        return IqClassification::NotIq;
    }
    let Some(ty) = el.attr("type").and_then(IqType::parse) else {
        return IqClassification::Invalid;
    };
    if el.attr("id").is_none() {
        return IqClassification::Invalid;
    }
    match ty {
        IqType::Get | IqType::Set => {
            let mut children = el.children();
            let Some(payload) = children.next() else {
                return IqClassification::Invalid;
            };
            if children.next().is_some() {
                return IqClassification::Invalid;
            }
            // minidom resolves an undeclared child namespace to its parent's,
            // so a bare `payload.ns()` can't tell "declared" from "inherited".
            // Require it to differ from the enclosing `<iq/>`'s own namespace.
            let payload_ns = payload.ns();
            if payload_ns.is_empty() || payload_ns == el.ns() {
                IqClassification::Invalid
            } else {
                IqClassification::ValidRequest { ty, payload }
            }
        }
        IqType::Result | IqType::Error => IqClassification::ValidReply { ty },
    }
}

/// Swap `from`/`to`, preserving every other attribute and all children.
pub fn replace_from_to(from: Option<&str>, to: Option<&str>, el: &Element) -> Element {
    let mut builder = Element::builder(el.name(), el.ns());
    for (name, value) in el.attrs() {
        match name {
            "from" => {
                if let Some(from) = from {
                    builder = builder.attr("from", from);
                }
            }
            "to" => {
                if let Some(to) = to {
                    builder = builder.attr("to", to);
                }
            }
            other => builder = builder.attr(other, value),
        }
    }
    let mut out = builder.build();
    for child in el.nodes() {
        out.append_node(child.clone());
    }
    out
}

/// Set both `from` and `to` on a copy of `el` unconditionally, preserving
/// every other attribute and child. Used when relaying a routed packet to
/// its recipient, where the delivered `from`/`to` is authoritative rather
/// than whatever the packet happened to carry already.
pub fn set_from_to(el: &Element, from: &str, to: &str) -> Element {
    set_attr(&set_attr(el, "from", from), "to", to)
}

/// Remove an attribute from a copy of `el`, if present.
pub fn remove_attr(name: &str, el: &Element) -> Element {
    let mut builder = Element::builder(el.name(), el.ns());
    for (attr_name, value) in el.attrs() {
        if attr_name != name {
            builder = builder.attr(attr_name, value);
        }
    }
    let mut out = builder.build();
    for child in el.nodes() {
        out.append_node(child.clone());
    }
    out
}

/// `make_result_iq_reply` (§4.4): swap from/to, set `type=result`, preserve id and children.
pub fn make_result_iq_reply(el: &Element) -> Element {
    let from = el.attr("to");
    let to = el.attr("from");
    let mut reply = replace_from_to(from, to, el);
    reply = set_attr(&reply, "type", "result");
    reply
}

/// `make_error_reply` (§4.4): swap from/to, set `type=error`, append the error element.
pub fn make_error_reply(el: &Element, error: StanzaError, text: Option<&str>) -> Element {
    let from = el.attr("to");
    let to = el.attr("from");
    let mut reply = replace_from_to(from, to, el);
    reply = set_attr(&reply, "type", "error");
    reply.append_child(error.to_element(text));
    reply
}

pub(crate) fn set_attr(el: &Element, name: &str, value: &str) -> Element {
    let mut builder = Element::builder(el.name(), el.ns()).attr(name, value);
    for (attr_name, attr_value) in el.attrs() {
        if attr_name != name {
            builder = builder.attr(attr_name, attr_value);
        }
    }
    let mut out = builder.build();
    for child in el.nodes() {
        out.append_node(child.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn classifies_valid_get_request() {
        let el = iq(
            r#"<iq xmlns='jabber:client' id='1' type='get'><query xmlns='jabber:iq:roster'/></iq>"#,
        );
        match iq_query_info(&el) {
            IqClassification::ValidRequest { ty: IqType::Get, .. } => {}
            other => panic!("expected ValidRequest(Get), got {other:?}"),
        }
    }

    #[test]
    fn classifies_invalid_when_payload_has_no_xmlns() {
        let el = iq(r#"<iq xmlns='jabber:client' id='1' type='get'><query/></iq>"#);
        assert!(matches!(iq_query_info(&el), IqClassification::Invalid));
    }

    #[test]
    fn classifies_reply() {
        let el = iq(r#"<iq xmlns='jabber:client' id='1' type='result'/>"#);
        assert!(matches!(
            iq_query_info(&el),
            IqClassification::ValidReply { ty: IqType::Result }
        ));
    }

    #[test]
    fn result_reply_swaps_from_to_and_sets_type() {
        let el = iq(
            r#"<iq xmlns='jabber:client' id='42' type='get' from='a@x' to='b@x'><query xmlns='urn:x'/></iq>"#,
        );
        let reply = make_result_iq_reply(&el);
        assert_eq!(reply.attr("from"), Some("b@x"));
        assert_eq!(reply.attr("to"), Some("a@x"));
        assert_eq!(reply.attr("type"), Some("result"));
        assert_eq!(reply.attr("id"), Some("42"));
    }

    #[test]
    fn error_reply_appends_error_element() {
        let el = iq(r#"<iq xmlns='jabber:client' id='1' type='get' from='a@x' to='b@x'/>"#);
        let reply = make_error_reply(&el, StanzaError::ServiceUnavailable, None);
        assert_eq!(reply.attr("type"), Some("error"));
        assert!(reply.children().any(|c| c.name() == "error"));
    }
}
