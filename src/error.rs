//! Error types for the XMPP server.
//!
//! [`XmppError`] covers internal/library failures and composes with `?`.
//! [`StreamError`] and [`StanzaError`] are not propagated with `?` — they are
//! protocol outcomes, constructed as data and rendered to XML on the wire.

use minidom::Element;
use thiserror::Error;

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Session not found or expired
    #[error("Session not found or expired")]
    SessionNotFound,

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource conflict (e.g., duplicate resource binding)
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// A process mailbox exceeded its capacity (§4.1 QueueLimit).
    #[error("mailbox queue limit exceeded")]
    QueueLimit,

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new permission denied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Stanza error type, carried in the `type` attribute of an `<error/>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Modify,
    Cancel,
    Auth,
    Wait,
}

impl ErrorType {
    fn as_str(self) -> &'static str {
        match self {
            ErrorType::Modify => "modify",
            ErrorType::Cancel => "cancel",
            ErrorType::Auth => "auth",
            ErrorType::Wait => "wait",
        }
    }
}

/// Named stanza-error conditions (RFC 6120 §8.3), each mapped to a legacy
/// numeric code and an [`ErrorType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaError {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PaymentRequired,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaError {
    /// The protocol condition name, as used in the error element's local tag name.
    pub fn condition(self) -> &'static str {
        use StanzaError::*;
        match self {
            BadRequest => "bad-request",
            Conflict => "conflict",
            FeatureNotImplemented => "feature-not-implemented",
            Forbidden => "forbidden",
            Gone => "gone",
            InternalServerError => "internal-server-error",
            ItemNotFound => "item-not-found",
            JidMalformed => "jid-malformed",
            NotAcceptable => "not-acceptable",
            NotAllowed => "not-allowed",
            NotAuthorized => "not-authorized",
            PaymentRequired => "payment-required",
            RecipientUnavailable => "recipient-unavailable",
            Redirect => "redirect",
            RegistrationRequired => "registration-required",
            RemoteServerNotFound => "remote-server-not-found",
            RemoteServerTimeout => "remote-server-timeout",
            ResourceConstraint => "resource-constraint",
            ServiceUnavailable => "service-unavailable",
            SubscriptionRequired => "subscription-required",
            UndefinedCondition => "undefined-condition",
            UnexpectedRequest => "unexpected-request",
        }
    }

    /// Legacy HTTP-like numeric code.
    pub fn code(self) -> u16 {
        use StanzaError::*;
        match self {
            BadRequest => 400,
            Conflict => 409,
            FeatureNotImplemented => 501,
            Forbidden => 403,
            Gone => 302,
            InternalServerError => 500,
            ItemNotFound => 404,
            JidMalformed => 400,
            NotAcceptable => 406,
            NotAllowed => 405,
            NotAuthorized => 401,
            PaymentRequired => 402,
            RecipientUnavailable => 404,
            Redirect => 302,
            RegistrationRequired => 407,
            RemoteServerNotFound => 404,
            RemoteServerTimeout => 504,
            ResourceConstraint => 500,
            ServiceUnavailable => 503,
            SubscriptionRequired => 407,
            UndefinedCondition => 500,
            UnexpectedRequest => 400,
        }
    }

    /// Error type bucket (modify / cancel / auth / wait).
    pub fn error_type(self) -> ErrorType {
        use StanzaError::*;
        match self {
            BadRequest | JidMalformed | NotAcceptable | UndefinedCondition => ErrorType::Modify,
            Conflict
            | FeatureNotImplemented
            | Forbidden
            | Gone
            | ItemNotFound
            | NotAllowed
            | RecipientUnavailable
            | Redirect
            | RegistrationRequired
            | RemoteServerNotFound
            | ServiceUnavailable
            | SubscriptionRequired => ErrorType::Cancel,
            NotAuthorized | PaymentRequired => ErrorType::Auth,
            InternalServerError | ResourceConstraint | RemoteServerTimeout | UnexpectedRequest => {
                ErrorType::Wait
            }
        }
    }

    /// Build the `<error/>` element with `urn:ietf:params:xml:ns:xmpp-stanzas` condition child.
    pub fn to_element(self, text: Option<&str>) -> Element {
        let mut err = Element::builder("error", "jabber:client")
            .attr("type", self.error_type().as_str())
            .attr("code", self.code().to_string())
            .build();
        let cond = Element::builder(self.condition(), "urn:ietf:params:xml:ns:xmpp-stanzas").build();
        err.append_child(cond);
        if let Some(text) = text {
            let text_el = Element::builder("text", "urn:ietf:params:xml:ns:xmpp-stanzas")
                .append(text)
                .build();
            err.append_child(text_el);
        }
        err
    }
}

/// Named stream-error conditions (RFC 6120 §4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    PolicyViolation,
    ResourceConstraint,
    SeeOtherHost(String),
    SystemShutdown,
    UnsupportedVersion,
    XmlNotWellFormed,
}

impl StreamError {
    /// The protocol condition name.
    pub fn condition(&self) -> &'static str {
        use StreamError::*;
        match self {
            BadFormat => "bad-format",
            BadNamespacePrefix => "bad-namespace-prefix",
            Conflict => "conflict",
            HostGone => "host-gone",
            HostUnknown => "host-unknown",
            ImproperAddressing => "improper-addressing",
            InternalServerError => "internal-server-error",
            InvalidFrom => "invalid-from",
            InvalidNamespace => "invalid-namespace",
            InvalidXml => "invalid-xml",
            NotAuthorized => "not-authorized",
            PolicyViolation => "policy-violation",
            ResourceConstraint => "resource-constraint",
            SeeOtherHost(_) => "see-other-host",
            SystemShutdown => "system-shutdown",
            UnsupportedVersion => "unsupported-version",
            XmlNotWellFormed => "xml-not-well-formed",
        }
    }

    /// Build the `<stream:error/>` element.
    pub fn to_element(&self) -> Element {
        let mut err = Element::bare("error", "http://etherx.jabber.org/streams");
        let cond = match self {
            StreamError::SeeOtherHost(host) => {
                Element::builder("see-other-host", "urn:ietf:params:xml:ns:xmpp-streams")
                    .append(host.as_str())
                    .build()
            }
            _ => Element::builder(self.condition(), "urn:ietf:params:xml:ns:xmpp-streams").build(),
        };
        err.append_child(cond);
        err
    }
}
