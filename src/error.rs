//! Error taxonomy for the XMPP client core.
//!
//! Internal APIs return `Result<T, XmppError>` so callers (chiefly the
//! Session Supervisor) can match on error kind and decide whether to
//! auto-reconnect. `anyhow` is reserved for the binary boundary and for
//! persistence I/O where only context, not a specific kind, matters.

use std::fmt;

/// Every error kind named in the error handling design.
#[derive(Debug, Clone)]
pub enum XmppError {
    /// TCP or TLS setup failed before any stream was opened.
    ConnectionFailed(String),
    /// `RequireTLS` mode but the server's `stream:features` lacks `<starttls>`.
    TlsRequired,
    /// The TLS handshake itself failed after `<proceed/>`.
    TlsHandshakeFailed(String),
    /// `OpportunisticTLS` with only PLAIN offered and TLS not active.
    AuthenticationRequiresTLS,
    /// SASL `<failure>` element, or a malformed auth exchange.
    AuthenticationFailed(String),
    /// SCRAM server nonce did not extend the client nonce.
    ScramInvalidServerResponse,
    /// SCRAM ServerSignature mismatch on `<success>`.
    ScramServerSigMismatch,
    /// None of the mechanisms offered are supported.
    NoSupportedMechanism(Vec<String>),
    /// Post-open malformed stream, recovery exhausted.
    StreamError(String),
    /// Parse error before `stream_opened` was ever emitted.
    FatalParseError(String),
    /// Transport idle timer fired.
    IdleTimeout,
    /// XEP-0199 keepalive ping went unanswered.
    PingTimeout,
    /// JID failed validation before any I/O was attempted.
    InvalidJid(String),
    /// Transport operation attempted after `close()`.
    NotConnected,
}

impl XmppError {
    /// Whether the Session Supervisor should run its reconnection ladder
    /// for this error, vs. surfacing it as a permanent failure requiring
    /// user action. Mirrors the split in §7: transient vs. permanent.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            XmppError::TlsRequired
                | XmppError::AuthenticationFailed(_)
                | XmppError::AuthenticationRequiresTLS
                | XmppError::NoSupportedMechanism(_)
                | XmppError::InvalidJid(_)
                | XmppError::ScramInvalidServerResponse
                | XmppError::ScramServerSigMismatch
        )
    }
}

impl fmt::Display for XmppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XmppError::ConnectionFailed(d) => write!(f, "connection failed: {d}"),
            XmppError::TlsRequired => write!(f, "server does not offer STARTTLS but TLS is required"),
            XmppError::TlsHandshakeFailed(d) => write!(f, "TLS handshake failed: {d}"),
            XmppError::AuthenticationRequiresTLS => {
                write!(f, "server offers only PLAIN and TLS is not active")
            }
            XmppError::AuthenticationFailed(d) => write!(f, "authentication failed: {d}"),
            XmppError::ScramInvalidServerResponse => {
                write!(f, "SCRAM server response did not match client nonce")
            }
            XmppError::ScramServerSigMismatch => write!(f, "SCRAM server signature mismatch"),
            XmppError::NoSupportedMechanism(offered) => {
                write!(f, "no supported SASL mechanism in [{}]", offered.join(", "))
            }
            XmppError::StreamError(d) => write!(f, "stream error: {d}"),
            XmppError::FatalParseError(d) => write!(f, "fatal parse error: {d}"),
            XmppError::IdleTimeout => write!(f, "connection idle timeout"),
            XmppError::PingTimeout => write!(f, "keepalive ping timeout"),
            XmppError::InvalidJid(d) => write!(f, "invalid JID: {d}"),
            XmppError::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for XmppError {}

/// The reason a `disconnected` event carries. A subset of `XmppError`
/// plus user-initiated and server-initiated causes that are not errors.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// `disconnect()` was called by the Supervisor's own user-facing API.
    UserRequested,
    /// The server closed the stream with `<conflict/>` (another resource bound).
    Conflict,
    /// Any other fatal or transient cause.
    Error(XmppError),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserRequested => write!(f, "disconnected by user"),
            DisconnectReason::Conflict => write!(f, "replaced by a new connection"),
            DisconnectReason::Error(e) => write!(f, "{e}"),
        }
    }
}
