//! Error taxonomy for the protocol engine.
//!
//! Decode, transport and disconnect errors are broadcast to every pending
//! waiter on a connection; timeout and cancellation stay local to the caller
//! that asked for them. Non-success LDAP result codes are values carried in
//! responses, never errors.

use crate::session::SessionState;

/// Errors produced by the protocol engine. Clone is required so a single
/// connection failure can be handed to every pending waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LdapError {
    /// Malformed BER that cannot be resolved with more bytes. `raw` holds a
    /// preview of the offending PDU for diagnostics.
    #[error("BER decode error: {message}")]
    Decode {
        message: String,
        raw: Vec<u8>,
    },

    /// Socket or TLS I/O failure. Always fatal to the connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The wait deadline elapsed before a matching message arrived.
    #[error("operation timed out")]
    Timeout,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation attempted outside its required session state. Raised before
    /// any network I/O.
    #[error("cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// SASL negotiation failure, missing requested integrity/confidentiality,
    /// or a malformed security-layer capability token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server sent an unsolicited Notice of Disconnection. Escalated to a
    /// broadcast failure like a transport error.
    #[error("server sent notice of disconnection: {0}")]
    Disconnected(String),

    /// Bad configuration: unreadable file, invalid YAML, unusable URL or
    /// TLS material.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LdapError {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        LdapError::Decode {
            message: message.into(),
            raw: Vec::new(),
        }
    }

    /// True for error kinds that terminate the whole connection and are
    /// broadcast to every waiter.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LdapError::Decode { .. } | LdapError::Transport(_) | LdapError::Disconnected(_)
        )
    }
}

impl From<std::io::Error> for LdapError {
    fn from(e: std::io::Error) -> Self {
        LdapError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;
