//! SASL security-layer abstraction.
//!
//! The engine never links against GSSAPI/SSPI itself; a mechanism
//! implementation is supplied by the caller through [`SecurityContext`] and
//! the engine drives it: `step` during the bind rounds, then `wrap`/`unwrap`
//! on every PDU once a seal is installed on the connection.

use crate::error::Result;

/// Security-layer option bits exchanged in the RFC 4752 capability token.
pub mod sec_layer {
    /// No security layer; bytes 1-3 of the token must be zero.
    pub const NONE: u8 = 0x01;
    /// Confidentiality (encryption, implies integrity).
    pub const CONFIDENTIALITY: u8 = 0x02;
    /// Integrity only (signing).
    pub const INTEGRITY: u8 = 0x04;
}

/// One SASL mechanism context (e.g. a GSSAPI context). Implementations wrap
/// the platform library; the engine only sees tokens and sealed buffers.
pub trait SecurityContext: Send + Sync {
    /// Advance the mechanism state machine: feed the server token (None for
    /// the initial round), get the next client token (None when nothing more
    /// is to be sent).
    fn step(&mut self, input: Option<&[u8]>) -> Result<Option<Vec<u8>>>;

    /// Seal one outgoing message. `confidential` selects encryption over
    /// signing-only.
    fn wrap(&self, data: &[u8], confidential: bool) -> Result<Vec<u8>>;

    /// Unseal one incoming frame (without its 4-byte length prefix).
    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Largest plaintext the mechanism can seal into one frame given the
    /// server's advertised maximum.
    fn max_wrap_size(&self, server_max: u32, confidential: bool) -> u32;

    fn integrity_available(&self) -> bool;

    fn confidentiality_available(&self) -> bool;

    /// True once the handshake rounds are finished and wrap/unwrap are usable.
    fn complete(&self) -> bool;
}
