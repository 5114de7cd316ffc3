//! Session state machine and request construction.
//!
//! A session tracks where the client is in the bind lifecycle and hands out
//! monotonically increasing message ids. Request builders check the current
//! state first and fail with [`LdapError::InvalidState`] before any bytes
//! are produced, so a misuse never reaches the network.

use crate::codec::{
    AddRequest, BindAuthentication, BindRequest, Control, ExtendedRequest, LdapMessage,
    ModifyChange, ModifyRequest, ProtocolOp, SearchRequest, STARTTLS_OID,
};
use crate::error::{LdapError, Result};

pub const LDAP_VERSION: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, nothing authenticated yet. Bind and StartTLS are allowed.
    BeforeOpen,
    /// A bind exchange is in flight. Re-entered on each SASL round.
    Binding,
    /// Bind succeeded; directory operations are allowed.
    Opened,
    /// Unbound or torn down. Terminal.
    Closed,
}

pub struct LdapSession {
    state: SessionState,
    next_message_id: i32,
}

impl Default for LdapSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LdapSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::BeforeOpen,
            next_message_id: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    fn require(&self, allowed: &[SessionState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LdapError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn message(
        &mut self,
        protocol_op: ProtocolOp,
        controls: Option<Vec<Control>>,
    ) -> LdapMessage {
        LdapMessage {
            message_id: self.next_id(),
            protocol_op,
            controls,
        }
    }

    /// Simple bind. Only allowed before the session is open.
    pub fn simple_bind(&mut self, name: &str, password: &str) -> Result<LdapMessage> {
        self.require(&[SessionState::BeforeOpen], "bind")?;
        self.state = SessionState::Binding;
        Ok(self.message(
            ProtocolOp::BindRequest(BindRequest {
                version: LDAP_VERSION,
                name: name.to_string(),
                authentication: BindAuthentication::Simple(password.to_string()),
            }),
            None,
        ))
    }

    /// One SASL bind round. Also allowed mid-`Binding` to continue the
    /// challenge/response exchange.
    pub fn sasl_bind(
        &mut self,
        mechanism: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<LdapMessage> {
        self.require(&[SessionState::BeforeOpen, SessionState::Binding], "bind")?;
        self.state = SessionState::Binding;
        Ok(self.message(
            ProtocolOp::BindRequest(BindRequest {
                version: LDAP_VERSION,
                name: String::new(),
                authentication: BindAuthentication::Sasl {
                    mechanism: mechanism.to_string(),
                    credentials,
                },
            }),
            None,
        ))
    }

    /// Record a bind response. Success opens the session; anything else,
    /// the in-progress code included, keeps it in `Binding`. Progression is
    /// monotonic: a failed bind never rewinds to `BeforeOpen`.
    pub fn bind_completed(&mut self, result_code: i32) {
        use crate::codec::result_code::SUCCESS;
        if self.state != SessionState::Binding {
            return;
        }
        if result_code == SUCCESS {
            self.state = SessionState::Opened;
        }
    }

    pub fn search(
        &mut self,
        request: SearchRequest,
        controls: Option<Vec<Control>>,
    ) -> Result<LdapMessage> {
        self.require(&[SessionState::Opened], "search")?;
        Ok(self.message(ProtocolOp::SearchRequest(request), controls))
    }

    pub fn add(
        &mut self,
        request: AddRequest,
        controls: Option<Vec<Control>>,
    ) -> Result<LdapMessage> {
        self.require(&[SessionState::Opened], "add")?;
        Ok(self.message(ProtocolOp::AddRequest(request), controls))
    }

    pub fn modify(
        &mut self,
        object: &str,
        changes: Vec<ModifyChange>,
        controls: Option<Vec<Control>>,
    ) -> Result<LdapMessage> {
        self.require(&[SessionState::Opened], "modify")?;
        Ok(self.message(
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: object.to_string(),
                changes,
            }),
            controls,
        ))
    }

    pub fn delete(&mut self, dn: &str, controls: Option<Vec<Control>>) -> Result<LdapMessage> {
        self.require(&[SessionState::Opened], "delete")?;
        Ok(self.message(ProtocolOp::DelRequest(dn.to_string()), controls))
    }

    pub fn modify_dn(
        &mut self,
        request: crate::codec::ModifyDnRequest,
        controls: Option<Vec<Control>>,
    ) -> Result<LdapMessage> {
        self.require(&[SessionState::Opened], "modify DN")?;
        Ok(self.message(ProtocolOp::ModifyDnRequest(request), controls))
    }

    /// Generic extended operation; requires an open session.
    pub fn extended(
        &mut self,
        request_name: &str,
        request_value: Option<Vec<u8>>,
    ) -> Result<LdapMessage> {
        self.require(&[SessionState::Opened], "extended operation")?;
        Ok(self.message(
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: request_name.to_string(),
                request_value,
            }),
            None,
        ))
    }

    /// StartTLS is the one extended operation that runs before bind: the
    /// upgrade has to precede credentials on the wire.
    pub fn start_tls_request(&mut self) -> Result<LdapMessage> {
        self.require(&[SessionState::BeforeOpen], "StartTLS")?;
        Ok(self.message(
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: STARTTLS_OID.to_string(),
                request_value: None,
            }),
            None,
        ))
    }

    /// Unbind has no response; the session is closed as soon as it is built.
    pub fn unbind(&mut self) -> Result<LdapMessage> {
        self.require(
            &[
                SessionState::BeforeOpen,
                SessionState::Binding,
                SessionState::Opened,
            ],
            "unbind",
        )?;
        self.state = SessionState::Closed;
        Ok(self.message(ProtocolOp::UnbindRequest, None))
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
