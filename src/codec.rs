//! LDAP v3 wire codec: BER encoding and decoding of client protocol messages.
//!
//! Decoding is stream-aware: [`try_decode`] peeks the outer SEQUENCE header
//! and reports "not enough data" instead of failing, so the connection can
//! keep accumulating bytes from the socket. Unknown trailing fields inside
//! any SEQUENCE are skipped via generic tag/length decode for forward
//! compatibility; an unknown protocol-op tag is a hard decode error.

use std::io::{Cursor, Read};

use crate::error::{LdapError, Result};

/// Simple paged results control (RFC 2696).
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
/// Active Directory: include deleted objects in search results.
pub const SHOW_DELETED_OID: &str = "1.2.840.113556.1.4.417";
/// Active Directory: include deactivated links in search results.
pub const SHOW_DEACTIVATED_LINK_OID: &str = "1.2.840.113556.1.4.2065";
/// WhoAmI extended operation (RFC 4532).
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
/// StartTLS extended operation (RFC 4511).
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// Unsolicited Notice of Disconnection (RFC 4511 §4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// LDAP result codes used by the engine. The full registry lives in RFC 4511
/// appendix A; only the codes the client inspects are named here.
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const OPERATIONS_ERROR: i32 = 1;
    pub const PROTOCOL_ERROR: i32 = 2;
    pub const SIZE_LIMIT_EXCEEDED: i32 = 4;
    pub const REFERRAL: i32 = 10;
    pub const SASL_BIND_IN_PROGRESS: i32 = 14;
    pub const INVALID_CREDENTIALS: i32 = 49;
    pub const UNAVAILABLE: i32 = 52;
    pub const UNWILLING_TO_PERFORM: i32 = 53;
}

// Application-class protocol-op tags.
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF Control at the LDAPMessage level.
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// Context [10] primitive at the LDAPMessage level: vendor extension carrying
/// the Notice of Disconnection OID outside the protocol op.
const LDAP_CONTEXT_DISCONNECT_NOTICE: u8 = 0x8A;

const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// One LDAP PDU: message id, protocol op, optional controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    SearchResultReference(Vec<String>),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(String),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

/// LDAPResult embedded in every response variant. Non-success codes are
/// carried here as values so callers can inspect matched DN, diagnostics and
/// referrals without catching errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Option<Vec<String>>,
}

impl LdapResult {
    pub fn is_success(&self) -> bool {
        self.result_code == result_code::SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    /// [7] serverSaslCreds: server challenge/token for multi-round SASL.
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: SearchFilter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = LdapError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::decode(format!("invalid search scope: {}", value))),
        }
    }
}

/// Structural search filter (RFC 4511 §4.5.1). The client builds these; the
/// decoder exists so captured requests round-trip in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    And(Vec<SearchFilter>),
    Or(Vec<SearchFilter>),
    Not(Box<SearchFilter>),
    Equality(String, Vec<u8>),
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        r#final: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<u8> for ModifyOperation {
    type Error = LdapError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            _ => Err(LdapError::decode(format!("invalid modify operation: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    /// True when this is the server's unsolicited disconnect notice.
    pub fn is_disconnect_notice(&self) -> bool {
        self.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID)
    }
}

/// Request control. Known OIDs decode their value eagerly; everything else
/// keeps the raw value bytes so criticality is still emitted faithfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    ShowDeleted {
        criticality: bool,
    },
    ShowDeactivatedLink {
        criticality: bool,
    },
    PagedResults {
        criticality: bool,
        size: i32,
        cookie: Vec<u8>,
    },
    Other {
        oid: String,
        criticality: bool,
        value: Option<Vec<u8>>,
    },
}

impl Control {
    pub fn oid(&self) -> &str {
        match self {
            Control::ShowDeleted { .. } => SHOW_DELETED_OID,
            Control::ShowDeactivatedLink { .. } => SHOW_DEACTIVATED_LINK_OID,
            Control::PagedResults { .. } => PAGED_RESULTS_OID,
            Control::Other { oid, .. } => oid,
        }
    }

    pub fn criticality(&self) -> bool {
        match self {
            Control::ShowDeleted { criticality }
            | Control::ShowDeactivatedLink { criticality }
            | Control::PagedResults { criticality, .. }
            | Control::Other { criticality, .. } => *criticality,
        }
    }
}

// ---------------------------------------------------------------------------
// BER reading
// ---------------------------------------------------------------------------

pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn pos(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.pos())
    }

    fn peek_tag(&self) -> Result<u8> {
        self.cursor
            .get_ref()
            .get(self.pos())
            .copied()
            .ok_or_else(|| LdapError::decode("unexpected end of element"))
    }

    fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| LdapError::decode("unexpected end while reading tag"))?;
        Ok(buf[0])
    }

    fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| LdapError::decode("unexpected end while reading length"))?;
        let first = buf[0];
        if (first & 0x80) == 0 {
            return Ok(first as usize);
        }
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(LdapError::decode("indefinite length not supported"));
        }
        if length_bytes > 4 {
            return Err(LdapError::decode(format!(
                "length encoding too large: {} bytes",
                length_bytes
            )));
        }
        if self.remaining() < length_bytes {
            return Err(LdapError::decode("truncated long-form length"));
        }
        let mut length = 0usize;
        for _ in 0..length_bytes {
            self.cursor
                .read_exact(&mut buf)
                .map_err(|_| LdapError::decode("truncated long-form length"))?;
            length = (length << 8) | buf[0] as usize;
        }
        Ok(length)
    }

    /// Read a length and return the absolute end position of the value,
    /// checking it fits in the input.
    fn read_value_end(&mut self) -> Result<usize> {
        let length = self.read_length()?;
        let end = self.pos() + length;
        if end > self.cursor.get_ref().len() {
            return Err(LdapError::decode(format!(
                "element length {} overruns input",
                length
            )));
        }
        Ok(end)
    }

    /// Expect a specific tag, returning the end position of its value.
    fn expect_container(&mut self, tag: u8, what: &str) -> Result<usize> {
        let got = self.read_tag()?;
        if got != tag {
            return Err(LdapError::decode(format!(
                "expected {} (0x{:02X}), got 0x{:02X}",
                what, tag, got
            )));
        }
        self.read_value_end()
    }

    fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            return Err(LdapError::decode(format!(
                "truncated value: need {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let mut buf = vec![0u8; n];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| LdapError::decode("truncated value"))?;
        Ok(buf)
    }

    /// Shared body reader for INTEGER and ENUMERATED.
    fn read_int_body(&mut self) -> Result<i32> {
        let end = self.read_value_end()?;
        let length = end - self.pos();
        if length == 0 || length > 4 {
            return Err(LdapError::decode(format!("integer of {} bytes", length)));
        }
        let buf = self.read_raw_bytes(length)?;
        let mut value = 0i32;
        for &byte in &buf {
            value = (value << 8) | byte as i32;
        }
        if length < 4 && (buf[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }
        Ok(value)
    }

    fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if tag != 0x02 {
            return Err(LdapError::decode(format!(
                "expected INTEGER (0x02), got 0x{:02X}",
                tag
            )));
        }
        self.read_int_body()
    }

    fn read_enumerated(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if tag != 0x0A {
            return Err(LdapError::decode(format!(
                "expected ENUMERATED (0x0A), got 0x{:02X}",
                tag
            )));
        }
        self.read_int_body()
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if tag != 0x01 {
            return Err(LdapError::decode(format!(
                "expected BOOLEAN (0x01), got 0x{:02X}",
                tag
            )));
        }
        let end = self.read_value_end()?;
        let buf = self.read_raw_bytes(end - self.pos())?;
        Ok(!buf.is_empty() && buf[0] != 0)
    }

    /// Length + value with the tag already consumed (for IMPLICIT context tags).
    fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let end = self.read_value_end()?;
        self.read_raw_bytes(end - self.pos())
    }

    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        if tag != 0x04 {
            return Err(LdapError::decode(format!(
                "expected OCTET STRING (0x04), got 0x{:02X}",
                tag
            )));
        }
        self.read_octet_string_value()
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).map_err(|_| LdapError::decode("invalid UTF-8 string"))
    }

    /// Skip forward to `end`, consuming any unknown trailing elements.
    fn skip_to(&mut self, end: usize) -> Result<()> {
        if end < self.pos() {
            return Err(LdapError::decode("nested element overruns its container"));
        }
        self.cursor.set_position(end as u64);
        Ok(())
    }

    /// Generic tag/length skip of one element (forward compatibility).
    fn skip_element(&mut self) -> Result<()> {
        let _tag = self.read_tag()?;
        let end = self.read_value_end()?;
        self.skip_to(end)
    }
}

// ---------------------------------------------------------------------------
// BER writing
// ---------------------------------------------------------------------------

pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buffer.push(length as u8);
        } else {
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    /// Minimal two's-complement body shared by INTEGER and ENUMERATED.
    fn write_tagged_int(&mut self, tag: u8, value: i32) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let lead = bytes[start];
            let next_high = bytes[start + 1] & 0x80;
            if (lead == 0x00 && next_high == 0) || (lead == 0xFF && next_high != 0) {
                start += 1;
            } else {
                break;
            }
        }
        self.write_tag(tag);
        self.write_length(4 - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged_int(0x02, value);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tagged_int(0x0A, value);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged_bytes(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// Primitive element with an arbitrary (usually context) tag.
    pub fn write_tagged_bytes(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    /// Open a constructed element; returns the position to pass to [`end`].
    pub fn begin(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch the length of a constructed element opened with [`begin`].
    pub fn end(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buffer.insert(pos + 1 + i, *b);
            }
        }
    }

    pub fn begin_sequence(&mut self) -> usize {
        self.begin(LDAP_MESSAGE_SEQUENCE_TAG)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize one LDAPMessage to its BER bytes.
pub fn encode_ldap_message(message: &LdapMessage) -> Vec<u8> {
    let mut w = BerWriter::new();
    let seq = w.begin_sequence();
    w.write_integer(message.message_id);
    encode_protocol_op(&mut w, &message.protocol_op);
    if let Some(ref controls) = message.controls {
        let ctrls = w.begin(LDAP_CONTEXT_CONTROLS);
        for control in controls {
            encode_control(&mut w, control);
        }
        w.end(ctrls);
    }
    w.end(seq);
    w.into_vec()
}

fn encode_protocol_op(w: &mut BerWriter, op: &ProtocolOp) {
    match op {
        ProtocolOp::BindRequest(req) => {
            let p = w.begin(LDAP_TAG_BIND_REQUEST);
            w.write_integer(req.version);
            w.write_string(&req.name);
            match &req.authentication {
                BindAuthentication::Simple(password) => {
                    w.write_tagged_bytes(0x80, password.as_bytes());
                }
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                } => {
                    let sasl = w.begin(0xA3);
                    w.write_string(mechanism);
                    if let Some(creds) = credentials {
                        w.write_octet_string(creds);
                    }
                    w.end(sasl);
                }
            }
            w.end(p);
        }
        ProtocolOp::BindResponse(resp) => {
            let p = w.begin(LDAP_TAG_BIND_RESPONSE);
            encode_ldap_result(w, &resp.result);
            if let Some(ref creds) = resp.server_sasl_creds {
                w.write_tagged_bytes(0x87, creds);
            }
            w.end(p);
        }
        ProtocolOp::UnbindRequest => {
            let p = w.begin(LDAP_TAG_UNBIND_REQUEST);
            w.end(p);
        }
        ProtocolOp::SearchRequest(req) => {
            let p = w.begin(LDAP_TAG_SEARCH_REQUEST);
            w.write_string(&req.base_object);
            w.write_enumerated(req.scope as i32);
            w.write_enumerated(req.deref_aliases);
            w.write_integer(req.size_limit);
            w.write_integer(req.time_limit);
            w.write_boolean(req.types_only);
            encode_filter(w, &req.filter);
            let attrs = w.begin_sequence();
            for attr in &req.attributes {
                w.write_string(attr);
            }
            w.end(attrs);
            w.end(p);
        }
        ProtocolOp::SearchResultEntry(entry) => {
            let p = w.begin(LDAP_TAG_SEARCH_RESULT_ENTRY);
            w.write_string(&entry.object_name);
            let attrs = w.begin_sequence();
            for attr in &entry.attributes {
                encode_attribute(w, attr);
            }
            w.end(attrs);
            w.end(p);
        }
        ProtocolOp::SearchResultDone(result) => {
            let p = w.begin(LDAP_TAG_SEARCH_RESULT_DONE);
            encode_ldap_result(w, result);
            w.end(p);
        }
        ProtocolOp::SearchResultReference(uris) => {
            let p = w.begin(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                w.write_string(uri);
            }
            w.end(p);
        }
        ProtocolOp::ModifyRequest(req) => {
            let p = w.begin(LDAP_TAG_MODIFY_REQUEST);
            w.write_string(&req.object);
            let changes = w.begin_sequence();
            for change in &req.changes {
                let c = w.begin_sequence();
                w.write_enumerated(change.operation as i32);
                encode_attribute(w, &change.modification);
                w.end(c);
            }
            w.end(changes);
            w.end(p);
        }
        ProtocolOp::ModifyResponse(result) => {
            let p = w.begin(LDAP_TAG_MODIFY_RESPONSE);
            encode_ldap_result(w, result);
            w.end(p);
        }
        ProtocolOp::AddRequest(req) => {
            let p = w.begin(LDAP_TAG_ADD_REQUEST);
            w.write_string(&req.entry);
            let attrs = w.begin_sequence();
            for attr in &req.attributes {
                encode_attribute(w, attr);
            }
            w.end(attrs);
            w.end(p);
        }
        ProtocolOp::AddResponse(result) => {
            let p = w.begin(LDAP_TAG_ADD_RESPONSE);
            encode_ldap_result(w, result);
            w.end(p);
        }
        ProtocolOp::DelRequest(dn) => {
            // [APPLICATION 10] IMPLICIT LDAPDN: primitive, DN bytes are the value.
            w.write_tagged_bytes(LDAP_TAG_DEL_REQUEST, dn.as_bytes());
        }
        ProtocolOp::DelResponse(result) => {
            let p = w.begin(LDAP_TAG_DEL_RESPONSE);
            encode_ldap_result(w, result);
            w.end(p);
        }
        ProtocolOp::ModifyDnRequest(req) => {
            let p = w.begin(LDAP_TAG_MODIFY_DN_REQUEST);
            w.write_string(&req.entry);
            w.write_string(&req.new_rdn);
            w.write_boolean(req.delete_old_rdn);
            if let Some(ref superior) = req.new_superior {
                w.write_tagged_bytes(0x80, superior.as_bytes());
            }
            w.end(p);
        }
        ProtocolOp::ModifyDnResponse(result) => {
            let p = w.begin(LDAP_TAG_MODIFY_DN_RESPONSE);
            encode_ldap_result(w, result);
            w.end(p);
        }
        ProtocolOp::ExtendedRequest(req) => {
            let p = w.begin(LDAP_TAG_EXTENDED_REQUEST);
            w.write_tagged_bytes(0x80, req.request_name.as_bytes());
            if let Some(ref value) = req.request_value {
                w.write_tagged_bytes(0x81, value);
            }
            w.end(p);
        }
        ProtocolOp::ExtendedResponse(resp) => {
            let p = w.begin(LDAP_TAG_EXTENDED_RESPONSE);
            encode_ldap_result(w, &resp.result);
            if let Some(ref name) = resp.response_name {
                w.write_tagged_bytes(0x8A, name.as_bytes());
            }
            if let Some(ref value) = resp.response_value {
                w.write_tagged_bytes(0x8B, value);
            }
            w.end(p);
        }
    }
}

fn encode_ldap_result(w: &mut BerWriter, result: &LdapResult) {
    w.write_enumerated(result.result_code);
    w.write_string(&result.matched_dn);
    w.write_string(&result.diagnostic_message);
    if let Some(ref referrals) = result.referrals {
        let refs = w.begin(0xA3);
        for url in referrals {
            w.write_string(url);
        }
        w.end(refs);
    }
}

fn encode_attribute(w: &mut BerWriter, attr: &Attribute) {
    let seq = w.begin_sequence();
    w.write_string(&attr.attr_type);
    let vals = w.begin(0x31); // SET OF AttributeValue
    for value in &attr.attr_values {
        w.write_octet_string(value);
    }
    w.end(vals);
    w.end(seq);
}

fn encode_filter(w: &mut BerWriter, filter: &SearchFilter) {
    match filter {
        SearchFilter::And(parts) => {
            let p = w.begin(0xA0);
            for part in parts {
                encode_filter(w, part);
            }
            w.end(p);
        }
        SearchFilter::Or(parts) => {
            let p = w.begin(0xA1);
            for part in parts {
                encode_filter(w, part);
            }
            w.end(p);
        }
        SearchFilter::Not(inner) => {
            let p = w.begin(0xA2);
            encode_filter(w, inner);
            w.end(p);
        }
        SearchFilter::Equality(attr, value) => encode_ava(w, 0xA3, attr, value),
        SearchFilter::GreaterOrEqual(attr, value) => encode_ava(w, 0xA5, attr, value),
        SearchFilter::LessOrEqual(attr, value) => encode_ava(w, 0xA6, attr, value),
        SearchFilter::Substrings {
            attribute,
            initial,
            any,
            r#final,
        } => {
            let p = w.begin(0xA4);
            w.write_string(attribute);
            let subs = w.begin_sequence();
            if let Some(ref i) = initial {
                w.write_tagged_bytes(0x80, i);
            }
            for a in any {
                w.write_tagged_bytes(0x81, a);
            }
            if let Some(ref f) = r#final {
                w.write_tagged_bytes(0x82, f);
            }
            w.end(subs);
            w.end(p);
        }
        SearchFilter::Present(attr) => {
            w.write_tagged_bytes(0x87, attr.as_bytes());
        }
    }
}

fn encode_ava(w: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let p = w.begin(tag);
    w.write_string(attr);
    w.write_octet_string(value);
    w.end(p);
}

fn encode_control(w: &mut BerWriter, control: &Control) {
    let seq = w.begin_sequence();
    w.write_string(control.oid());
    // BOOLEAN DEFAULT FALSE: only emitted when true.
    if control.criticality() {
        w.write_boolean(true);
    }
    match control {
        Control::ShowDeleted { .. } | Control::ShowDeactivatedLink { .. } => {}
        Control::PagedResults { size, cookie, .. } => {
            let mut inner = BerWriter::new();
            let v = inner.begin_sequence();
            inner.write_integer(*size);
            inner.write_octet_string(cookie);
            inner.end(v);
            w.write_octet_string(&inner.into_vec());
        }
        Control::Other { value, .. } => {
            if let Some(v) = value {
                w.write_octet_string(v);
            }
        }
    }
    w.end(seq);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Try to decode one LDAPMessage from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete PDU
/// (insufficient data, zero bytes consumed). On success returns the message
/// and the exact number of bytes it occupied. A decode error carries a
/// preview of the offending bytes.
pub fn try_decode(buf: &[u8]) -> Result<Option<(LdapMessage, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        return Err(decode_with_raw(
            format!(
                "expected LDAPMessage SEQUENCE (0x30), got 0x{:02X}",
                buf[0]
            ),
            buf,
        ));
    }
    let len_byte = buf[1];
    let total = if (len_byte & 0x80) == 0 {
        2 + len_byte as usize
    } else {
        let length_bytes = (len_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            return Err(decode_with_raw("invalid outer length encoding", buf));
        }
        if buf.len() < 2 + length_bytes {
            return Ok(None);
        }
        let mut length = 0usize;
        for i in 0..length_bytes {
            length = (length << 8) | buf[2 + i] as usize;
        }
        2 + length_bytes + length
    };
    if buf.len() < total {
        return Ok(None);
    }
    let slice = &buf[..total];
    match parse_ldap_message(slice) {
        Ok(message) => Ok(Some((message, total))),
        Err(LdapError::Decode { message, .. }) => Err(decode_with_raw(message, slice)),
        Err(e) => Err(e),
    }
}

fn decode_with_raw(message: impl Into<String>, raw: &[u8]) -> LdapError {
    LdapError::Decode {
        message: message.into(),
        raw: raw[..raw.len().min(64)].to_vec(),
    }
}

/// Parse one complete LDAPMessage from `data` (all bytes must be present).
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut r = BerReader::new(data);
    let msg_end = r.expect_container(LDAP_MESSAGE_SEQUENCE_TAG, "LDAPMessage SEQUENCE")?;
    let message_id = r.read_integer()?;

    let tag = r.read_tag()?;
    let op_end = r.read_value_end()?;
    let mut protocol_op = parse_protocol_op(&mut r, tag, op_end)?;
    r.skip_to(op_end)?;

    let mut controls = None;
    if r.pos() < msg_end && r.peek_tag()? == LDAP_CONTEXT_CONTROLS {
        controls = Some(parse_controls(&mut r)?);
    }
    // Vendor extension: [10] at the message level carries the disconnect
    // notice OID; merge it into an extended response's name.
    if r.pos() < msg_end && r.peek_tag()? == LDAP_CONTEXT_DISCONNECT_NOTICE {
        r.read_tag()?;
        let bytes = r.read_octet_string_value()?;
        if let ProtocolOp::ExtendedResponse(ref mut resp) = protocol_op {
            if resp.response_name.is_none() {
                resp.response_name =
                    Some(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
    }
    r.skip_to(msg_end)?;

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

fn parse_protocol_op(r: &mut BerReader, tag: u8, end: usize) -> Result<ProtocolOp> {
    match tag {
        LDAP_TAG_BIND_REQUEST => Ok(ProtocolOp::BindRequest(parse_bind_request(r, end)?)),
        LDAP_TAG_BIND_RESPONSE => Ok(ProtocolOp::BindResponse(parse_bind_response(r, end)?)),
        LDAP_TAG_UNBIND_REQUEST => Ok(ProtocolOp::UnbindRequest),
        LDAP_TAG_SEARCH_REQUEST => Ok(ProtocolOp::SearchRequest(parse_search_request(r, end)?)),
        LDAP_TAG_SEARCH_RESULT_ENTRY => Ok(ProtocolOp::SearchResultEntry(
            parse_search_result_entry(r, end)?,
        )),
        LDAP_TAG_SEARCH_RESULT_DONE => {
            Ok(ProtocolOp::SearchResultDone(parse_ldap_result(r, end)?))
        }
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            let mut uris = Vec::new();
            while r.pos() < end {
                uris.push(r.read_string()?);
            }
            Ok(ProtocolOp::SearchResultReference(uris))
        }
        LDAP_TAG_MODIFY_REQUEST => Ok(ProtocolOp::ModifyRequest(parse_modify_request(r, end)?)),
        LDAP_TAG_MODIFY_RESPONSE => Ok(ProtocolOp::ModifyResponse(parse_ldap_result(r, end)?)),
        LDAP_TAG_ADD_REQUEST => Ok(ProtocolOp::AddRequest(parse_add_request(r, end)?)),
        LDAP_TAG_ADD_RESPONSE => Ok(ProtocolOp::AddResponse(parse_ldap_result(r, end)?)),
        LDAP_TAG_DEL_REQUEST => {
            let bytes = r.read_raw_bytes(end - r.pos())?;
            let dn = String::from_utf8(bytes)
                .map_err(|_| LdapError::decode("invalid UTF-8 in DelRequest DN"))?;
            Ok(ProtocolOp::DelRequest(dn))
        }
        LDAP_TAG_DEL_RESPONSE => Ok(ProtocolOp::DelResponse(parse_ldap_result(r, end)?)),
        LDAP_TAG_MODIFY_DN_REQUEST => Ok(ProtocolOp::ModifyDnRequest(parse_modify_dn_request(
            r, end,
        )?)),
        LDAP_TAG_MODIFY_DN_RESPONSE => {
            Ok(ProtocolOp::ModifyDnResponse(parse_ldap_result(r, end)?))
        }
        LDAP_TAG_EXTENDED_REQUEST => Ok(ProtocolOp::ExtendedRequest(parse_extended_request(
            r, end,
        )?)),
        LDAP_TAG_EXTENDED_RESPONSE => Ok(ProtocolOp::ExtendedResponse(parse_extended_response(
            r, end,
        )?)),
        _ => Err(LdapError::decode(format!(
            "unknown protocol-op tag 0x{:02X}",
            tag
        ))),
    }
}

fn parse_ldap_result(r: &mut BerReader, end: usize) -> Result<LdapResult> {
    let result_code = r.read_enumerated()?;
    let matched_dn = r.read_string()?;
    let diagnostic_message = r.read_string()?;
    let mut referrals = None;
    if r.pos() < end && r.peek_tag()? == 0xA3 {
        r.read_tag()?;
        let refs_end = r.read_value_end()?;
        let mut urls = Vec::new();
        while r.pos() < refs_end {
            urls.push(r.read_string()?);
        }
        referrals = Some(urls);
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn parse_bind_request(r: &mut BerReader, _end: usize) -> Result<BindRequest> {
    let version = r.read_integer()?;
    let name = r.read_string()?;
    let auth_tag = r.read_tag()?;
    let authentication = match auth_tag {
        0x80 => {
            let password = r.read_octet_string_value()?;
            BindAuthentication::Simple(
                String::from_utf8(password)
                    .map_err(|_| LdapError::decode("invalid UTF-8 in simple credentials"))?,
            )
        }
        0xA3 => {
            let sasl_end = r.read_value_end()?;
            let mechanism = r.read_string()?;
            let credentials = if r.pos() < sasl_end {
                Some(r.read_octet_string()?)
            } else {
                None
            };
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        other => {
            return Err(LdapError::decode(format!(
                "unsupported bind authentication tag 0x{:02X}",
                other
            )))
        }
    };
    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(r: &mut BerReader, end: usize) -> Result<BindResponse> {
    let result = parse_ldap_result(r, end)?;
    let mut server_sasl_creds = None;
    if r.pos() < end && r.peek_tag()? == 0x87 {
        r.read_tag()?;
        server_sasl_creds = Some(r.read_octet_string_value()?);
    }
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn parse_search_request(r: &mut BerReader, _end: usize) -> Result<SearchRequest> {
    let base_object = r.read_string()?;
    let scope = SearchScope::try_from(r.read_enumerated()? as u8)?;
    let deref_aliases = r.read_enumerated()?;
    let size_limit = r.read_integer()?;
    let time_limit = r.read_integer()?;
    let types_only = r.read_boolean()?;
    let filter = parse_filter(r)?;
    let attrs_end = r.expect_container(0x30, "attribute list SEQUENCE")?;
    let mut attributes = Vec::new();
    while r.pos() < attrs_end {
        attributes.push(r.read_string()?);
    }
    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_filter(r: &mut BerReader) -> Result<SearchFilter> {
    let tag = r.read_tag()?;
    match tag {
        0xA0 | 0xA1 => {
            let end = r.read_value_end()?;
            let mut parts = Vec::new();
            while r.pos() < end {
                parts.push(parse_filter(r)?);
            }
            if tag == 0xA0 {
                Ok(SearchFilter::And(parts))
            } else {
                Ok(SearchFilter::Or(parts))
            }
        }
        0xA2 => {
            let _end = r.read_value_end()?;
            Ok(SearchFilter::Not(Box::new(parse_filter(r)?)))
        }
        0xA3 | 0xA5 | 0xA6 => {
            let _end = r.read_value_end()?;
            let attr = r.read_string()?;
            let value = r.read_octet_string()?;
            Ok(match tag {
                0xA3 => SearchFilter::Equality(attr, value),
                0xA5 => SearchFilter::GreaterOrEqual(attr, value),
                _ => SearchFilter::LessOrEqual(attr, value),
            })
        }
        0xA4 => {
            let _end = r.read_value_end()?;
            let attribute = r.read_string()?;
            let subs_end = r.expect_container(0x30, "substrings SEQUENCE")?;
            let mut initial = None;
            let mut any = Vec::new();
            let mut fin = None;
            while r.pos() < subs_end {
                let sub_tag = r.read_tag()?;
                let value = r.read_octet_string_value()?;
                match sub_tag {
                    0x80 => initial = Some(value),
                    0x81 => any.push(value),
                    0x82 => fin = Some(value),
                    other => {
                        return Err(LdapError::decode(format!(
                            "unknown substring tag 0x{:02X}",
                            other
                        )))
                    }
                }
            }
            Ok(SearchFilter::Substrings {
                attribute,
                initial,
                any,
                r#final: fin,
            })
        }
        0x87 => {
            let bytes = r.read_octet_string_value()?;
            let attr = String::from_utf8(bytes)
                .map_err(|_| LdapError::decode("invalid UTF-8 in present filter"))?;
            Ok(SearchFilter::Present(attr))
        }
        other => Err(LdapError::decode(format!(
            "unsupported filter tag 0x{:02X}",
            other
        ))),
    }
}

fn parse_search_result_entry(r: &mut BerReader, _end: usize) -> Result<SearchResultEntry> {
    let object_name = r.read_string()?;
    let attrs_end = r.expect_container(0x30, "attributes SEQUENCE")?;
    let mut attributes = Vec::new();
    while r.pos() < attrs_end {
        attributes.push(parse_attribute(r)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_attribute(r: &mut BerReader) -> Result<Attribute> {
    let attr_end = r.expect_container(0x30, "attribute SEQUENCE")?;
    let attr_type = r.read_string()?;
    // SET OF per RFC 4511; some servers emit SEQUENCE here, accept both.
    let vals_tag = r.read_tag()?;
    if vals_tag != 0x31 && vals_tag != 0x30 {
        return Err(LdapError::decode(format!(
            "expected attribute value SET (0x31), got 0x{:02X}",
            vals_tag
        )));
    }
    let vals_end = r.read_value_end()?;
    let mut attr_values = Vec::new();
    while r.pos() < vals_end {
        attr_values.push(r.read_octet_string()?);
    }
    r.skip_to(attr_end)?;
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

fn parse_modify_request(r: &mut BerReader, _end: usize) -> Result<ModifyRequest> {
    let object = r.read_string()?;
    let changes_end = r.expect_container(0x30, "changes SEQUENCE")?;
    let mut changes = Vec::new();
    while r.pos() < changes_end {
        let change_end = r.expect_container(0x30, "change SEQUENCE")?;
        let operation = ModifyOperation::try_from(r.read_enumerated()? as u8)?;
        let modification = parse_attribute(r)?;
        r.skip_to(change_end)?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }
    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(r: &mut BerReader, _end: usize) -> Result<AddRequest> {
    let entry = r.read_string()?;
    let attrs_end = r.expect_container(0x30, "attributes SEQUENCE")?;
    let mut attributes = Vec::new();
    while r.pos() < attrs_end {
        attributes.push(parse_attribute(r)?);
    }
    Ok(AddRequest { entry, attributes })
}

fn parse_modify_dn_request(r: &mut BerReader, end: usize) -> Result<ModifyDnRequest> {
    let entry = r.read_string()?;
    let new_rdn = r.read_string()?;
    let delete_old_rdn = r.read_boolean()?;
    let mut new_superior = None;
    if r.pos() < end && r.peek_tag()? == 0x80 {
        r.read_tag()?;
        let bytes = r.read_octet_string_value()?;
        new_superior = Some(
            String::from_utf8(bytes)
                .map_err(|_| LdapError::decode("invalid UTF-8 in newSuperior"))?,
        );
    }
    Ok(ModifyDnRequest {
        entry,
        new_rdn,
        delete_old_rdn,
        new_superior,
    })
}

fn parse_extended_request(r: &mut BerReader, end: usize) -> Result<ExtendedRequest> {
    let name_tag = r.read_tag()?;
    if name_tag != 0x80 {
        return Err(LdapError::decode(format!(
            "expected requestName [0], got 0x{:02X}",
            name_tag
        )));
    }
    let name_bytes = r.read_octet_string_value()?;
    let request_name = String::from_utf8(name_bytes)
        .map_err(|_| LdapError::decode("invalid UTF-8 in requestName"))?;
    let mut request_value = None;
    if r.pos() < end && r.peek_tag()? == 0x81 {
        r.read_tag()?;
        request_value = Some(r.read_octet_string_value()?);
    }
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(r: &mut BerReader, end: usize) -> Result<ExtendedResponse> {
    let result = parse_ldap_result(r, end)?;
    let mut response_name = None;
    let mut response_value = None;
    while r.pos() < end {
        match r.peek_tag()? {
            0x8A => {
                r.read_tag()?;
                let bytes = r.read_octet_string_value()?;
                response_name = Some(
                    String::from_utf8(bytes)
                        .map_err(|_| LdapError::decode("invalid UTF-8 in responseName"))?,
                );
            }
            0x8B => {
                r.read_tag()?;
                response_value = Some(r.read_octet_string_value()?);
            }
            _ => r.skip_element()?,
        }
    }
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn parse_controls(r: &mut BerReader) -> Result<Vec<Control>> {
    let end = r.expect_container(LDAP_CONTEXT_CONTROLS, "controls [0]")?;
    let mut controls = Vec::new();
    while r.pos() < end {
        let ctrl_end = r.expect_container(0x30, "control SEQUENCE")?;
        let oid = r.read_string()?;
        let mut criticality = false;
        let mut value = None;
        if r.pos() < ctrl_end && r.peek_tag()? == 0x01 {
            criticality = r.read_boolean()?;
        }
        if r.pos() < ctrl_end && r.peek_tag()? == 0x04 {
            value = Some(r.read_octet_string()?);
        }
        r.skip_to(ctrl_end)?;
        controls.push(decode_control(oid, criticality, value)?);
    }
    Ok(controls)
}

/// Known control OIDs decode their value eagerly; unknown OIDs keep raw bytes.
fn decode_control(oid: String, criticality: bool, value: Option<Vec<u8>>) -> Result<Control> {
    match oid.as_str() {
        SHOW_DELETED_OID => Ok(Control::ShowDeleted { criticality }),
        SHOW_DEACTIVATED_LINK_OID => Ok(Control::ShowDeactivatedLink { criticality }),
        PAGED_RESULTS_OID => {
            let bytes = value
                .ok_or_else(|| LdapError::decode("paged results control missing value"))?;
            let mut r = BerReader::new(&bytes);
            let _end = r.expect_container(0x30, "paged results value SEQUENCE")?;
            let size = r.read_integer()?;
            let cookie = r.read_octet_string()?;
            Ok(Control::PagedResults {
                criticality,
                size,
                cookie,
            })
        }
        _ => Ok(Control::Other {
            oid,
            criticality,
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: LdapMessage) {
        let encoded = encode_ldap_message(&message);
        let (decoded, consumed) = try_decode(&encoded)
            .expect("decode failed")
            .expect("message should be complete");
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, message);
    }

    fn sample_result(code: i32) -> LdapResult {
        LdapResult {
            result_code: code,
            matched_dn: "ou=x,dc=example,dc=com".to_string(),
            diagnostic_message: "diag".to_string(),
            referrals: None,
        }
    }

    /// Simple bind per RFC 4511: [APPLICATION 0] { version 3, name, [0] pw }.
    /// Byte layout checked against a capture of the same request.
    #[test]
    fn simple_bind_request_wire_layout() {
        let message = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=admin,dc=example,dc=com".to_string(),
                authentication: BindAuthentication::Simple("secret".to_string()),
            }),
            controls: None,
        };
        let expected = vec![
            0x30, 0x2c, // SEQUENCE length 44
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x27, // [APPLICATION 0] BindRequest length 39
            0x02, 0x01, 0x03, // version 3
            0x04, 0x1a, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63,
            0x3d, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63,
            0x6f, 0x6d, // name
            0x80, 0x06, 0x73, 0x65, 0x63, 0x72, 0x65, 0x74, // [0] "secret"
        ];
        assert_eq!(encode_ldap_message(&message), expected);

        let parsed = parse_ldap_message(&expected).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn simple_bind_request_components() {
        let message = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=user,dc=example,dc=com".to_string(),
                authentication: BindAuthentication::Simple("pw".to_string()),
            }),
            controls: None,
        };
        let encoded = encode_ldap_message(&message);
        assert_eq!(encoded[0], 0x30);
        // messageID then the application-0 op.
        assert_eq!(&encoded[2..5], &[0x02, 0x01, 0x01]);
        assert_eq!(encoded[5], LDAP_TAG_BIND_REQUEST);
        assert_eq!(&encoded[7..10], &[0x02, 0x01, 0x03]); // INTEGER version 3
        assert_eq!(encoded[10], 0x04); // OCTET STRING name
        let pw_at = encoded.len() - 4;
        assert_eq!(encoded[pw_at], 0x80); // context-tag-0 password
        assert_eq!(&encoded[pw_at + 2..], b"pw");
        roundtrip(message);
    }

    #[test]
    fn sasl_bind_request_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Sasl {
                    mechanism: "GSSAPI".to_string(),
                    credentials: Some(vec![0x60, 0x01, 0xFF]),
                },
            }),
            controls: None,
        });
        // Zero-length credentials are distinct from absent credentials.
        roundtrip(LdapMessage {
            message_id: 3,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Sasl {
                    mechanism: "GSSAPI".to_string(),
                    credentials: Some(Vec::new()),
                },
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 4,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Sasl {
                    mechanism: "EXTERNAL".to_string(),
                    credentials: None,
                },
            }),
            controls: None,
        });
    }

    #[test]
    fn bind_response_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindResponse(BindResponse {
                result: LdapResult {
                    result_code: result_code::SASL_BIND_IN_PROGRESS,
                    matched_dn: String::new(),
                    diagnostic_message: String::new(),
                    referrals: None,
                },
                server_sasl_creds: Some(vec![1, 2, 3, 4]),
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindResponse(BindResponse {
                result: sample_result(result_code::INVALID_CREDENTIALS),
                server_sasl_creds: None,
            }),
            controls: None,
        });
    }

    #[test]
    fn search_request_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchRequest(SearchRequest {
                base_object: "dc=example,dc=com".to_string(),
                scope: SearchScope::WholeSubtree,
                deref_aliases: 0,
                size_limit: 0,
                time_limit: 120,
                types_only: false,
                filter: SearchFilter::And(vec![
                    SearchFilter::Equality("objectClass".to_string(), b"user".to_vec()),
                    SearchFilter::Or(vec![
                        SearchFilter::Present("mail".to_string()),
                        SearchFilter::Not(Box::new(SearchFilter::Equality(
                            "userAccountControl".to_string(),
                            b"514".to_vec(),
                        ))),
                    ]),
                ]),
                attributes: vec!["cn".to_string(), "sAMAccountName".to_string()],
            }),
            controls: Some(vec![Control::PagedResults {
                criticality: false,
                size: 1000,
                cookie: Vec::new(),
            }]),
        });
    }

    #[test]
    fn substrings_filter_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 8,
            protocol_op: ProtocolOp::SearchRequest(SearchRequest {
                base_object: String::new(),
                scope: SearchScope::BaseObject,
                deref_aliases: 3,
                size_limit: 10,
                time_limit: 0,
                types_only: true,
                filter: SearchFilter::Substrings {
                    attribute: "cn".to_string(),
                    initial: Some(b"adm".to_vec()),
                    any: vec![b"ini".to_vec()],
                    r#final: None,
                },
                attributes: Vec::new(),
            }),
            controls: None,
        });
    }

    #[test]
    fn search_result_entry_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "cn=test,dc=example,dc=com".to_string(),
                attributes: vec![
                    Attribute {
                        attr_type: "cn".to_string(),
                        attr_values: vec![b"test".to_vec()],
                    },
                    Attribute {
                        attr_type: "objectGUID".to_string(),
                        attr_values: vec![vec![0x00, 0xFF, 0x10], Vec::new()],
                    },
                ],
            }),
            controls: None,
        });
    }

    #[test]
    fn search_done_and_reference_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchResultDone(LdapResult {
                result_code: result_code::REFERRAL,
                matched_dn: String::new(),
                diagnostic_message: "referral".to_string(),
                referrals: Some(vec!["ldap://other.example.com/dc=example".to_string()]),
            }),
            controls: Some(vec![Control::PagedResults {
                criticality: false,
                size: 0,
                cookie: vec![0xAA, 0xBB],
            }]),
        });
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchResultReference(vec![
                "ldap://a.example.com/".to_string(),
                "ldap://b.example.com/".to_string(),
            ]),
            controls: None,
        });
    }

    #[test]
    fn modify_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 9,
            protocol_op: ProtocolOp::ModifyRequest(ModifyRequest {
                object: "cn=test,dc=example,dc=com".to_string(),
                changes: vec![
                    ModifyChange {
                        operation: ModifyOperation::Replace,
                        modification: Attribute {
                            attr_type: "description".to_string(),
                            attr_values: vec![b"updated".to_vec()],
                        },
                    },
                    ModifyChange {
                        operation: ModifyOperation::Delete,
                        modification: Attribute {
                            attr_type: "mail".to_string(),
                            attr_values: Vec::new(),
                        },
                    },
                ],
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 9,
            protocol_op: ProtocolOp::ModifyResponse(sample_result(0)),
            controls: None,
        });
    }

    #[test]
    fn add_del_modify_dn_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 10,
            protocol_op: ProtocolOp::AddRequest(AddRequest {
                entry: "cn=new,dc=example,dc=com".to_string(),
                attributes: vec![Attribute {
                    attr_type: "objectClass".to_string(),
                    attr_values: vec![b"top".to_vec(), b"user".to_vec()],
                }],
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 10,
            protocol_op: ProtocolOp::AddResponse(sample_result(0)),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 11,
            protocol_op: ProtocolOp::DelRequest("cn=gone,dc=example,dc=com".to_string()),
            controls: Some(vec![Control::ShowDeleted { criticality: true }]),
        });
        roundtrip(LdapMessage {
            message_id: 11,
            protocol_op: ProtocolOp::DelResponse(sample_result(0)),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 12,
            protocol_op: ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                entry: "cn=old,ou=a,dc=example,dc=com".to_string(),
                new_rdn: "cn=new".to_string(),
                delete_old_rdn: true,
                new_superior: Some("ou=b,dc=example,dc=com".to_string()),
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 12,
            protocol_op: ProtocolOp::ModifyDnResponse(sample_result(0)),
            controls: None,
        });
    }

    #[test]
    fn extended_and_unbind_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 13,
            protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: WHOAMI_OID.to_string(),
                request_value: None,
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 13,
            protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: sample_result(0),
                response_name: Some(WHOAMI_OID.to_string()),
                response_value: Some(b"u:EXAMPLE\\user".to_vec()),
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 14,
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        });
    }

    /// Feeding encoded bytes one at a time must never produce a message until
    /// the final byte arrives; the full buffer decodes exactly once.
    #[test]
    fn stream_reassembly_byte_at_a_time() {
        let message = LdapMessage {
            message_id: 5,
            protocol_op: ProtocolOp::SearchResultDone(sample_result(0)),
            controls: None,
        };
        let encoded = encode_ldap_message(&message);
        for cut in 0..encoded.len() {
            assert!(
                try_decode(&encoded[..cut]).unwrap().is_none(),
                "prefix of {} bytes must be incomplete",
                cut
            );
        }
        let (decoded, consumed) = try_decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, message);
    }

    #[test]
    fn long_form_length_reassembly() {
        // Entry large enough to force a multi-byte outer length.
        let message = LdapMessage {
            message_id: 6,
            protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "cn=big,dc=example,dc=com".to_string(),
                attributes: vec![Attribute {
                    attr_type: "jpegPhoto".to_string(),
                    attr_values: vec![vec![0x5A; 300]],
                }],
            }),
            controls: None,
        };
        let encoded = encode_ldap_message(&message);
        assert!(encoded[1] & 0x80 != 0, "outer length must be long form");
        assert!(try_decode(&encoded[..3]).unwrap().is_none());
        assert!(try_decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
        let (decoded, consumed) = try_decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, message);
    }

    #[test]
    fn two_messages_in_one_buffer_decode_in_order() {
        let first = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::SearchResultDone(sample_result(0)),
            controls: None,
        };
        let second = LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        };
        let mut buf = encode_ldap_message(&first);
        let first_len = buf.len();
        buf.extend_from_slice(&encode_ldap_message(&second));
        let (m1, c1) = try_decode(&buf).unwrap().unwrap();
        assert_eq!(m1, first);
        assert_eq!(c1, first_len);
        let (m2, _) = try_decode(&buf[c1..]).unwrap().unwrap();
        assert_eq!(m2, second);
    }

    #[test]
    fn unknown_protocol_op_tag_is_hard_error() {
        // SEQUENCE { INTEGER 1, [APPLICATION 31] ... } - not in the dispatch table.
        let bytes = vec![0x30, 0x05, 0x02, 0x01, 0x01, 0x7F, 0x00];
        let err = try_decode(&bytes).unwrap_err();
        match err {
            LdapError::Decode { message, raw } => {
                assert!(message.contains("0x7F"), "message: {}", message);
                assert_eq!(raw, bytes);
            }
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn non_sequence_start_is_hard_error() {
        let err = try_decode(&[0x04, 0x01, 0x41]).unwrap_err();
        assert!(matches!(err, LdapError::Decode { .. }));
    }

    /// Unknown trailing fields inside a response SEQUENCE are skipped, not
    /// treated as errors (forward compatibility).
    #[test]
    fn unknown_trailing_fields_are_skipped() {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        w.write_integer(3);
        let op = w.begin(LDAP_TAG_BIND_RESPONSE);
        w.write_enumerated(0);
        w.write_string("");
        w.write_string("");
        w.write_tagged_bytes(0x9F, &[0xDE, 0xAD]); // future extension field
        w.end(op);
        w.end(seq);
        let bytes = w.into_vec();

        let parsed = parse_ldap_message(&bytes).unwrap();
        match parsed.protocol_op {
            ProtocolOp::BindResponse(resp) => {
                assert!(resp.result.is_success());
                assert!(resp.server_sasl_creds.is_none());
            }
            other => panic!("expected BindResponse, got {:?}", other),
        }
    }

    #[test]
    fn message_level_disconnect_notice_merges_into_extended_response() {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        w.write_integer(0);
        let op = w.begin(LDAP_TAG_EXTENDED_RESPONSE);
        w.write_enumerated(result_code::UNAVAILABLE);
        w.write_string("");
        w.write_string("shutting down");
        w.end(op);
        // Vendor extension: [10] octet string outside the protocol op.
        w.write_tagged_bytes(
            LDAP_CONTEXT_DISCONNECT_NOTICE,
            NOTICE_OF_DISCONNECTION_OID.as_bytes(),
        );
        w.end(seq);
        let bytes = w.into_vec();

        let parsed = parse_ldap_message(&bytes).unwrap();
        assert_eq!(parsed.message_id, 0);
        match parsed.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                assert!(resp.is_disconnect_notice());
                assert_eq!(resp.result.result_code, result_code::UNAVAILABLE);
            }
            other => panic!("expected ExtendedResponse, got {:?}", other),
        }
    }

    #[test]
    fn controls_decode_known_and_unknown() {
        let mut w = BerWriter::new();
        let seq = w.begin_sequence();
        w.write_integer(2);
        let op = w.begin(LDAP_TAG_SEARCH_RESULT_DONE);
        w.write_enumerated(0);
        w.write_string("");
        w.write_string("");
        w.end(op);
        let ctrls = w.begin(LDAP_CONTEXT_CONTROLS);
        {
            // Paged results with a cookie, criticality omitted (DEFAULT FALSE).
            let c = w.begin_sequence();
            w.write_string(PAGED_RESULTS_OID);
            let mut inner = BerWriter::new();
            let v = inner.begin_sequence();
            inner.write_integer(0);
            inner.write_octet_string(&[0x01, 0x02, 0x03]);
            inner.end(v);
            w.write_octet_string(&inner.into_vec());
            w.end(c);
        }
        {
            // Unknown OID: raw value retained.
            let c = w.begin_sequence();
            w.write_string("1.2.3.4.5");
            w.write_boolean(true);
            w.write_octet_string(&[0xCA, 0xFE]);
            w.end(c);
        }
        w.end(ctrls);
        w.end(seq);
        let bytes = w.into_vec();

        let parsed = parse_ldap_message(&bytes).unwrap();
        let controls = parsed.controls.unwrap();
        assert_eq!(
            controls[0],
            Control::PagedResults {
                criticality: false,
                size: 0,
                cookie: vec![0x01, 0x02, 0x03],
            }
        );
        assert_eq!(
            controls[1],
            Control::Other {
                oid: "1.2.3.4.5".to_string(),
                criticality: true,
                value: Some(vec![0xCA, 0xFE]),
            }
        );
    }

    #[test]
    fn integer_edge_cases() {
        for value in [0, 1, 127, 128, 255, 256, -1, -128, -129, 1_000_000, i32::MAX, i32::MIN] {
            let mut w = BerWriter::new();
            w.write_integer(value);
            let bytes = w.into_vec();
            let mut r = BerReader::new(&bytes);
            assert_eq!(r.read_integer().unwrap(), value, "value {}", value);
        }
        // 127 fits one byte, 128 needs a leading zero.
        let mut w = BerWriter::new();
        w.write_integer(127);
        assert_eq!(w.into_vec(), vec![0x02, 0x01, 0x7F]);
        let mut w = BerWriter::new();
        w.write_integer(128);
        assert_eq!(w.into_vec(), vec![0x02, 0x02, 0x00, 0x80]);
    }

    #[test]
    fn truncated_inner_element_is_hard_error() {
        // Outer claims 5 bytes and has them, but the inner integer overruns.
        let bytes = vec![0x30, 0x05, 0x02, 0x06, 0x01, 0x02, 0x03];
        assert!(matches!(
            try_decode(&bytes),
            Err(LdapError::Decode { .. })
        ));
    }
}
