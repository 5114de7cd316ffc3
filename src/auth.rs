//! Authentication: simple bind, multi-round SASL bind, and the GSSAPI
//! post-bind security-layer negotiation.
//!
//! Non-success bind result codes (e.g. invalidCredentials) come back as
//! [`LdapResult`] values; only transport/protocol problems and broken
//! security-layer negotiations are errors.

use std::sync::Arc;

use tracing::{debug, info};

use crate::codec::{result_code, BindResponse, LdapResult, ProtocolOp};
use crate::connection::Connection;
use crate::error::{LdapError, Result};
use crate::security::{sec_layer, SecurityContext};

pub const GSSAPI_MECHANISM: &str = "GSSAPI";

/// What the caller wants from the SASL security layer. Confidentiality
/// implies integrity on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityLayerRequest {
    pub integrity: bool,
    pub confidentiality: bool,
}

pub async fn simple_bind(conn: &Connection, name: &str, password: &str) -> Result<LdapResult> {
    let id = conn.send_simple_bind(name, password).await?;
    let resp = expect_bind_response(conn, id).await?;
    conn.bind_completed(resp.result.result_code);
    if resp.result.is_success() {
        info!(%name, "simple bind succeeded");
    } else {
        debug!(
            %name,
            code = resp.result.result_code,
            "simple bind rejected: {}",
            resp.result.diagnostic_message
        );
    }
    Ok(resp.result)
}

/// Drive a SASL mechanism to completion without a security layer. Each round
/// feeds the server token to the mechanism and sends the produced client
/// token; the exchange continues while the server answers
/// saslBindInProgress.
pub async fn sasl_bind(
    conn: &Connection,
    mechanism: &str,
    ctx: &mut dyn SecurityContext,
) -> Result<LdapResult> {
    let mut server_token: Option<Vec<u8>> = None;
    loop {
        let client_token = ctx.step(server_token.as_deref())?;
        let id = conn.send_sasl_bind(mechanism, client_token).await?;
        let resp = expect_bind_response(conn, id).await?;
        conn.bind_completed(resp.result.result_code);
        match resp.result.result_code {
            result_code::SASL_BIND_IN_PROGRESS => {
                server_token = resp.server_sasl_creds;
            }
            result_code::SUCCESS => {
                // Mutual-auth mechanisms deliver a final token with success.
                if let Some(creds) = resp.server_sasl_creds.as_deref() {
                    ctx.step(Some(creds))?;
                }
                info!(mechanism, "SASL bind succeeded");
                return Ok(resp.result);
            }
            _ => {
                debug!(
                    mechanism,
                    code = resp.result.result_code,
                    "SASL bind rejected: {}",
                    resp.result.diagnostic_message
                );
                return Ok(resp.result);
            }
        }
    }
}

/// GSSAPI bind with the RFC 4752 security-layer handshake.
///
/// Phase 1 establishes the GSSAPI context over SASL bind rounds. Phase 2
/// exchanges the wrapped capability token: the server advertises its layer
/// options and maximum message size, the client answers with its selection,
/// and on success the negotiated seal is installed on the connection so every
/// subsequent PDU is signed or sealed.
pub async fn gssapi_bind(
    conn: &Connection,
    mut ctx: Box<dyn SecurityContext>,
    request: SecurityLayerRequest,
) -> Result<LdapResult> {
    // Phase 1: context establishment.
    let mut server_token: Option<Vec<u8>> = None;
    loop {
        let client_token = ctx.step(server_token.as_deref())?;
        if ctx.complete() && client_token.is_none() {
            break;
        }
        let id = conn.send_sasl_bind(GSSAPI_MECHANISM, client_token).await?;
        let resp = expect_bind_response(conn, id).await?;
        conn.bind_completed(resp.result.result_code);
        match resp.result.result_code {
            result_code::SASL_BIND_IN_PROGRESS => {
                server_token = resp.server_sasl_creds;
            }
            result_code::SUCCESS => {
                if request.integrity || request.confidentiality {
                    return Err(LdapError::Auth(
                        "server completed bind without security-layer negotiation".to_string(),
                    ));
                }
                info!("GSSAPI bind succeeded without security layer");
                return Ok(resp.result);
            }
            _ => return Ok(resp.result),
        }
    }

    // Phase 2: capability token exchange. An empty bind asks the server for
    // its wrapped capability token.
    let id = conn.send_sasl_bind(GSSAPI_MECHANISM, None).await?;
    let resp = expect_bind_response(conn, id).await?;
    conn.bind_completed(resp.result.result_code);
    if resp.result.result_code != result_code::SASL_BIND_IN_PROGRESS {
        if resp.result.is_success() && !request.integrity && !request.confidentiality {
            return Ok(resp.result);
        }
        return Err(LdapError::Auth(format!(
            "expected security-layer challenge, got result code {}",
            resp.result.result_code
        )));
    }
    let wrapped = resp
        .server_sasl_creds
        .ok_or_else(|| LdapError::Auth("missing security-layer token".to_string()))?;
    let plain = ctx.unwrap(&wrapped)?;
    let (server_flags, server_max) = parse_server_capabilities(&plain)?;
    debug!(
        flags = %format_args!("0x{:02x}", server_flags),
        max = server_max,
        "server security-layer capabilities"
    );

    let (flags, confidential) = select_layer(server_flags, request, ctx.as_ref())?;
    let client_max = if flags == sec_layer::NONE {
        0
    } else {
        ctx.max_wrap_size(server_max, confidential)
    };
    let token = capability_token(flags, client_max);
    let sealed = ctx.wrap(&token, false)?;

    let id = conn.send_sasl_bind(GSSAPI_MECHANISM, Some(sealed)).await?;
    let resp = expect_bind_response(conn, id).await?;
    conn.bind_completed(resp.result.result_code);
    if !resp.result.is_success() {
        return Ok(resp.result);
    }
    if flags != sec_layer::NONE {
        conn.install_security_layer(Arc::from(ctx), confidential);
    }
    info!(
        confidential,
        integrity = flags != sec_layer::NONE,
        "GSSAPI bind succeeded"
    );
    Ok(resp.result)
}

async fn expect_bind_response(conn: &Connection, id: i32) -> Result<BindResponse> {
    let message = conn.wait_for_message(id).await?;
    conn.remove_message_queue(id);
    match message.protocol_op {
        ProtocolOp::BindResponse(resp) => Ok(resp),
        other => Err(LdapError::decode(format!(
            "expected BindResponse, got {:?}",
            other
        ))),
    }
}

/// Decode the 4-byte capability token: byte 0 holds the layer option bits,
/// bytes 1-3 the big-endian maximum message size (read as a 32-bit value
/// with byte 0 zeroed).
pub(crate) fn parse_server_capabilities(token: &[u8]) -> Result<(u8, u32)> {
    if token.len() != 4 {
        return Err(LdapError::Auth(format!(
            "security-layer token must be 4 bytes, got {}",
            token.len()
        )));
    }
    let flags = token[0];
    let max_size = u32::from_be_bytes([0, token[1], token[2], token[3]]);
    if flags == sec_layer::NONE && max_size != 0 {
        return Err(LdapError::Auth(
            "no-security-layer token with nonzero max size".to_string(),
        ));
    }
    Ok((flags, max_size))
}

fn capability_token(flags: u8, max_size: u32) -> Vec<u8> {
    let bytes = max_size.to_be_bytes();
    vec![flags, bytes[1], bytes[2], bytes[3]]
}

/// Intersect what the caller asked for with what the server and mechanism
/// offer. A requested capability that is not available is an error, not a
/// silent downgrade.
fn select_layer(
    server_flags: u8,
    request: SecurityLayerRequest,
    ctx: &dyn SecurityContext,
) -> Result<(u8, bool)> {
    if request.confidentiality {
        if server_flags & sec_layer::CONFIDENTIALITY == 0 {
            return Err(LdapError::Auth(
                "server does not offer confidentiality".to_string(),
            ));
        }
        if !ctx.confidentiality_available() {
            return Err(LdapError::Auth(
                "mechanism cannot provide confidentiality".to_string(),
            ));
        }
        return Ok((sec_layer::CONFIDENTIALITY, true));
    }
    if request.integrity {
        if server_flags & sec_layer::INTEGRITY == 0 {
            return Err(LdapError::Auth(
                "server does not offer integrity".to_string(),
            ));
        }
        if !ctx.integrity_available() {
            return Err(LdapError::Auth(
                "mechanism cannot provide integrity".to_string(),
            ));
        }
        return Ok((sec_layer::INTEGRITY, false));
    }
    if server_flags & sec_layer::NONE == 0 {
        return Err(LdapError::Auth(
            "server requires a security layer".to_string(),
        ));
    }
    Ok((sec_layer::NONE, false))
}
