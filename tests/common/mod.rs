//! Shared helpers: a scripted in-process LDAP server speaking the crate's
//! own codec, plus message constructors used across the tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use ldap_engine::codec::{
    self, result_code, BindResponse, LdapMessage, LdapResult, ProtocolOp, SearchResultEntry,
};
use ldap_engine::config::{Config, ServerConfig};
use ldap_engine::error::Result;
use ldap_engine::security::SecurityContext;
use ldap_engine::Control;

/// Route `tracing` output through the test harness; safe to call from every
/// test, only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(url: String) -> Config {
    Config {
        server: ServerConfig { url },
        connect_timeout_sec: Some(5),
        operation_timeout_sec: Some(5),
        page_size: Some(100),
        max_sasl_frame: Some(1024 * 1024),
        tls: None,
    }
}

/// Bind a listener on an ephemeral port and run `script` on the first
/// accepted connection. Returns the ldap:// URL and the server task handle;
/// await the handle at the end of the test to surface script panics.
pub async fn spawn_server<F, Fut>(script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });
    (format!("ldap://127.0.0.1:{}", port), handle)
}

/// Read one LDAP message from the stream, buffering partial PDUs in `buf`.
pub async fn read_message<S>(stream: &mut S, buf: &mut BytesMut) -> LdapMessage
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((message, consumed)) = codec::try_decode(buf).unwrap() {
            buf.advance(consumed);
            return message;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed the connection mid-message");
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub async fn write_message<S>(stream: &mut S, message: &LdapMessage)
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&codec::encode_ldap_message(message))
        .await
        .unwrap();
}

/// Complete a server-side TLS handshake with a self-signed test certificate.
pub async fn accept_tls(stream: TcpStream) -> tokio_rustls::server::TlsStream<TcpStream> {
    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &include_bytes!("../data/cert.pem")[..])
            .collect::<std::io::Result<_>>()
            .unwrap();
    let key = rustls_pemfile::private_key(&mut &include_bytes!("../data/key.pem")[..])
        .unwrap()
        .expect("test key PEM holds no private key");
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
        .accept(stream)
        .await
        .unwrap()
}

/// Read one 4-byte big-endian length-prefixed SASL frame.
pub async fn read_framed(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

pub async fn write_framed(stream: &mut TcpStream, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
}

pub fn bind_response(id: i32, code: i32, creds: Option<Vec<u8>>) -> LdapMessage {
    LdapMessage {
        message_id: id,
        protocol_op: ProtocolOp::BindResponse(BindResponse {
            result: LdapResult {
                result_code: code,
                matched_dn: String::new(),
                diagnostic_message: String::new(),
                referrals: None,
            },
            server_sasl_creds: creds,
        }),
        controls: None,
    }
}

pub fn bind_success(id: i32) -> LdapMessage {
    bind_response(id, result_code::SUCCESS, None)
}

pub fn search_entry(id: i32, dn: &str) -> LdapMessage {
    LdapMessage {
        message_id: id,
        protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: dn.to_string(),
            attributes: Vec::new(),
        }),
        controls: None,
    }
}

/// SearchResultDone; attaches a paged-results control when a cookie is given.
pub fn search_done(id: i32, code: i32, cookie: Option<&[u8]>) -> LdapMessage {
    LdapMessage {
        message_id: id,
        protocol_op: ProtocolOp::SearchResultDone(LdapResult {
            result_code: code,
            matched_dn: String::new(),
            diagnostic_message: String::new(),
            referrals: None,
        }),
        controls: cookie.map(|cookie| {
            vec![Control::PagedResults {
                criticality: false,
                size: 0,
                cookie: cookie.to_vec(),
            }]
        }),
    }
}

/// Cookie carried by the request's paged-results control.
pub fn request_cookie(message: &LdapMessage) -> Vec<u8> {
    message
        .controls
        .iter()
        .flatten()
        .find_map(|c| match c {
            Control::PagedResults { cookie, .. } => Some(cookie.clone()),
            _ => None,
        })
        .expect("request carries no paged-results control")
}

/// The reversible transform both the fake mechanism and the scripted server
/// apply; stands in for a real GSSAPI wrap.
pub fn xor_seal(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ 0x55).collect()
}

/// Fake GSSAPI mechanism: one token round, then complete. Wrap/unwrap XOR
/// every byte so sealed traffic is visibly transformed yet reversible.
pub struct FakeGssapi {
    round: u8,
    pub confidentiality: bool,
}

impl FakeGssapi {
    pub fn new() -> Self {
        Self {
            round: 0,
            confidentiality: false,
        }
    }
}

impl Default for FakeGssapi {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityContext for FakeGssapi {
    fn step(&mut self, input: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        match self.round {
            0 => {
                assert!(input.is_none());
                self.round = 1;
                Ok(Some(b"client-token-1".to_vec()))
            }
            _ => {
                self.round = 2;
                Ok(None)
            }
        }
    }

    fn wrap(&self, data: &[u8], _confidential: bool) -> Result<Vec<u8>> {
        Ok(xor_seal(data))
    }

    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(xor_seal(data))
    }

    fn max_wrap_size(&self, server_max: u32, _confidential: bool) -> u32 {
        server_max.min(0x8000)
    }

    fn integrity_available(&self) -> bool {
        true
    }

    fn confidentiality_available(&self) -> bool {
        self.confidentiality
    }

    fn complete(&self) -> bool {
        self.round >= 2
    }
}
