//! Client TLS configuration for ldaps:// connections and StartTLS upgrades.

use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::SignatureScheme;
use rustls_pki_types::ServerName;

use crate::config::TlsConfig;
use crate::error::{LdapError, Result};

/// Build the rustls client config for a connection: system roots plus the
/// configured extra CA bundle, or the insecure verifier when `skip_verify`
/// is set.
pub fn client_config(tls: Option<&TlsConfig>) -> Result<Arc<ClientConfig>> {
    if tls.and_then(|t| t.skip_verify).unwrap_or(false) {
        return client_config_insecure();
    }
    let ca_pem = match tls.and_then(|t| t.ca_file.as_deref()) {
        Some(path) => Some(
            fs::read(path)
                .map_err(|e| LdapError::Config(format!("read CA file {}: {}", path, e)))?,
        ),
        None => None,
    };
    client_config_with_ca(ca_pem.as_deref())
}

fn root_store_with_native_certs() -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| LdapError::Config(format!("load system CA certs: {}", e)))?;
    for cert in certs {
        let _ = root_store.add(cert);
    }
    Ok(root_store)
}

fn client_config_with_ca(extra_ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let mut root_store = root_store_with_native_certs()?;
    if let Some(pem) = extra_ca_pem {
        let mut reader = BufReader::new(std::io::Cursor::new(pem));
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert =
                cert.map_err(|e| LdapError::Config(format!("parse CA PEM: {}", e)))?;
            let _ = root_store.add(cert);
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Client config that skips server certificate verification (skip_verify).
/// The verifier never consults roots, so none are loaded.
fn client_config_insecure() -> Result<Arc<ClientConfig>> {
    let root_store = rustls::RootCertStore::empty();
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| LdapError::Config(format!("invalid hostname for TLS SNI: {}", host)))
}

/// Verifier that accepts any server certificate. Only for skip_verify
/// (internal/test networks).
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
