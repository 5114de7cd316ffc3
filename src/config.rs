use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{LdapError, Result};

const DEFAULT_LDAP_PORT: u16 = 389;
const DEFAULT_LDAPS_PORT: u16 = 636;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// TCP connect + TLS handshake deadline in seconds (default 10).
    pub connect_timeout_sec: Option<u64>,
    /// Per-operation response deadline in seconds (default 60).
    pub operation_timeout_sec: Option<u64>,
    /// Requested entries per simple-paged-results page (default 1000).
    pub page_size: Option<u32>,
    /// Upper bound on a declared SASL frame length in bytes (default 1 MiB).
    /// Larger declared frames fail the connection instead of buffering.
    pub max_sasl_frame: Option<u32>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// "ldap://host[:port]" or "ldaps://host[:port]".
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Extra PEM CA bundle trusted in addition to system roots.
    pub ca_file: Option<String>,
    /// Accept any server certificate (internal/test networks only).
    pub skip_verify: Option<bool>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            LdapError::Config(format!("read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| LdapError::Config(format!("parse YAML: {}", e)))?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec.unwrap_or(10))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_sec.unwrap_or(60))
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(1000)
    }

    pub fn max_sasl_frame(&self) -> u32 {
        self.max_sasl_frame.unwrap_or(1024 * 1024)
    }

    pub fn tls_skip_verify(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(|t| t.skip_verify)
            .unwrap_or(false)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: "ldap://127.0.0.1:389".to_string(),
            },
            connect_timeout_sec: Some(10),
            operation_timeout_sec: Some(60),
            page_size: Some(1000),
            max_sasl_frame: Some(1024 * 1024),
            tls: None,
        }
    }
}

/// Parse "ldap://host[:port]" or "ldaps://host[:port]" to (ldaps, host, port).
pub fn parse_server_url(url: &str) -> Result<(bool, String, u16)> {
    let (ldaps, rest) = if let Some(rest) = url.strip_prefix("ldaps://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ldap://") {
        (false, rest)
    } else {
        return Err(LdapError::Config(format!(
            "invalid LDAP URL scheme: {}",
            url
        )));
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(LdapError::Config(format!("no host in URL: {}", url)));
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| LdapError::Config(format!("invalid port in URL: {}", url)))?;
            (host.to_string(), port)
        }
        None => (
            rest.to_string(),
            if ldaps {
                DEFAULT_LDAPS_PORT
            } else {
                DEFAULT_LDAP_PORT
            },
        ),
    };
    Ok((ldaps, host, port))
}
