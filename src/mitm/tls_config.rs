//! TLS Configuration for interception
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) with issued certificates
//! - Upstream TLS (proxy → upstream) with real verification
//!
//! Both sides are pinned to HTTP/1.1 via ALPN since decrypted exchanges are
//! served and forwarded as HTTP/1.1.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

/// ALPN protocol offered on both legs
pub const HTTP11_ALPN: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Client-facing TLS config (proxy acts as server with an issued cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Verify upstreams against the Mozilla root bundle
    pub fn new() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(root_store)
    }

    /// Verify upstreams against a custom root store
    pub fn with_roots(root_store: RootCertStore) -> Self {
        let roots_count = root_store.len();
        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

        debug!(roots_count, "Upstream TLS config created");

        Self {
            config: Arc::new(config),
        }
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a hostname or IP literal into an owned SNI name
pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
    let hostname = hostname.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(hostname.to_owned())
        .map_err(|e| TlsConfigError::InvalidServerName(format!("{}: {}", hostname, e)))
}
