//! MITM error types

use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// CA certificate loading or validation failed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for {host}: {reason}")]
    CertGenerationFailed { host: String, reason: String },

    /// Client-facing TLS handshake failed
    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// Upstream connection failed
    #[error("Upstream connection failed for {host}: {reason}")]
    UpstreamConnectionFailed { host: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    pub fn cert_generation(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    pub fn tls_handshake(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    pub fn upstream(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamConnectionFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }
}

impl From<super::tls_config::TlsConfigError> for MitmError {
    fn from(err: super::tls_config::TlsConfigError) -> Self {
        Self::TlsConfigFailed(err.to_string())
    }
}
