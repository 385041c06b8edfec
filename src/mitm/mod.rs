//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides:
//! - Certificate Authority loading, generation and per-host leaf issuance
//! - TLS configurations for the client-facing and upstream legs
//! - The tunnel manager that relays or intercepts CONNECT tunnels

pub mod certificate_authority;
pub mod error;
pub mod tls_config;
pub mod tunnel;

pub use certificate_authority::{CertificateAuthority, HostIdentifier, IssuedCertificate};
pub use error::MitmError;
pub use tls_config::{ClientTlsConfig, TlsConfigError, UpstreamTlsConfig};
pub use tunnel::{ExchangeHandler, PrefixedStream, TunnelManager, TunnelTarget};
