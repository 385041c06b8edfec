//! meterproxy - Forward HTTP/HTTPS proxy with per-connection bandwidth accounting
//!
//! meterproxy is a hook-driven forward proxy. Every client connection is
//! metered at the socket level, bound to the identity that authenticated on
//! it, and reported exactly once when it closes.
//!
//! ## Features
//!
//! - **HTTP/1.1 forwarding**: absolute-form requests are forwarded upstream
//! - **CONNECT tunnels**: opaque relay, rejection, or TLS interception
//! - **MITM**: per-host certificates issued by a loaded or ephemeral CA
//! - **Hooks**: accept-local, auth, connect-decide, request/response inspect,
//!   error and size sinks
//! - **Accounting**: byte counts per connection, reported per user on close
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meterproxy::{EngineConfig, Hooks, MeteredListener, ProxyEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (listener, registry) = MeteredListener::bind("127.0.0.1:8080").await?;
//!
//!     let hooks = Hooks::new().on_size(|report| {
//!         println!("{} used {} bytes", report.user, report.bytes_read + report.bytes_written);
//!     });
//!
//!     let engine = ProxyEngine::new(EngineConfig::default(), hooks, registry);
//!     engine.serve(listener).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `registry` - live connection records keyed by remote address
//! - `metered` - counting listeners and streams
//! - `auth` - proxy credentials and the auth-to-accounting binding
//! - `hooks` / `context` - callback surface and per-exchange state
//! - `server` - the proxy engine
//! - `mitm` - certificate authority and tunnel interception
//! - `http_client` - upstream HTTP/1.1 client

// Core proxy modules
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod http_client;
pub mod logger;
pub mod server;

// Accounting
pub mod auth;
pub mod metered;
pub mod registry;

// MITM
pub mod mitm;

// Bodies and TLS utilities
pub mod body;
pub mod tls;

// Re-export commonly used types

/// Configuration types
pub use config::ProxyConfig;

/// Engine
pub use server::{EngineConfig, ProxyEngine};

/// Hooks
pub use context::ProxyContext;
pub use hooks::{ConnectAction, ConnectDecision, Hooks, RequestHead};

/// Errors
pub use error::{DeadlineElapsed, ErrorKind, ProxyError, Stage};

/// Accounting
pub use auth::{BandwidthReport, Credentials, ProxyAuthenticator, ProxyCredentials};
pub use metered::{IoTimeouts, MeteredListener, MeteredStream, TlsMeteredListener};
pub use registry::{ConnectionRecord, ConnectionRegistry, ConnectionTotals};

/// Bodies
pub use body::ProxyBody;

/// Logging
pub use logger::BandwidthLedger;

/// MITM types and functionality
pub use mitm::{
    CertificateAuthority, ClientTlsConfig, HostIdentifier, MitmError, TunnelManager,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
