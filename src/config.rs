use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Credentials;
use crate::metered::IoTimeouts;
use crate::mitm::CertificateAuthority;
use crate::server::EngineConfig;

pub struct ProxyConfig {
    // Listener
    pub addr: String,
    pub port: u16,

    // Proxy credentials (both or neither)
    pub username: Option<String>,
    pub password: Option<SecretString>,

    // Interception CA; absent means an ephemeral CA is generated
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,

    // TLS-terminating listener certificate
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    // Timeouts (0 disables the read/write deadlines)
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub handshake_timeout_seconds: u64,

    // Logging
    pub log_json: bool,
    pub ledger_batch_size: usize,
    pub ledger_flush_interval_secs: u64,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let addr = env::var("PROXY_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_var("PROXY_PORT", "8080")?;

        let (username, password) = pair("PROXY_USERNAME", "PROXY_PASSWORD")?;
        if matches!(&username, Some(user) if user.is_empty()) {
            return Err(anyhow::anyhow!("PROXY_USERNAME cannot be empty"));
        }
        let password = password.map(SecretString::new);

        let (ca_cert_path, ca_key_path) = pair("PROXY_CA_CERT_PATH", "PROXY_CA_KEY_PATH")?;
        let (tls_cert_path, tls_key_path) = pair("PROXY_TLS_CERT_PATH", "PROXY_TLS_KEY_PATH")?;

        let read_timeout_seconds = parse_var("READ_TIMEOUT_SECONDS", "300")?;
        let write_timeout_seconds = parse_var("WRITE_TIMEOUT_SECONDS", "300")?;
        let connect_timeout_seconds = parse_var("CONNECT_TIMEOUT_SECONDS", "10")?;
        let handshake_timeout_seconds = parse_var("HANDSHAKE_TIMEOUT_SECONDS", "10")?;

        let log_json = parse_var("LOG_JSON", "false")?;
        let ledger_batch_size = parse_var("LEDGER_BATCH_SIZE", "100")?;
        let ledger_flush_interval_secs = parse_var("LEDGER_FLUSH_INTERVAL_SECS", "30")?;

        if ledger_batch_size == 0 {
            return Err(anyhow::anyhow!("LEDGER_BATCH_SIZE must be at least 1"));
        }
        if ledger_flush_interval_secs == 0 {
            return Err(anyhow::anyhow!("LEDGER_FLUSH_INTERVAL_SECS must be at least 1"));
        }

        Ok(ProxyConfig {
            addr,
            port,
            username,
            password,
            ca_cert_path,
            ca_key_path,
            tls_cert_path,
            tls_key_path,
            read_timeout_seconds,
            write_timeout_seconds,
            connect_timeout_seconds,
            handshake_timeout_seconds,
            log_json,
            ledger_batch_size,
            ledger_flush_interval_secs,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let bind = if self.addr.contains(':') && !self.addr.starts_with('[') {
            format!("[{}]:{}", self.addr, self.port)
        } else {
            format!("{}:{}", self.addr, self.port)
        };
        bind.parse()
            .with_context(|| format!("Invalid listen address {}", bind))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                Some(Credentials::new(user.clone(), pass.expose_secret().clone()))
            }
            _ => None,
        }
    }

    /// Deadlines for client and upstream connections
    pub fn io_timeouts(&self) -> IoTimeouts {
        IoTimeouts::new(
            seconds(self.read_timeout_seconds),
            seconds(self.write_timeout_seconds),
        )
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn ledger_flush_interval(&self) -> Duration {
        Duration::from_secs(self.ledger_flush_interval_secs)
    }

    /// Engine settings from the loaded values
    pub fn engine_config(&self, ca: Option<Arc<CertificateAuthority>>) -> EngineConfig {
        EngineConfig {
            credentials: self.credentials(),
            ca,
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            handshake_timeout: self.handshake_timeout(),
            upstream_timeouts: self.io_timeouts(),
            ..EngineConfig::default()
        }
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ca_cert_path", &self.ca_cert_path)
            .field("tls_cert_path", &self.tls_cert_path)
            .field("read_timeout_seconds", &self.read_timeout_seconds)
            .field("write_timeout_seconds", &self.write_timeout_seconds)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("handshake_timeout_seconds", &self.handshake_timeout_seconds)
            .field("log_json", &self.log_json)
            .field("ledger_batch_size", &self.ledger_batch_size)
            .field("ledger_flush_interval_secs", &self.ledger_flush_interval_secs)
            .finish()
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

/// Read two variables that must be set together
fn pair(first: &str, second: &str) -> Result<(Option<String>, Option<String>)> {
    match (env::var(first).ok(), env::var(second).ok()) {
        (Some(a), Some(b)) => Ok((Some(a), Some(b))),
        (None, None) => Ok((None, None)),
        (Some(_), None) => Err(anyhow::anyhow!("{} is set but {} is missing", first, second)),
        (None, Some(_)) => Err(anyhow::anyhow!("{} is set but {} is missing", second, first)),
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
