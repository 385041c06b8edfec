// Proxy Authentication
// Basic proxy credentials and their binding to connection byte accounting

use crate::body::{full, ProxyBody};
use crate::hooks::SizeHook;
use crate::registry::ConnectionRegistry;
use base64::{engine::general_purpose, Engine as _};
use http::header::{HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{Request, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Identity reported when no credentials are configured
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("Missing Proxy-Authorization header")]
    MissingHeader,

    #[error("Invalid Proxy-Authorization format (expected: Basic <base64(user:pass)>)")]
    InvalidFormat,

    #[error("Unsupported authorization scheme: {0}")]
    UnsupportedScheme(String),
}

/// Credentials claimed by a client
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse a `Basic <base64(user:pass)>` header value
    pub fn parse_basic(header: &str) -> Result<Self, CredentialsError> {
        let mut parts = header.trim().splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let encoded = parts.next().map(str::trim).unwrap_or_default();

        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(CredentialsError::UnsupportedScheme(scheme.to_string()));
        }
        if encoded.is_empty() {
            return Err(CredentialsError::InvalidFormat);
        }

        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CredentialsError::InvalidFormat)?;
        let decoded = String::from_utf8(decoded).map_err(|_| CredentialsError::InvalidFormat)?;

        let (username, password) = decoded
            .split_once(':')
            .ok_or(CredentialsError::InvalidFormat)?;

        Ok(Self::new(username, password))
    }

    /// Extract credentials from the request's Proxy-Authorization header
    pub fn from_request<B>(request: &Request<B>) -> Result<Self, CredentialsError> {
        let header = request
            .headers()
            .get(PROXY_AUTHORIZATION)
            .ok_or(CredentialsError::MissingHeader)?;
        let header = header.to_str().map_err(|_| CredentialsError::InvalidFormat)?;
        Self::parse_basic(header)
    }

    /// Encode as a Proxy-Authorization header value
    pub fn to_header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(raw))
    }

    /// Identity used for bandwidth reports
    pub fn identity(&self) -> &str {
        if self.username.is_empty() {
            ANONYMOUS_USER
        } else {
            &self.username
        }
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Configured proxy credential
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Plain equality on both fields
    pub fn matches(&self, claimed: &ProxyCredentials) -> bool {
        self.username == claimed.username && self.password.expose_secret() == &claimed.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Bytes attributed to one authorized connection, emitted once at close
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandwidthReport {
    pub user: String,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub remote: String,
}

/// Validates credentials and binds the outcome to the connection record
#[derive(Clone)]
pub struct ProxyAuthenticator {
    credentials: Option<Credentials>,
    registry: ConnectionRegistry,
    reporter: Option<SizeHook>,
}

impl ProxyAuthenticator {
    pub fn new(
        registry: ConnectionRegistry,
        credentials: Option<Credentials>,
        reporter: Option<SizeHook>,
    ) -> Self {
        Self {
            credentials,
            registry,
            reporter,
        }
    }

    pub fn requires_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Compare claimed credentials with the configured ones
    ///
    /// With nothing configured every claim is accepted.
    pub fn check(&self, claimed: &ProxyCredentials) -> bool {
        match &self.credentials {
            Some(expected) => expected.matches(claimed),
            None => true,
        }
    }

    /// Check the claim and bind the decision to `remote`'s record
    pub fn authenticate(&self, remote: &str, claimed: &ProxyCredentials) -> bool {
        let authorized = self.check(claimed);
        self.bind(remote, claimed.identity(), authorized);
        authorized
    }

    /// Arm the close callback of `remote`'s record
    ///
    /// The callback pops the record and, only when `authorized`, reports its
    /// totals. Returns false when the connection is not under accounting.
    pub fn bind(&self, remote: &str, user: &str, authorized: bool) -> bool {
        let Some(record) = self.registry.find(remote) else {
            debug!(remote = %remote, "Connection not tracked, skipping accounting");
            return false;
        };

        let registry = self.registry.clone();
        let reporter = self.reporter.clone();
        let remote = remote.to_string();
        let user = user.to_string();
        let id = record.id();

        record.on_finalize(Box::new(move |totals| {
            if authorized {
                let report = BandwidthReport {
                    user,
                    bytes_read: totals.bytes_read,
                    bytes_written: totals.bytes_written,
                    remote: remote.clone(),
                };
                info!(
                    user = %report.user,
                    remote = %report.remote,
                    bytes_read = report.bytes_read,
                    bytes_written = report.bytes_written,
                    "Bandwidth report"
                );
                if let Some(reporter) = reporter {
                    reporter(&report);
                }
            } else {
                debug!(
                    remote = %remote,
                    user = %user,
                    "Unauthorized connection closed, not reported"
                );
            }
            // Popped last so an empty registry means every report went out
            registry.pop_matching(&remote, id);
        }));
        true
    }
}

impl fmt::Debug for ProxyAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuthenticator")
            .field("credentials", &self.credentials)
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

/// 407 challenge asking for Basic proxy credentials
pub fn challenge_response() -> Response<ProxyBody> {
    let mut response = Response::new(full("Proxy authentication required"));
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    let headers = response.headers_mut();
    headers.insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"meterproxy\""),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
