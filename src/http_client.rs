//! Upstream HTTP client
//!
//! Opens metered connections to destinations and drives HTTP/1.1 exchanges
//! over them with hyper's low-level client connection API. Plain requests
//! get one connection per exchange; tunnels keep a session that is reopened
//! when the destination closes it.

use crate::body::{incoming, ProxyBody};
use crate::metered::{IoTimeouts, MeteredStream};
use crate::mitm::tls_config::parse_server_name;
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use http::{HeaderMap, Request, Response, Uri};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS error with {host}: {message}")]
    Tls { host: String, message: String },

    #[error("HTTP handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: hyper::Error,
    },

    #[error("Upstream request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("Invalid request target: {0}")]
    InvalidTarget(String),
}

/// Anything that can answer a forwarded request
///
/// The engine's inspection path is written against this so plain requests
/// and tunnel exchanges share it.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, UpstreamError>;
}

/// Factory for metered upstream connections
#[derive(Clone)]
pub struct UpstreamClient {
    tls: TlsConnector,
    connect_timeout: Duration,
    timeouts: IoTimeouts,
}

impl UpstreamClient {
    pub fn new(tls_config: Arc<ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(tls_config),
            connect_timeout: Duration::from_secs(10),
            timeouts: IoTimeouts::default(),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_timeouts(mut self, timeouts: IoTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Open a metered TCP connection to `addr` (`host:port`)
    pub async fn connect_tcp(&self, addr: &str) -> Result<MeteredStream<TcpStream>, UpstreamError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| UpstreamError::ConnectionTimeout(addr.to_string()))?
            .map_err(|source| UpstreamError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        debug!(addr = %addr, "Connected to upstream");
        Ok(MeteredStream::detached(stream, addr, self.timeouts))
    }

    /// Open an HTTP/1.1 session, over TLS when `tls_host` is given
    pub async fn open(
        &self,
        addr: &str,
        tls_host: Option<&str>,
    ) -> Result<UpstreamSession, UpstreamError> {
        let stream = self.connect_tcp(addr).await?;

        let sender = match tls_host {
            Some(host) => {
                let server_name = parse_server_name(host).map_err(|e| UpstreamError::Tls {
                    host: host.to_string(),
                    message: e.to_string(),
                })?;
                let tls = timeout(self.connect_timeout, self.tls.connect(server_name, stream))
                    .await
                    .map_err(|_| UpstreamError::ConnectionTimeout(addr.to_string()))?
                    .map_err(|e| UpstreamError::Tls {
                        host: host.to_string(),
                        message: e.to_string(),
                    })?;
                handshake(tls, addr).await?
            }
            None => handshake(stream, addr).await?,
        };

        Ok(UpstreamSession {
            sender,
            addr: addr.to_string(),
        })
    }
}

#[async_trait]
impl Fetch for UpstreamClient {
    /// One-shot fetch of an absolute-form request
    async fn fetch(
        &self,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let (addr, tls_host) = target_of(request.uri())?;
        let mut session = self.open(&addr, tls_host.as_deref()).await?;
        session.send(request).await
    }
}

async fn handshake<S>(stream: S, addr: &str) -> Result<SendRequest<ProxyBody>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|source| UpstreamError::Handshake {
            addr: addr.to_string(),
            source,
        })?;

    let addr = addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(addr = %addr, error = %e, "Upstream connection closed with error");
        }
    });

    Ok(sender)
}

/// Resolve `host:port` and the TLS name for an absolute URI
fn target_of(uri: &Uri) -> Result<(String, Option<String>), UpstreamError> {
    let authority = uri
        .authority()
        .ok_or_else(|| UpstreamError::InvalidTarget(uri.to_string()))?;
    let tls = match uri.scheme_str() {
        Some("https") => true,
        Some("http") | None => false,
        Some(other) => {
            return Err(UpstreamError::InvalidTarget(format!("unsupported scheme {}", other)))
        }
    };
    let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let addr = format!("{}:{}", authority.host(), port);
    Ok((addr, tls.then(|| authority.host().to_string())))
}

/// Open HTTP/1.1 connection to one destination
pub struct UpstreamSession {
    sender: SendRequest<ProxyBody>,
    addr: String,
}

impl UpstreamSession {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the destination closed the connection
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Send one request and return the filtered response
    pub async fn send(
        &mut self,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let request = prepare_request(request)?;
        self.sender.ready().await.map_err(UpstreamError::Request)?;
        let response = self
            .sender
            .send_request(request)
            .await
            .map_err(UpstreamError::Request)?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, incoming(body)))
    }
}

/// Upstream of one MITM tunnel, reopened when the destination closes it
pub struct TunnelUpstream {
    client: UpstreamClient,
    addr: String,
    tls_host: Option<String>,
    session: Mutex<Option<UpstreamSession>>,
}

impl TunnelUpstream {
    /// Connect eagerly so connect failures surface before any exchange
    pub async fn connect(
        client: UpstreamClient,
        addr: &str,
        tls_host: Option<&str>,
    ) -> Result<Self, UpstreamError> {
        let session = client.open(addr, tls_host).await?;
        Ok(Self {
            client,
            addr: addr.to_string(),
            tls_host: tls_host.map(str::to_string),
            session: Mutex::new(Some(session)),
        })
    }
}

#[async_trait]
impl Fetch for TunnelUpstream {
    async fn fetch(
        &self,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let mut guard = self.session.lock().await;
        let reopen = guard.as_ref().map_or(true, UpstreamSession::is_closed);
        if reopen {
            debug!(addr = %self.addr, "Reopening upstream session");
            *guard = Some(self.client.open(&self.addr, self.tls_host.as_deref()).await?);
        }

        let Some(session) = guard.as_mut() else {
            return Err(UpstreamError::InvalidTarget(self.addr.clone()));
        };
        let result = session.send(request).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

/// Rewrite to origin-form, fix Host and drop hop-by-hop headers
fn prepare_request(request: Request<ProxyBody>) -> Result<Request<ProxyBody>, UpstreamError> {
    let (mut parts, body) = request.into_parts();

    if let Some(authority) = parts.uri.authority().cloned() {
        if !parts.headers.contains_key(HOST) {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|_| UpstreamError::InvalidTarget(authority.to_string()))?;
            parts.headers.insert(HOST, value);
        }
        let origin = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = origin
            .parse()
            .map_err(|_| UpstreamError::InvalidTarget(origin.to_string()))?;
    }

    strip_hop_by_hop(&mut parts.headers);
    Ok(Request::from_parts(parts, body))
}

/// Check if header is hop-by-hop (RFC 7230 § 6.1)
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

/// Remove hop-by-hop headers, including those named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        if name != HOST {
            headers.remove(&name);
        }
    }

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(&name);
    }
}
