//! Tunnel Manager - CONNECT relay and interception
//!
//! Once the engine has answered a CONNECT with "200 Connection Established"
//! the client stream is handed here, either to be relayed as opaque bytes or
//! to be intercepted. Interception terminates TLS with an issued certificate
//! (or serves plaintext when the client does not start a TLS handshake) and
//! feeds every decoded exchange back into the engine through
//! [`ExchangeHandler`].

use crate::body::{closing_response, incoming, ProxyBody};
use crate::error::{ProxyError, Stage};
use crate::hooks::ConnectAction;
use crate::http_client::{Fetch, TunnelUpstream, UpstreamClient};
use crate::metered::MeteredStream;
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::error::{MitmError, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// First byte of a TLS handshake record
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Where an intercepted tunnel leads
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    /// Registry key of the client connection
    pub remote: String,
    /// `host:port` the client asked for
    pub requested: String,
    /// `host:port` actually dialed (after any rewrite by the connect hook)
    pub destination: String,
    /// Identity authenticated on the CONNECT
    pub user: Option<String>,
    pub action: ConnectAction,
}

impl TunnelTarget {
    fn requested_host(&self) -> &str {
        host_of(&self.requested)
    }

    fn destination_host(&self) -> &str {
        host_of(&self.destination)
    }
}

fn host_of(authority: &str) -> &str {
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}

/// Consumer of decrypted exchanges
#[async_trait]
pub trait ExchangeHandler: Send + Sync + 'static {
    /// Run one exchange through inspection, fetching from `upstream`
    async fn handle_exchange(
        &self,
        target: &TunnelTarget,
        request: Request<ProxyBody>,
        upstream: &dyn Fetch,
    ) -> Response<ProxyBody>;

    /// Report a failure outside any single exchange
    fn report_tunnel_error(&self, target: &TunnelTarget, err: &ProxyError);
}

/// Client stream with bytes already read off it pushed back in front
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Drives CONNECT tunnels after the 200 has been sent
pub struct TunnelManager {
    ca: Option<Arc<CertificateAuthority>>,
    upstream: UpstreamClient,
    handshake_timeout: Duration,
}

impl TunnelManager {
    pub fn new(ca: Option<Arc<CertificateAuthority>>, upstream: UpstreamClient) -> Self {
        Self {
            ca,
            upstream,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Whether interception is possible at all
    pub fn can_intercept(&self) -> bool {
        self.ca.is_some()
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Relay bytes between client and destination without parsing them
    pub async fn relay(
        &self,
        client: Upgraded,
        mut upstream: MeteredStream<TcpStream>,
        target: &str,
    ) -> io::Result<(u64, u64)> {
        let mut client = TokioIo::new(client);
        let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        info!(
            target_host = %target,
            bytes_up = up,
            bytes_down = down,
            "Tunnel completed"
        );
        Ok((up, down))
    }

    /// Intercept the tunnel and serve its exchanges through `handler`
    ///
    /// Every error returned here happened after the client was told the
    /// tunnel is established, so the caller can only close the connection.
    pub async fn intercept(
        &self,
        client: Upgraded,
        target: TunnelTarget,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<()> {
        let mut client = TokioIo::new(client);
        let mut first = vec![0u8; 1024];
        let n = client.read(&mut first).await?;
        if n == 0 {
            debug!(target_host = %target.requested, "Client closed tunnel before sending data");
            return Ok(());
        }
        first.truncate(n);
        let is_tls = first[0] == TLS_HANDSHAKE_RECORD;
        let client = PrefixedStream::new(Bytes::from(first), client);

        if is_tls {
            self.intercept_tls(client, target, handler).await
        } else {
            self.intercept_plain(client, target, handler).await
        }
    }

    async fn intercept_tls(
        &self,
        client: PrefixedStream<TokioIo<Upgraded>>,
        target: TunnelTarget,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<()> {
        let ca = self.ca.as_ref().ok_or_else(|| {
            MitmError::TlsConfigFailed("no certificate authority configured".into())
        })?;

        let issued = ca.get_or_generate(target.requested_host()).await?;
        let acceptor = TlsAcceptor::from(issued.server_config());

        let handshake = tokio::time::timeout(self.handshake_timeout, acceptor.accept(client));
        let client_tls = match handshake.await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                return Err(MitmError::tls_handshake(target.requested.clone(), e.to_string()))
            }
            Err(_) => {
                return Err(MitmError::tls_handshake(
                    target.requested.clone(),
                    "handshake timed out",
                ))
            }
        };
        debug!(target_host = %target.requested, "Client TLS established");

        let upstream = TunnelUpstream::connect(
            self.upstream.clone(),
            &target.destination,
            Some(target.destination_host()),
        )
        .await
        .map_err(|e| MitmError::upstream(target.destination.clone(), e.to_string()))?;

        info!(target_host = %target.requested, "MITM interception started");
        serve_exchanges(client_tls, "https", target, upstream, handler).await;
        Ok(())
    }

    async fn intercept_plain(
        &self,
        client: PrefixedStream<TokioIo<Upgraded>>,
        target: TunnelTarget,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<()> {
        let upstream = TunnelUpstream::connect(self.upstream.clone(), &target.destination, None)
            .await
            .map_err(|e| MitmError::upstream(target.destination.clone(), e.to_string()))?;

        info!(target_host = %target.requested, "Plaintext tunnel interception started");
        serve_exchanges(client, "http", target, upstream, handler).await;
        Ok(())
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("can_intercept", &self.can_intercept())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

async fn serve_exchanges<S>(
    io: S,
    scheme: &'static str,
    target: TunnelTarget,
    upstream: TunnelUpstream,
    handler: Arc<dyn ExchangeHandler>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let target = Arc::new(target);
    let upstream = Arc::new(upstream);
    let log_target = Arc::clone(&target);
    let reporter = Arc::clone(&handler);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let target = Arc::clone(&target);
        let upstream = Arc::clone(&upstream);
        async move {
            let response = match absolutize(req.map(incoming), scheme, &target.requested) {
                Ok(request) => handler.handle_exchange(&target, request, upstream.as_ref()).await,
                Err(e) => {
                    let err =
                        ProxyError::protocol(Stage::Request, "unusable request URI inside tunnel")
                            .with_source(e);
                    handler.report_tunnel_error(&target, &err);
                    closing_response(StatusCode::BAD_REQUEST, "Bad Request")
                }
            };
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!(
            target_host = %log_target.requested,
            error = %e,
            "Intercepted connection ended with error"
        );
        if let Some(err) = ProxyError::from_connection(e) {
            reporter.report_tunnel_error(&log_target, &err);
        }
    }
    debug!(target_host = %log_target.requested, "Intercepted connection closed");
}

/// Give a decrypted origin-form request its absolute URI
fn absolutize(
    request: Request<ProxyBody>,
    scheme: &str,
    authority: &str,
) -> std::result::Result<Request<ProxyBody>, http::Error> {
    let (mut parts, body) = request.into_parts();
    if parts.uri.scheme().is_none() {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path)
            .build()?;
    }
    Ok(Request::from_parts(parts, body))
}
