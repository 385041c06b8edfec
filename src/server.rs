//! Proxy engine
//!
//! Serves HTTP/1.1 proxy connections and runs every exchange through the
//! hook pipeline:
//!
//! accept-local → authenticate → (connect-decide | request-inspect →
//! upstream fetch → response-inspect)
//!
//! Decrypted exchanges from intercepted tunnels re-enter the same
//! inspection function through [`ExchangeHandler`].

use crate::auth::{
    challenge_response, Credentials, CredentialsError, ProxyAuthenticator, ProxyCredentials,
};
use crate::body::{closing_response, empty, incoming, text_response, watch_errors, ProxyBody};
use crate::context::ProxyContext;
use crate::error::{ErrorKind, ProxyError, Stage};
use crate::hooks::{ConnectAction, Hooks, RequestHead};
use crate::http_client::{Fetch, UpstreamClient};
use crate::metered::{IoTimeouts, MeteredListener, TlsMeteredListener};
use crate::mitm::tunnel::{ExchangeHandler, TunnelManager, TunnelTarget};
use crate::mitm::{CertificateAuthority, UpstreamTlsConfig};
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Already-loaded engine settings
#[derive(Clone)]
pub struct EngineConfig {
    /// Proxy credentials; `None` leaves authentication to the auth hook
    pub credentials: Option<Credentials>,
    /// Signs interception certificates; `None` disables MITM
    pub ca: Option<Arc<CertificateAuthority>>,
    /// Verification settings for TLS upstreams
    pub upstream_tls: Arc<ClientConfig>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Deadlines applied to upstream connections
    pub upstream_timeouts: IoTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            ca: None,
            upstream_tls: UpstreamTlsConfig::new().client_config(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            upstream_timeouts: IoTimeouts::default(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("credentials", &self.credentials)
            .field("ca", &self.ca.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("upstream_timeouts", &self.upstream_timeouts)
            .finish()
    }
}

/// Parse and validate CONNECT authority (host:port)
/// Returns (host, port) or error message
pub fn parse_authority(authority: &str) -> Result<(String, u16), String> {
    // Split by last colon to handle IPv6 addresses like [::1]:443
    let parts: Vec<&str> = authority.rsplitn(2, ':').collect();

    if parts.len() != 2 {
        return Err("Authority must be in host:port format".to_string());
    }

    let port_str = parts[0];
    let host = parts[1];

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    let port: u16 = port_str.parse().map_err(|_| {
        format!(
            "Invalid port '{}': must be a number between 1 and 65535",
            port_str
        )
    })?;

    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    Ok((host.to_string(), port))
}

/// Hook-driven forward proxy
#[derive(Clone)]
pub struct ProxyEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    hooks: Hooks,
    registry: ConnectionRegistry,
    authenticator: ProxyAuthenticator,
    upstream: UpstreamClient,
    tunnels: TunnelManager,
}

impl ProxyEngine {
    /// Build an engine accounting into `registry` (the one returned by the
    /// listener it will serve)
    pub fn new(config: EngineConfig, hooks: Hooks, registry: ConnectionRegistry) -> Self {
        let authenticator =
            ProxyAuthenticator::new(registry.clone(), config.credentials, hooks.size_hook());
        let upstream = UpstreamClient::new(config.upstream_tls)
            .with_connect_timeout(config.connect_timeout)
            .with_timeouts(config.upstream_timeouts);
        let tunnels = TunnelManager::new(config.ca, upstream.clone())
            .with_handshake_timeout(config.handshake_timeout);

        info!(
            auth_required = authenticator.requires_credentials(),
            auth_hook = hooks.has_auth(),
            mitm = tunnels.can_intercept(),
            "Proxy engine created"
        );

        Self {
            inner: Arc::new(EngineInner {
                hooks,
                registry,
                authenticator,
                upstream,
                tunnels,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Wait up to `grace` for open connections to close
    ///
    /// Returns how many connections were still open when the wait ended.
    /// Each closed connection has delivered its bandwidth report by then.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.inner.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        self.inner.registry.len()
    }

    /// Serve until the process ends
    pub async fn serve(&self, listener: MeteredListener) {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accept and serve connections until `shutdown` resolves
    pub async fn serve_until<F>(&self, listener: MeteredListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.serve_connection(stream, remote).await;
                        });
                    }
                    Err(err) => self.inner.report(&ProxyContext::new("-"), &err),
                }
            }
        }
    }

    /// TLS-listener variant of [`Self::serve_until`]
    pub async fn serve_tls_until<F>(&self, listener: TlsMeteredListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let listener = Arc::new(listener);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    return;
                }
                accepted = listener.accept_tcp() => match accepted {
                    Ok((stream, remote)) => {
                        let engine = self.clone();
                        let listener = Arc::clone(&listener);
                        tokio::spawn(async move {
                            match listener.handshake(stream, remote).await {
                                Ok(tls) => engine.serve_connection(tls, remote).await,
                                Err(err) => engine
                                    .inner
                                    .report(&ProxyContext::new(remote.to_string()), &err),
                            }
                        });
                    }
                    Err(err) => self.inner.report(&ProxyContext::new("-"), &err),
                }
            }
        }
    }

    /// Serve one accepted connection until it closes
    pub async fn serve_connection<S>(&self, io: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let remote_key = remote.to_string();
        let service = service_fn(move |req: Request<Incoming>| {
            let inner = Arc::clone(&inner);
            let remote = remote_key.clone();
            async move { Ok::<_, Infallible>(inner.dispatch(&remote, req).await) }
        });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            debug!(remote = %remote, error = %e, "Connection ended with error");
            if let Some(err) = ProxyError::from_connection(e) {
                self.inner
                    .report(&ProxyContext::new(remote.to_string()), &err);
            }
        }
    }
}

impl std::fmt::Debug for ProxyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEngine")
            .field("hooks", &self.inner.hooks)
            .field("registry", &self.inner.registry)
            .field("tunnels", &self.inner.tunnels)
            .finish()
    }
}

impl EngineInner {
    fn report(&self, ctx: &ProxyContext, err: &ProxyError) {
        self.hooks.report_error(ctx, err);
    }

    async fn dispatch(
        self: &Arc<Self>,
        remote: &str,
        req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let mut ctx = ProxyContext::new(remote);
        let request = req.map(incoming);
        debug!(
            remote = %remote,
            session = ctx.session(),
            method = %request.method(),
            uri = %request.uri(),
            "Request received"
        );

        if let Some(response) = self.hooks.accept_local(&ctx, &request) {
            debug!(remote = %remote, uri = %request.uri(), "Handled locally");
            return response;
        }

        if !self.authenticate(&mut ctx, &request) {
            return challenge_response();
        }

        let record = self.registry.find(remote);
        if let Some(record) = &record {
            record.mark_requested();
        }

        let response = if request.method() == Method::CONNECT {
            self.handle_connect(ctx, request).await
        } else if request.uri().authority().is_none() {
            ctx.fail(Stage::Request);
            let err = ProxyError::protocol(
                Stage::Request,
                format!("relative URI {} not handled locally", request.uri()),
            );
            self.report(&ctx, &err);
            closing_response(StatusCode::BAD_REQUEST, "Bad Request")
        } else {
            self.exchange(&mut ctx, request, &self.upstream).await
        };

        if let Some(record) = &record {
            record.mark_responded();
        }
        response
    }

    /// Combine configured credentials with the auth hook and bind the
    /// outcome to the connection's accounting
    fn authenticate(&self, ctx: &mut ProxyContext, request: &Request<ProxyBody>) -> bool {
        let claimed = match ProxyCredentials::from_request(request) {
            Ok(claimed) => claimed,
            Err(CredentialsError::MissingHeader) => ProxyCredentials::default(),
            Err(e) => {
                debug!(remote = %ctx.remote(), error = %e, "Unusable proxy credentials");
                ProxyCredentials::default()
            }
        };

        let authorized =
            self.authenticator.check(&claimed) && self.hooks.authorize(ctx, &claimed);
        self.authenticator
            .bind(ctx.remote(), claimed.identity(), authorized);

        if authorized {
            ctx.set_user(claimed.identity());
        } else {
            ctx.fail(Stage::Auth);
            let err = ProxyError::auth(format!(
                "proxy authentication failed for user '{}'",
                claimed.identity()
            ));
            self.report(ctx, &err);
        }
        authorized
    }

    /// Request-inspect → fetch → response-inspect, shared by plain requests
    /// and intercepted tunnels
    async fn exchange(
        &self,
        ctx: &mut ProxyContext,
        mut request: Request<ProxyBody>,
        upstream: &dyn Fetch,
    ) -> Response<ProxyBody> {
        let synthetic = self.hooks.inspect_request(ctx, &mut request);
        let head = RequestHead::of(&request);

        let mut response = match synthetic {
            Some(response) => {
                debug!(remote = %ctx.remote(), uri = %head.uri, "Request answered by hook");
                response
            }
            None => match upstream.fetch(request).await {
                Ok(response) => self.watch_body(ctx, &head, response),
                Err(e) => {
                    ctx.fail(Stage::Request);
                    let summary = format!("fetching {} failed", head.uri);
                    let err = ProxyError::upstream(Stage::Request, summary).with_source(e);
                    self.report(ctx, &err);
                    return closing_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
                }
            },
        };

        self.hooks.inspect_response(ctx, &head, &mut response);
        debug!(
            remote = %ctx.remote(),
            method = %head.method,
            uri = %head.uri,
            status = response.status().as_u16(),
            "Exchange completed"
        );
        response
    }

    /// Report upstream bodies that break after the response head was sent
    fn watch_body(
        &self,
        ctx: &ProxyContext,
        head: &RequestHead,
        response: Response<ProxyBody>,
    ) -> Response<ProxyBody> {
        let hooks = self.hooks.clone();
        let ctx = ctx.clone();
        let uri = head.uri.clone();
        response.map(|body| {
            watch_errors(body, move |e| {
                let err = ProxyError::upstream(
                    Stage::Response,
                    format!("response body from {} failed", uri),
                )
                .with_source(e.to_string());
                hooks.report_error(&ctx, &err);
            })
        })
    }

    async fn handle_connect(
        self: &Arc<Self>,
        mut ctx: ProxyContext,
        mut request: Request<ProxyBody>,
    ) -> Response<ProxyBody> {
        let requested = match request.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                warn!(remote = %ctx.remote(), "[CONNECT] Missing authority");
                ctx.fail(Stage::Connect);
                let err = ProxyError::protocol(Stage::Connect, "CONNECT without authority");
                self.report(&ctx, &err);
                return closing_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };
        if let Err(msg) = parse_authority(&requested) {
            warn!(
                remote = %ctx.remote(),
                target = %requested,
                "[CONNECT] Invalid authority: {}",
                msg
            );
            ctx.fail(Stage::Connect);
            let err = ProxyError::protocol(
                Stage::Connect,
                format!("invalid CONNECT authority '{}': {}", requested, msg),
            );
            self.report(&ctx, &err);
            return closing_response(StatusCode::BAD_REQUEST, "Bad Request");
        }

        let decision = self.hooks.decide_connect(&ctx, &requested);
        let destination = decision.host.unwrap_or_else(|| requested.clone());
        ctx.set_connect(decision.action, destination.clone());
        info!(
            remote = %ctx.remote(),
            target = %requested,
            destination = %destination,
            action = %decision.action,
            "[CONNECT] Decision"
        );

        if decision.action != ConnectAction::Reject {
            if let Err(msg) = parse_authority(&destination) {
                let err =
                    ProxyError::connect(format!("invalid destination '{}': {}", destination, msg));
                self.report(&ctx, &err);
                return closing_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        }

        match decision.action {
            ConnectAction::Reject => text_response(StatusCode::FORBIDDEN, "Forbidden"),
            ConnectAction::Tunnel => {
                let upstream = match self.upstream.connect_tcp(&destination).await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        ctx.fail(Stage::Connect);
                        let err = ProxyError::new(
                            Stage::Connect,
                            ErrorKind::Upstream,
                            format!("connecting to {} failed", destination),
                        )
                        .with_source(e);
                        self.report(&ctx, &err);
                        return closing_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
                    }
                };

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    match hyper::upgrade::on(&mut request).await {
                        Ok(upgraded) => {
                            let relayed = inner.tunnels.relay(upgraded, upstream, &destination);
                            if let Err(e) = relayed.await {
                                debug!(
                                    target_host = %destination,
                                    error = %e,
                                    "Tunnel closed with error"
                                );
                                let summary = format!("tunnel to {} failed", destination);
                                inner.report(&ctx, &ProxyError::io(summary, e));
                            }
                        }
                        Err(e) => {
                            let err = ProxyError::connect("upgrade failed").with_source(e);
                            inner.report(&ctx, &err);
                        }
                    }
                });
                Response::new(empty())
            }
            ConnectAction::Mitm => {
                if !self.tunnels.can_intercept() {
                    ctx.fail(Stage::Connect);
                    let err = ProxyError::connect(
                        "interception requested but no certificate authority is configured",
                    );
                    self.report(&ctx, &err);
                    return closing_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
                }

                let target = TunnelTarget {
                    remote: ctx.remote().to_string(),
                    requested,
                    destination,
                    user: ctx.user().map(str::to_string),
                    action: ConnectAction::Mitm,
                };
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let upgraded = match hyper::upgrade::on(&mut request).await {
                        Ok(upgraded) => upgraded,
                        Err(e) => {
                            let err = ProxyError::connect("upgrade failed").with_source(e);
                            inner.report(&ctx, &err);
                            return;
                        }
                    };
                    let handler: Arc<dyn ExchangeHandler> = inner.clone();
                    if let Err(e) = inner.tunnels.intercept(upgraded, target, handler).await {
                        ctx.fail(Stage::Connect);
                        let err = ProxyError::connect("interception failed").with_source(e);
                        inner.report(&ctx, &err);
                    }
                });
                Response::new(empty())
            }
        }
    }
}

#[async_trait]
impl ExchangeHandler for EngineInner {
    async fn handle_exchange(
        &self,
        target: &TunnelTarget,
        request: Request<ProxyBody>,
        upstream: &dyn Fetch,
    ) -> Response<ProxyBody> {
        let mut ctx = tunnel_context(target);
        let record = self.registry.find(&target.remote);
        if let Some(record) = &record {
            record.mark_requested();
        }

        let response = self.exchange(&mut ctx, request, upstream).await;

        if let Some(record) = &record {
            record.mark_responded();
        }
        response
    }

    fn report_tunnel_error(&self, target: &TunnelTarget, err: &ProxyError) {
        self.report(&tunnel_context(target), err);
    }
}

fn tunnel_context(target: &TunnelTarget) -> ProxyContext {
    ProxyContext::for_tunnel(
        target.remote.clone(),
        target.action,
        target.destination.clone(),
        target.user.clone(),
    )
}
