//! Hook registration surface
//!
//! Every slot is optional. The engine consults them in a fixed order per
//! exchange: accept-local, authenticate, connect-decide (CONNECT only),
//! request-inspect, upstream fetch, response-inspect. `on_error` and
//! `on_size` are diagnostic sinks whose return value never steers control
//! flow.

use crate::auth::{BandwidthReport, ProxyCredentials};
use crate::body::ProxyBody;
use crate::context::ProxyContext;
use crate::error::ProxyError;
use http::{HeaderMap, Method, Request, Response, Uri, Version};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub type ErrorHook = Arc<dyn Fn(&ProxyContext, &ProxyError) + Send + Sync>;
pub type AcceptHook =
    Arc<dyn Fn(&ProxyContext, &Request<ProxyBody>) -> Option<Response<ProxyBody>> + Send + Sync>;
pub type AuthHook = Arc<dyn Fn(&ProxyContext, &ProxyCredentials) -> bool + Send + Sync>;
pub type ConnectHook = Arc<dyn Fn(&ProxyContext, &str) -> ConnectDecision + Send + Sync>;
pub type RequestHook = Arc<
    dyn Fn(&mut ProxyContext, &mut Request<ProxyBody>) -> Option<Response<ProxyBody>>
        + Send
        + Sync,
>;
pub type ResponseHook =
    Arc<dyn Fn(&mut ProxyContext, &RequestHead, &mut Response<ProxyBody>) + Send + Sync>;
pub type SizeHook = Arc<dyn Fn(&BandwidthReport) + Send + Sync>;

/// What to do with a CONNECT tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectAction {
    /// Terminate TLS and inspect the decrypted exchanges
    Mitm,
    /// Relay bytes without inspection
    Tunnel,
    /// Refuse the CONNECT
    Reject,
}

impl ConnectAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectAction::Mitm => "mitm",
            ConnectAction::Tunnel => "tunnel",
            ConnectAction::Reject => "reject",
        }
    }
}

impl fmt::Display for ConnectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connect-decide outcome, optionally rewriting the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectDecision {
    pub action: ConnectAction,
    pub host: Option<String>,
}

impl ConnectDecision {
    pub fn mitm() -> Self {
        Self {
            action: ConnectAction::Mitm,
            host: None,
        }
    }

    pub fn tunnel() -> Self {
        Self {
            action: ConnectAction::Tunnel,
            host: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            action: ConnectAction::Reject,
            host: None,
        }
    }

    /// Replace the destination `host:port`
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

impl Default for ConnectDecision {
    fn default() -> Self {
        Self::tunnel()
    }
}

/// Snapshot of the request an upstream response answers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn of<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
        }
    }
}

/// Named callback slots passed to the engine at construction
#[derive(Clone, Default)]
pub struct Hooks {
    error: Option<ErrorHook>,
    accept: Option<AcceptHook>,
    auth: Option<AuthHook>,
    connect: Option<ConnectHook>,
    request: Option<RequestHook>,
    response: Option<ResponseHook>,
    size: Option<SizeHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProxyContext, &ProxyError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_accept<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProxyContext, &Request<ProxyBody>) -> Option<Response<ProxyBody>>
            + Send
            + Sync
            + 'static,
    {
        self.accept = Some(Arc::new(f));
        self
    }

    pub fn on_auth<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProxyContext, &ProxyCredentials) -> bool + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(f));
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProxyContext, &str) -> ConnectDecision + Send + Sync + 'static,
    {
        self.connect = Some(Arc::new(f));
        self
    }

    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ProxyContext, &mut Request<ProxyBody>) -> Option<Response<ProxyBody>>
            + Send
            + Sync
            + 'static,
    {
        self.request = Some(Arc::new(f));
        self
    }

    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ProxyContext, &RequestHead, &mut Response<ProxyBody>) + Send + Sync + 'static,
    {
        self.response = Some(Arc::new(f));
        self
    }

    pub fn on_size<F>(mut self, f: F) -> Self
    where
        F: Fn(&BandwidthReport) + Send + Sync + 'static,
    {
        self.size = Some(Arc::new(f));
        self
    }

    /// Install an already shared size sink
    pub fn with_size_hook(mut self, hook: SizeHook) -> Self {
        self.size = Some(hook);
        self
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    pub fn size_hook(&self) -> Option<SizeHook> {
        self.size.clone()
    }

    pub(crate) fn report_error(&self, ctx: &ProxyContext, err: &ProxyError) {
        warn!(
            remote = %ctx.remote(),
            session = ctx.session(),
            stage = %err.stage(),
            error = %err,
            cause = ?err.cause().map(|c| c.to_string()),
            "Proxy error"
        );
        if let Some(hook) = &self.error {
            hook(ctx, err);
        }
    }

    pub(crate) fn accept_local(
        &self,
        ctx: &ProxyContext,
        request: &Request<ProxyBody>,
    ) -> Option<Response<ProxyBody>> {
        self.accept.as_ref().and_then(|hook| hook(ctx, request))
    }

    /// Absent hook authorizes everything
    pub(crate) fn authorize(&self, ctx: &ProxyContext, claimed: &ProxyCredentials) -> bool {
        self.auth.as_ref().map_or(true, |hook| hook(ctx, claimed))
    }

    /// Absent hook tunnels
    pub(crate) fn decide_connect(&self, ctx: &ProxyContext, host: &str) -> ConnectDecision {
        self.connect
            .as_ref()
            .map_or_else(ConnectDecision::default, |hook| hook(ctx, host))
    }

    pub(crate) fn inspect_request(
        &self,
        ctx: &mut ProxyContext,
        request: &mut Request<ProxyBody>,
    ) -> Option<Response<ProxyBody>> {
        self.request.as_ref().and_then(|hook| hook(ctx, request))
    }

    pub(crate) fn inspect_response(
        &self,
        ctx: &mut ProxyContext,
        head: &RequestHead,
        response: &mut Response<ProxyBody>,
    ) {
        if let Some(hook) = &self.response {
            hook(ctx, head, response);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("error", &self.error.is_some())
            .field("accept", &self.accept.is_some())
            .field("auth", &self.auth.is_some())
            .field("connect", &self.connect.is_some())
            .field("request", &self.request.is_some())
            .field("response", &self.response.is_some())
            .field("size", &self.size.is_some())
            .finish()
    }
}
