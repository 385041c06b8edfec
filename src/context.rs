//! Per-exchange state threaded through the hooks

use crate::error::Stage;
use crate::hooks::ConnectAction;
use http::Extensions;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// State for one request/response exchange
///
/// A MITM tunnel carries many exchanges; each gets its own context that
/// inherits the tunnel's connect decision.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    remote: String,
    session: u64,
    connect_action: Option<ConnectAction>,
    connect_host: Option<String>,
    user: Option<String>,
    failed_stage: Option<Stage>,
    user_data: Extensions,
}

impl ProxyContext {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            connect_action: None,
            connect_host: None,
            user: None,
            failed_stage: None,
            user_data: Extensions::new(),
        }
    }

    /// Context for an exchange decoded from inside a CONNECT tunnel
    pub fn for_tunnel(
        remote: impl Into<String>,
        action: ConnectAction,
        host: impl Into<String>,
        user: Option<String>,
    ) -> Self {
        let mut ctx = Self::new(remote);
        ctx.connect_action = Some(action);
        ctx.connect_host = Some(host.into());
        ctx.user = user;
        ctx
    }

    /// Registry key of the owning connection
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn connect_action(&self) -> Option<ConnectAction> {
        self.connect_action
    }

    /// Destination of the tunnel this exchange belongs to
    pub fn connect_host(&self) -> Option<&str> {
        self.connect_host.as_deref()
    }

    pub(crate) fn set_connect(&mut self, action: ConnectAction, host: impl Into<String>) {
        self.connect_action = Some(action);
        self.connect_host = Some(host.into());
    }

    /// Authenticated identity, once known
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub(crate) fn set_user(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        self.failed_stage
    }

    pub(crate) fn fail(&mut self, stage: Stage) {
        self.failed_stage = Some(stage);
    }

    /// Correlation data set by hooks
    pub fn user_data(&self) -> &Extensions {
        &self.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut Extensions {
        &mut self.user_data
    }
}
