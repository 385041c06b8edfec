//! Pipeline error types
//!
//! Every failure that reaches a pipeline boundary is wrapped in a
//! [`ProxyError`] carrying the stage it happened in, so the error hook can
//! report it with a stable label.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Boxed underlying cause
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pipeline stage where an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Accept,
    Auth,
    Connect,
    Request,
    Response,
    Read,
    Write,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Accept => "accept",
            Stage::Auth => "auth",
            Stage::Connect => "connect",
            Stage::Request => "request",
            Stage::Response => "response",
            Stage::Read => "read",
            Stage::Write => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Listener-level failure, fatal to one accept attempt
    Accept,

    /// TLS negotiation failure, aborts the connection
    Handshake,

    /// Credential mismatch, yields a challenge response
    Auth,

    /// CONNECT or MITM establishment failure, aborts the tunnel
    Connect,

    /// Fetch-to-destination failure
    Upstream,

    /// Malformed request or unusable target, answered 400 or closed
    Protocol,

    /// Client connection I/O failure or deadline, closes the connection
    Io,
}

/// Tagged pipeline failure
#[derive(Debug, Error)]
#[error("{stage}: {summary}")]
pub struct ProxyError {
    stage: Stage,
    kind: ErrorKind,
    summary: String,
    #[source]
    source: Option<BoxError>,
}

impl ProxyError {
    pub fn new(stage: Stage, kind: ErrorKind, summary: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            summary: summary.into(),
            source: None,
        }
    }

    /// Attach the underlying cause
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn accept(summary: impl Into<String>) -> Self {
        Self::new(Stage::Accept, ErrorKind::Accept, summary)
    }

    pub fn handshake(stage: Stage, summary: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::Handshake, summary)
    }

    pub fn auth(summary: impl Into<String>) -> Self {
        Self::new(Stage::Auth, ErrorKind::Auth, summary)
    }

    pub fn connect(summary: impl Into<String>) -> Self {
        Self::new(Stage::Connect, ErrorKind::Connect, summary)
    }

    pub fn upstream(stage: Stage, summary: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::Upstream, summary)
    }

    pub fn protocol(stage: Stage, summary: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::Protocol, summary)
    }

    /// Transport failure, labelled read or write from the I/O error
    pub fn io(summary: impl Into<String>, err: io::Error) -> Self {
        Self::new(io_stage(&err), ErrorKind::Io, summary).with_source(err)
    }

    /// Classify a connection-level hyper error
    ///
    /// Returns `None` for errors raised by a body the engine produced, which
    /// have already been reported where the body failed.
    pub fn from_connection(err: hyper::Error) -> Option<Self> {
        if err.is_user() {
            return None;
        }
        if err.is_parse() || err.is_incomplete_message() {
            let summary = "malformed or truncated request";
            return Some(Self::protocol(Stage::Read, summary).with_source(err));
        }
        let stage = io_cause(&err).map_or(Stage::Read, io_stage);
        let failed = Self::new(stage, ErrorKind::Io, "client connection failed");
        Some(failed.with_source(err))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Underlying cause, if any
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

/// Read or write deadline elapsed on a metered stream
///
/// Carried inside the `io::Error` so callers can tell which direction
/// timed out.
#[derive(Debug, Clone, Copy, Error)]
#[error("{direction} timed out after {timeout:?}")]
pub struct DeadlineElapsed {
    pub direction: Stage,
    pub timeout: Duration,
}

impl DeadlineElapsed {
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, self)
    }
}

/// Direction of a transport failure
pub fn io_stage(err: &io::Error) -> Stage {
    if let Some(deadline) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<DeadlineElapsed>())
    {
        return deadline.direction;
    }
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero => Stage::Write,
        _ => Stage::Read,
    }
}

fn io_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a io::Error> {
    let mut current = err.source();
    while let Some(cause) = current {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return Some(io);
        }
        current = cause.source();
    }
    None
}
