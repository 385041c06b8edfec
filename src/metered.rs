//! Metered listeners and streams
//!
//! Wraps a raw TCP listener so every accepted connection is registered in a
//! [`ConnectionRegistry`] and every byte crossing it is counted on its
//! [`ConnectionRecord`]. Counting happens on the byte count the transport
//! reports, never on requested buffer sizes.

use crate::error::{DeadlineElapsed, ProxyError, Stage};
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::Sleep;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Per-connection read/write deadlines
///
/// A deadline starts when an operation first has to wait and is cleared as
/// soon as it makes progress, so it bounds idle time, not transfer time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoTimeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl IoTimeouts {
    pub fn new(read: Option<Duration>, write: Option<Duration>) -> Self {
        Self { read, write }
    }
}

/// Stream wrapper that counts bytes into a [`ConnectionRecord`]
///
/// Dropping the stream closes the connection and finalizes the record.
pub struct MeteredStream<S> {
    inner: S,
    record: Arc<ConnectionRecord>,
    timeouts: IoTimeouts,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, record: Arc<ConnectionRecord>, timeouts: IoTimeouts) -> Self {
        Self {
            inner,
            record,
            timeouts,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Meter a stream that is not tracked by any registry (upstream legs)
    pub fn detached(inner: S, remote: impl Into<String>, timeouts: IoTimeouts) -> Self {
        Self::new(inner, Arc::new(ConnectionRecord::new(remote)), timeouts)
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Debug for MeteredStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredStream")
            .field("record", &self.record)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl<S> Drop for MeteredStream<S> {
    fn drop(&mut self) {
        self.record.finalize();
    }
}

fn poll_deadline(
    slot: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
    direction: Stage,
) -> Poll<io::Error> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };
    let deadline = slot.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    match deadline.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *slot = None;
            Poll::Ready(DeadlineElapsed { direction, timeout }.into_io_error())
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                this.record.add_read(buf.filled().len() - before);
                Poll::Ready(result)
            }
            Poll::Pending => {
                match poll_deadline(&mut this.read_deadline, this.timeouts.read, cx, Stage::Read) {
                    Poll::Ready(err) => Poll::Ready(Err(err)),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.write_deadline = None;
                this.record.add_written(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                let timeout = this.timeouts.write;
                match poll_deadline(&mut this.write_deadline, timeout, cx, Stage::Write) {
                    Poll::Ready(err) => Poll::Ready(Err(err)),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(n)) => {
                this.write_deadline = None;
                this.record.add_written(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                let timeout = this.timeouts.write;
                match poll_deadline(&mut this.write_deadline, timeout, cx, Stage::Write) {
                    Poll::Ready(err) => Poll::Ready(Err(err)),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Register a freshly accepted stream and arm its leak-free default finalizer
fn track(registry: &ConnectionRegistry, record: Arc<ConnectionRecord>) -> Arc<ConnectionRecord> {
    let cleanup = registry.clone();
    let remote = record.remote().to_string();
    let id = record.id();
    record.on_finalize(Box::new(move |_| {
        cleanup.pop_matching(&remote, id);
    }));
    registry.push(Arc::clone(&record));
    record
}

/// TCP listener whose accepted connections are registered and metered
pub struct MeteredListener {
    inner: TcpListener,
    registry: ConnectionRegistry,
    timeouts: IoTimeouts,
}

impl MeteredListener {
    /// Bind a listener and return it with its fresh registry
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<(Self, ConnectionRegistry)> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener))
    }

    /// Wrap an already bound listener
    pub fn from_listener(inner: TcpListener) -> (Self, ConnectionRegistry) {
        let registry = ConnectionRegistry::new();
        let listener = Self {
            inner,
            registry: registry.clone(),
            timeouts: IoTimeouts::default(),
        };
        (listener, registry)
    }

    pub fn with_timeouts(mut self, timeouts: IoTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Accept one connection, register it and return the metered stream
    pub async fn accept(&self) -> Result<(MeteredStream<TcpStream>, SocketAddr), ProxyError> {
        let (stream, addr) = self
            .inner
            .accept()
            .await
            .map_err(|e| ProxyError::accept("failed to accept connection").with_source(e))?;

        let record = track(&self.registry, Arc::new(ConnectionRecord::new(addr.to_string())));
        debug!(remote = %addr, conn_id = record.id(), "Connection accepted");

        Ok((MeteredStream::new(stream, record, self.timeouts), addr))
    }
}

/// TLS-terminating variant of [`MeteredListener`]
///
/// The handshake runs over the metered stream, so TLS bytes are counted, but
/// the record is only registered once the handshake succeeded.
pub struct TlsMeteredListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    registry: ConnectionRegistry,
    timeouts: IoTimeouts,
    handshake_timeout: Duration,
}

impl TlsMeteredListener {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        acceptor: TlsAcceptor,
    ) -> io::Result<(Self, ConnectionRegistry)> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, acceptor))
    }

    pub fn from_listener(inner: TcpListener, acceptor: TlsAcceptor) -> (Self, ConnectionRegistry) {
        let registry = ConnectionRegistry::new();
        let listener = Self {
            inner,
            acceptor,
            registry: registry.clone(),
            timeouts: IoTimeouts::default(),
            handshake_timeout: Duration::from_secs(10),
        };
        (listener, registry)
    }

    pub fn with_timeouts(mut self, timeouts: IoTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Accept one connection and complete its TLS handshake
    pub async fn accept(
        &self,
    ) -> Result<(TlsStream<MeteredStream<TcpStream>>, SocketAddr), ProxyError> {
        let (stream, addr) = self.accept_tcp().await?;
        let tls = self.handshake(stream, addr).await?;
        Ok((tls, addr))
    }

    /// Accept the raw TCP connection only
    ///
    /// Serving loops use this together with [`Self::handshake`] so a slow
    /// handshake never holds up the accept loop.
    pub async fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr), ProxyError> {
        self.inner
            .accept()
            .await
            .map_err(|e| ProxyError::accept("failed to accept connection").with_source(e))
    }

    /// Complete the TLS handshake and register the connection
    pub async fn handshake(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<TlsStream<MeteredStream<TcpStream>>, ProxyError> {
        let record = Arc::new(ConnectionRecord::new(addr.to_string()));
        let metered = MeteredStream::new(stream, Arc::clone(&record), self.timeouts);

        let tls = match tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(metered))
            .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                warn!(remote = %addr, error = %e, "TLS handshake failed");
                return Err(ProxyError::handshake(Stage::Accept, "TLS handshake failed")
                    .with_source(e));
            }
            Err(_) => {
                warn!(remote = %addr, timeout = ?self.handshake_timeout, "TLS handshake timed out");
                return Err(ProxyError::handshake(Stage::Accept, "TLS handshake timed out"));
            }
        };

        let record = track(&self.registry, record);
        info!(remote = %addr, conn_id = record.id(), "TLS connection accepted");
        Ok(tls)
    }
}
