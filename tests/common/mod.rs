//! Shared fixtures for the end-to-end proxy tests
//!
//! Everything runs in-process over loopback: a plain hyper upstream, a TLS
//! upstream with a certificate from its own test CA, a TCP echo server for
//! opaque tunnels and a `ProxyEngine` bound to an ephemeral port.

#![allow(dead_code)]

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use meterproxy::mitm::UpstreamTlsConfig;
use meterproxy::{
    BandwidthReport, CertificateAuthority, ConnectionRegistry, EngineConfig, ErrorKind, Hooks,
    MeteredListener, ProxyCredentials, ProxyEngine,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const USER: &str = "alice";
pub const PASSWORD: &str = "s3cret";
pub const UPSTREAM_BODY: &str = "hello from upstream";

pub type ClientBody = Empty<Bytes>;

/// Collects every bandwidth report the engine emits
#[derive(Clone, Default)]
pub struct Reports(Arc<Mutex<Vec<BandwidthReport>>>);

impl Reports {
    pub fn hooks(&self) -> Hooks {
        let sink = self.clone();
        Hooks::new().on_size(move |report| sink.0.lock().unwrap().push(report.clone()))
    }

    pub fn attach(&self, hooks: Hooks) -> Hooks {
        let sink = self.clone();
        hooks.on_size(move |report| sink.0.lock().unwrap().push(report.clone()))
    }

    pub fn snapshot(&self) -> Vec<BandwidthReport> {
        self.0.lock().unwrap().clone()
    }

    /// Wait until at least `count` reports arrived
    pub async fn wait_for(&self, count: usize) -> Vec<BandwidthReport> {
        for _ in 0..200 {
            let reports = self.snapshot();
            if reports.len() >= count {
                return reports;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} bandwidth reports, got {:?}", count, self.snapshot());
    }
}

/// Collects `(stage, kind)` for every error the engine reports
#[derive(Clone, Default)]
pub struct Errors(Arc<Mutex<Vec<(&'static str, ErrorKind)>>>);

impl Errors {
    pub fn attach(&self, hooks: Hooks) -> Hooks {
        let sink = self.clone();
        hooks.on_error(move |_ctx, err| {
            sink.0.lock().unwrap().push((err.stage().as_str(), err.kind()))
        })
    }

    pub fn snapshot(&self) -> Vec<(&'static str, ErrorKind)> {
        self.0.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<(&'static str, ErrorKind)> {
        for _ in 0..200 {
            let errors = self.snapshot();
            if errors.len() >= count {
                return errors;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} errors, got {:?}", count, self.snapshot());
    }
}

/// Records the order in which hooks ran
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<&'static str>>>);

impl Trace {
    pub fn push(&self, stage: &'static str) {
        self.0.lock().unwrap().push(stage);
    }

    pub fn snapshot(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, stage: &str) -> usize {
        self.snapshot().iter().filter(|s| **s == stage).count()
    }
}

pub async fn wait_until_empty(registry: &ConnectionRegistry) {
    for _ in 0..200 {
        if registry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry still holds connections: {:?}", registry);
}

pub fn credentials_header() -> String {
    ProxyCredentials::new(USER, PASSWORD).to_header_value()
}

pub fn config_with_credentials() -> EngineConfig {
    EngineConfig {
        credentials: Some(meterproxy::Credentials::new(USER, PASSWORD)),
        connect_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

/// Proxy under test
pub struct TestProxy {
    pub addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub engine: ProxyEngine,
}

pub async fn spawn_proxy(config: EngineConfig, hooks: Hooks) -> TestProxy {
    let (listener, registry) = MeteredListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = ProxyEngine::new(config, hooks, registry.clone());

    let serving = engine.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    TestProxy {
        addr,
        registry,
        engine,
    }
}

async fn upstream_service(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let saw_proxy_auth = req.headers().contains_key(http::header::PROXY_AUTHORIZATION);
    let target = format!("{} {}", req.method(), req.uri());
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("x-upstream-target", target)
        .header("x-saw-proxy-auth", if saw_proxy_auth { "yes" } else { "no" })
        .body(Full::new(Bytes::from_static(UPSTREAM_BODY.as_bytes())))
        .unwrap())
}

/// Plain HTTP/1.1 origin server
pub async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_service))
                    .await;
            });
        }
    });
    addr
}

/// HTTPS origin server whose certificate is issued by `ca` for 127.0.0.1
pub async fn spawn_tls_upstream(ca: &CertificateAuthority) -> SocketAddr {
    let issued = ca.get_or_generate("127.0.0.1").await.unwrap();
    let acceptor = TlsAcceptor::from(issued.server_config());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(upstream_service))
                    .await;
            });
        }
    });
    addr
}

/// Origin that promises 100 body bytes, sends 5 and hangs up
pub async fn spawn_truncating_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhello")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// TCP server echoing everything back until the peer closes
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn trusting(ca: &CertificateAuthority) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(ca.ca_certificate_der()).unwrap();
    roots
}

/// Engine upstream settings trusting only `ca`
pub fn upstream_tls_trusting(ca: &CertificateAuthority) -> Arc<ClientConfig> {
    UpstreamTlsConfig::with_roots(trusting(ca)).client_config()
}

/// HTTP/1.1 client connection to the proxy
pub async fn connect_client(proxy: SocketAddr) -> SendRequest<ClientBody> {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });
    sender
}

pub fn proxy_get(uri: &str, auth: Option<&str>) -> Request<ClientBody> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(http::header::PROXY_AUTHORIZATION, auth);
    }
    builder.body(Empty::new()).unwrap()
}

pub fn connect_request(target: SocketAddr, auth: Option<&str>) -> Request<ClientBody> {
    let mut builder = Request::builder()
        .method(Method::CONNECT)
        .uri(target.to_string());
    if let Some(auth) = auth {
        builder = builder.header(http::header::PROXY_AUTHORIZATION, auth);
    }
    builder.body(Empty::new()).unwrap()
}

pub async fn send(
    sender: &mut SendRequest<ClientBody>,
    request: Request<ClientBody>,
) -> (Response<()>, Bytes) {
    sender.ready().await.unwrap();
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (Response::from_parts(parts, ()), body)
}

/// Open a CONNECT tunnel through the proxy and return the raw stream
pub async fn open_tunnel(
    proxy: SocketAddr,
    target: SocketAddr,
) -> TokioIo<hyper::upgrade::Upgraded> {
    let mut sender = connect_client(proxy).await;
    let auth = credentials_header();
    sender.ready().await.unwrap();
    let response = sender
        .send_request(connect_request(target, Some(&auth)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    TokioIo::new(hyper::upgrade::on(response).await.unwrap())
}

/// TLS client over an established tunnel, trusting `ca` for 127.0.0.1
pub async fn tls_over_tunnel(
    tunnel: TokioIo<hyper::upgrade::Upgraded>,
    ca: &CertificateAuthority,
) -> SendRequest<ClientBody> {
    let config = ClientConfig::builder()
        .with_root_certificates(trusting(ca))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("127.0.0.1").unwrap().to_owned();
    let tls = connector.connect(server_name, tunnel).await.unwrap();

    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

/// Write raw bytes, then read until the proxy closes the connection
pub async fn raw_exchange(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    response
}
