use anyhow::{Context, Result};
use http::header::{HeaderValue, VIA};
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};

use meterproxy::body::text_response;
use meterproxy::config::ProxyConfig;
use meterproxy::logger::{init_tracing, BandwidthLedger};
use meterproxy::tls::{create_tls_acceptor, read_ca_pem};
use meterproxy::{
    CertificateAuthority, ConnectDecision, Hooks, MeteredListener, ProxyEngine, TlsMeteredListener,
};

/// How long shutdown waits for open connections before the final flush
const DRAIN_GRACE: Duration = Duration::from_secs(30);

const INFO_BANNER: &str = concat!("meterproxy ", env!("CARGO_PKG_VERSION"), "\n");

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = ProxyConfig::from_env()?;
    init_tracing(config.log_json);

    info!("Starting meterproxy {}...", meterproxy::VERSION);
    debug!(config = ?config, "Configuration loaded");

    if config.credentials().is_none() {
        warn!("PROXY_USERNAME/PROXY_PASSWORD not set, proxy accepts unauthenticated clients");
    }

    let ca = Arc::new(load_ca(&config)?);

    // Bandwidth ledger receives every size report
    let ledger = BandwidthLedger::new(config.ledger_batch_size, config.ledger_flush_interval());
    let flush_task = ledger.start_background_flush();
    info!(
        "Bandwidth ledger started (batch_size={}, interval={}s)",
        config.ledger_batch_size, config.ledger_flush_interval_secs
    );

    let hooks = build_hooks(Arc::clone(&ledger));
    let addr = config.listen_addr()?;

    let engine = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => {
            let acceptor = create_tls_acceptor(cert, key)?;
            let (listener, registry) = TlsMeteredListener::bind(addr, acceptor)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            let listener = listener
                .with_timeouts(config.io_timeouts())
                .with_handshake_timeout(config.handshake_timeout());
            info!("Listening on {} (TLS)", addr);

            let engine = ProxyEngine::new(config.engine_config(Some(ca)), hooks, registry);
            engine.serve_tls_until(listener, shutdown_signal()).await;
            engine
        }
        _ => {
            let (listener, registry) = MeteredListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            let listener = listener.with_timeouts(config.io_timeouts());
            info!("Listening on {}", addr);

            let engine = ProxyEngine::new(config.engine_config(Some(ca)), hooks, registry);
            engine.serve_until(listener, shutdown_signal()).await;
            engine
        }
    };

    // Connections report on close, so drain before the last flush
    let open = engine.drain(DRAIN_GRACE).await;
    if open > 0 {
        warn!(open, "Connections still open at shutdown, their reports are lost");
    }

    flush_task.abort();
    let flushed = ledger.flush();
    info!(flushed, "Shutdown complete");
    Ok(())
}

/// Load the configured CA or generate one for this run
fn load_ca(config: &ProxyConfig) -> Result<CertificateAuthority> {
    match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let (cert_pem, key_pem) = read_ca_pem(cert_path, key_path)?;
            let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem)
                .with_context(|| format!("Failed to load CA from {}", cert_path))?;
            info!(path = %cert_path, "Interception CA loaded");
            Ok(ca)
        }
        _ => {
            let ca = CertificateAuthority::generate("meterproxy CA")
                .context("Failed to generate ephemeral CA")?;
            info!(
                "Ephemeral CA certificate (install in clients to allow interception):\n{}",
                ca.ca_certificate_pem()
            );
            Ok(ca)
        }
    }
}

fn build_hooks(ledger: Arc<BandwidthLedger>) -> Hooks {
    Hooks::new()
        .on_accept(|_ctx, request| {
            let local = request.uri().authority().is_none()
                && request.method() == Method::GET
                && request.uri().path() == "/info";
            local.then(|| text_response(StatusCode::OK, INFO_BANNER))
        })
        .on_connect(|_ctx, _host| ConnectDecision::mitm())
        .on_request(|ctx, request| {
            info!(
                remote = %ctx.remote(),
                user = ctx.user().unwrap_or("-"),
                method = %request.method(),
                uri = %request.uri(),
                "Proxying request"
            );
            None
        })
        .on_response(|_ctx, _head, response| {
            response
                .headers_mut()
                .append(VIA, HeaderValue::from_static("meterproxy"));
        })
        .on_error(|ctx, err| {
            warn!(
                remote = %ctx.remote(),
                stage = %err.stage(),
                kind = ?err.kind(),
                "Request failed: {}",
                err
            );
        })
        .with_size_hook(ledger.into_hook())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
