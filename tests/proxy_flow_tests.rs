//! End-to-end tests for plain forwarding, authentication and accounting

mod common;

use bytes::Bytes;
use common::*;
use http::header::{HeaderValue, PROXY_AUTHENTICATE};
use http::StatusCode;
use meterproxy::body::text_response;
use meterproxy::{
    ConnectDecision, EngineConfig, ErrorKind, Hooks, IoTimeouts, MeteredListener, ProxyCredentials,
    ProxyEngine,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_authorized_request_is_forwarded_and_reported() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let proxy = spawn_proxy(config_with_credentials(), reports.hooks()).await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, body) = send(
        &mut client,
        proxy_get(&format!("http://{}/hello?x=1", upstream), Some(&auth)),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, Bytes::from_static(UPSTREAM_BODY.as_bytes()));
    // Forwarded in origin form without the proxy credentials
    assert_eq!(response.headers()["x-upstream-target"], "GET /hello?x=1");
    assert_eq!(response.headers()["x-saw-proxy-auth"], "no");

    drop(client);
    let reports = reports.wait_for(1).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].user, USER);
    assert!(reports[0].bytes_read > 0);
    assert!(reports[0].bytes_written > 0);
    assert!(reports[0].remote.starts_with("127.0.0.1:"));
    wait_until_empty(&proxy.registry).await;
}

#[tokio::test]
async fn test_wrong_password_gets_challenge_and_no_report() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let proxy = spawn_proxy(config_with_credentials(), reports.hooks()).await;

    let mut client = connect_client(proxy.addr).await;
    let wrong = ProxyCredentials::new(USER, "wrongpass").to_header_value();
    let (response, _) = send(
        &mut client,
        proxy_get(&format!("http://{}/", upstream), Some(&wrong)),
    )
    .await;

    assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(
        response.headers()[PROXY_AUTHENTICATE],
        HeaderValue::from_static("Basic realm=\"meterproxy\"")
    );

    drop(client);
    wait_until_empty(&proxy.registry).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(reports.snapshot().is_empty());
}

#[tokio::test]
async fn test_missing_credentials_are_challenged() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let proxy = spawn_proxy(config_with_credentials(), reports.hooks()).await;

    let mut client = connect_client(proxy.addr).await;
    let (response, _) = send(&mut client, proxy_get(&format!("http://{}/", upstream), None)).await;
    assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);

    drop(client);
    wait_until_empty(&proxy.registry).await;
    assert!(reports.snapshot().is_empty());
}

#[tokio::test]
async fn test_keep_alive_reports_cumulative_bytes_once() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let proxy = spawn_proxy(config_with_credentials(), reports.hooks()).await;
    let auth = credentials_header();
    let uri = format!("http://{}/same", upstream);

    // One exchange on its own connection
    let mut single = connect_client(proxy.addr).await;
    send(&mut single, proxy_get(&uri, Some(&auth))).await;
    drop(single);
    let first = reports.wait_for(1).await[0].clone();

    // Two identical exchanges on one connection
    let mut reused = connect_client(proxy.addr).await;
    send(&mut reused, proxy_get(&uri, Some(&auth))).await;
    send(&mut reused, proxy_get(&uri, Some(&auth))).await;
    drop(reused);
    let all = reports.wait_for(2).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reports.snapshot().len(), 2, "keep-alive connection reported once");
    let second = &all[1];
    assert_eq!(second.bytes_read, first.bytes_read * 2);
    assert_eq!(second.bytes_written, first.bytes_written * 2);
    wait_until_empty(&proxy.registry).await;
}

#[tokio::test]
async fn test_reported_bytes_match_wire_bytes() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let proxy = spawn_proxy(config_with_credentials(), reports.hooks()).await;

    let request = format!(
        "GET http://{up}/exact HTTP/1.1\r\nHost: {up}\r\n\
         Proxy-Authorization: {auth}\r\nConnection: close\r\n\r\n",
        up = upstream,
        auth = credentials_header()
    );
    let response = raw_exchange(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with(b"HTTP/1.1 200"));

    let reports = reports.wait_for(1).await;
    assert_eq!(reports[0].bytes_read, request.len() as u64);
    assert_eq!(reports[0].bytes_written, response.len() as u64);
}

#[tokio::test]
async fn test_garbage_input_is_neither_reported_nor_leaked() {
    let reports = Reports::default();
    let errors = Errors::default();
    let proxy = spawn_proxy(config_with_credentials(), errors.attach(reports.hooks())).await;

    let response = raw_exchange(proxy.addr, b"\x00\x01 not http at all\r\n\r\n").await;
    assert!(response.is_empty() || response.starts_with(b"HTTP/1.1 400"));

    wait_until_empty(&proxy.registry).await;
    assert!(reports.snapshot().is_empty());
    assert_eq!(errors.wait_for(1).await, vec![("read", ErrorKind::Protocol)]);
}

#[tokio::test]
async fn test_unauthenticated_default_reports_anonymous() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let proxy = spawn_proxy(EngineConfig::default(), reports.hooks()).await;

    let mut client = connect_client(proxy.addr).await;
    let (response, _) = send(&mut client, proxy_get(&format!("http://{}/", upstream), None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    drop(client);
    let reports = reports.wait_for(1).await;
    assert_eq!(reports[0].user, "anonymous");
}

#[tokio::test]
async fn test_auth_hook_combines_with_credentials() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let hooks = reports.attach(Hooks::new().on_auth(|_ctx, claimed| claimed.username == "bob"));
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    // Valid credentials, vetoed by the hook
    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, _) = send(
        &mut client,
        proxy_get(&format!("http://{}/", upstream), Some(&auth)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);

    drop(client);
    wait_until_empty(&proxy.registry).await;
    assert!(reports.snapshot().is_empty());
}

#[tokio::test]
async fn test_relative_uri_answers_bad_request() {
    let errors = Errors::default();
    let proxy = spawn_proxy(config_with_credentials(), errors.attach(Hooks::new())).await;

    let request = format!(
        "GET /nowhere HTTP/1.1\r\nHost: example.test\r\nProxy-Authorization: {}\r\n\r\n",
        credentials_header()
    );
    let response = raw_exchange(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with(b"HTTP/1.1 400"), "{}", String::from_utf8_lossy(&response));
    assert_eq!(
        errors.wait_for(1).await,
        vec![("request", ErrorKind::Protocol)]
    );
    wait_until_empty(&proxy.registry).await;
}

#[tokio::test]
async fn test_local_endpoint_answers_without_authentication() {
    let reports = Reports::default();
    let trace = Trace::default();
    let seen = trace.clone();
    let hooks = reports.attach(
        Hooks::new()
            .on_accept(|_ctx, request| {
                (request.uri().authority().is_none() && request.uri().path() == "/info")
                    .then(|| text_response(StatusCode::OK, "meterproxy info"))
            })
            .on_request(move |_ctx, _request| {
                seen.push("request");
                None
            }),
    );
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    let response = raw_exchange(
        proxy.addr,
        b"GET /info HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n",
    )
    .await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "{}", text);
    assert!(text.ends_with("meterproxy info"));

    wait_until_empty(&proxy.registry).await;
    assert!(reports.snapshot().is_empty());
    assert_eq!(trace.count("request"), 0);
}

#[tokio::test]
async fn test_upstream_failure_returns_bad_gateway() {
    let dead = closed_port().await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let trace = Trace::default();

    let sink = Arc::clone(&errors);
    let seen = trace.clone();
    let hooks = Hooks::new()
        .on_error(move |_ctx, err| {
            sink.lock().unwrap().push((err.stage().as_str(), err.kind()));
        })
        .on_response(move |_ctx, _head, _response| seen.push("response"));
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, _) = send(
        &mut client,
        proxy_get(&format!("http://{}/", dead), Some(&auth)),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        errors.lock().unwrap().as_slice(),
        &[("request", ErrorKind::Upstream)]
    );
    assert_eq!(trace.count("response"), 0);
}

#[tokio::test]
async fn test_request_hook_short_circuits_upstream() {
    let dead = closed_port().await;
    let hooks = Hooks::new()
        .on_request(|_ctx, _request| Some(text_response(StatusCode::OK, "synthetic")))
        .on_response(|_ctx, _head, response| {
            response
                .headers_mut()
                .insert("x-inspected", HeaderValue::from_static("yes"));
        });
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, body) = send(
        &mut client,
        proxy_get(&format!("http://{}/", dead), Some(&auth)),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"synthetic"));
    assert_eq!(response.headers()["x-inspected"], "yes");
}

#[tokio::test]
async fn test_request_hook_mutation_reaches_upstream() {
    let upstream = spawn_upstream().await;
    let hooks = Hooks::new().on_request(|_ctx, request| {
        *request.uri_mut() = format!(
            "http://{}/rewritten",
            request.uri().authority().map(|a| a.as_str()).unwrap_or_default()
        )
        .parse()
        .unwrap();
        None
    });
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, _) = send(
        &mut client,
        proxy_get(&format!("http://{}/original", upstream), Some(&auth)),
    )
    .await;
    assert_eq!(response.headers()["x-upstream-target"], "GET /rewritten");
}

#[tokio::test]
async fn test_hooks_run_in_fixed_order() {
    let upstream = spawn_upstream().await;
    let trace = Trace::default();
    let (t1, t2, t3, t4) = (trace.clone(), trace.clone(), trace.clone(), trace.clone());
    let hooks = Hooks::new()
        .on_accept(move |_ctx, _request| {
            t1.push("accept");
            None
        })
        .on_auth(move |_ctx, _claimed| {
            t2.push("auth");
            true
        })
        .on_request(move |_ctx, _request| {
            t3.push("request");
            None
        })
        .on_response(move |_ctx, _head, _response| t4.push("response"));
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    send(
        &mut client,
        proxy_get(&format!("http://{}/", upstream), Some(&auth)),
    )
    .await;

    assert_eq!(trace.snapshot(), vec!["accept", "auth", "request", "response"]);
}

#[tokio::test]
async fn test_opaque_tunnel_counts_without_inspection() {
    let echo = spawn_echo().await;
    let reports = Reports::default();
    let trace = Trace::default();
    let (t1, t2) = (trace.clone(), trace.clone());
    let hooks = reports.attach(
        Hooks::new()
            .on_connect(|_ctx, _host| ConnectDecision::tunnel())
            .on_request(move |_ctx, _request| {
                t1.push("request");
                None
            })
            .on_response(move |_ctx, _head, _response| t2.push("response")),
    );
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    let mut tunnel = open_tunnel(proxy.addr, echo).await;
    let payload = b"GET / HTTP/1.1\r\nHost: opaque\r\n\r\n";
    tunnel.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, payload);
    drop(tunnel);

    let reports = reports.wait_for(1).await;
    assert_eq!(reports[0].user, USER);
    assert!(reports[0].bytes_read > payload.len() as u64);
    assert!(reports[0].bytes_written > payload.len() as u64);
    assert_eq!(trace.count("request"), 0);
    assert_eq!(trace.count("response"), 0);
    wait_until_empty(&proxy.registry).await;
}

#[tokio::test]
async fn test_rejected_connect_answers_forbidden() {
    let echo = spawn_echo().await;
    let proxy = spawn_proxy(
        config_with_credentials(),
        Hooks::new().on_connect(|_ctx, _host| ConnectDecision::reject()),
    )
    .await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, _) = send(&mut client, connect_request(echo, Some(&auth))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_connect_to_unreachable_host_is_bad_gateway() {
    let dead = closed_port().await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let proxy = spawn_proxy(
        config_with_credentials(),
        Hooks::new().on_error(move |_ctx, err| sink.lock().unwrap().push(err.stage().as_str())),
    )
    .await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, _) = send(&mut client, connect_request(dead, Some(&auth))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(errors.lock().unwrap().as_slice(), &["connect"]);
}

#[tokio::test]
async fn test_connect_with_invalid_authority_is_bad_request() {
    let proxy = spawn_proxy(config_with_credentials(), Hooks::new()).await;

    let request = format!(
        "CONNECT nohost HTTP/1.1\r\nHost: nohost\r\nProxy-Authorization: {}\r\n\r\n",
        credentials_header()
    );
    let response = raw_exchange(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with(b"HTTP/1.1 400"), "{}", String::from_utf8_lossy(&response));
}

#[tokio::test]
async fn test_connect_rewrite_dials_decided_host() {
    let echo = spawn_echo().await;
    let dead = closed_port().await;
    let reports = Reports::default();
    let hooks = reports.attach(Hooks::new().on_connect(move |_ctx, _host| {
        ConnectDecision::tunnel().with_host(echo.to_string())
    }));
    let proxy = spawn_proxy(config_with_credentials(), hooks).await;

    // The client asks for a dead port, the hook redirects to the echo server
    let mut tunnel = open_tunnel(proxy.addr, dead).await;
    tunnel.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_mitm_without_authority_is_bad_gateway() {
    let echo = spawn_echo().await;
    let proxy = spawn_proxy(
        config_with_credentials(),
        Hooks::new().on_connect(|_ctx, _host| ConnectDecision::mitm()),
    )
    .await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    let (response, _) = send(&mut client, connect_request(echo, Some(&auth))).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_truncated_upstream_body_reaches_error_hook() {
    let upstream = spawn_truncating_upstream().await;
    let errors = Errors::default();
    let proxy = spawn_proxy(config_with_credentials(), errors.attach(Hooks::new())).await;

    let request = format!(
        "GET http://{}/partial HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: {}\r\n\r\n",
        upstream,
        upstream,
        credentials_header()
    );
    let response = raw_exchange(proxy.addr, request.as_bytes()).await;
    // Whatever made it out, the client never sees a 100 byte body
    assert!(!String::from_utf8_lossy(&response).contains("502"));
    assert!(response.len() < 100);

    assert_eq!(errors.wait_for(1).await, vec![("response", ErrorKind::Upstream)]);
    wait_until_empty(&proxy.registry).await;
}

#[tokio::test]
async fn test_client_read_deadline_reaches_error_hook() {
    let errors = Errors::default();
    let (listener, registry) = MeteredListener::bind("127.0.0.1:0").await.unwrap();
    let listener = listener.with_timeouts(IoTimeouts::new(Some(Duration::from_millis(100)), None));
    let addr = listener.local_addr().unwrap();
    let engine = ProxyEngine::new(
        config_with_credentials(),
        errors.attach(Hooks::new()),
        registry.clone(),
    );
    tokio::spawn(async move { engine.serve(listener).await });

    // Stall in the middle of a request head
    let mut stalled = TcpStream::connect(addr).await.unwrap();
    stalled
        .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: exa")
        .await
        .unwrap();
    let mut sink = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stalled.read_to_end(&mut sink)).await;

    assert_eq!(errors.wait_for(1).await, vec![("read", ErrorKind::Io)]);
    wait_until_empty(&registry).await;
}

#[tokio::test]
async fn test_invalid_connect_authority_is_reported() {
    let errors = Errors::default();
    let proxy = spawn_proxy(config_with_credentials(), errors.attach(Hooks::new())).await;

    let request = format!(
        "CONNECT example.test:0 HTTP/1.1\r\nHost: example.test:0\r\n\
         Proxy-Authorization: {}\r\n\r\n",
        credentials_header()
    );
    let response = raw_exchange(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with(b"HTTP/1.1 400"), "{}", String::from_utf8_lossy(&response));
    assert_eq!(errors.wait_for(1).await, vec![("connect", ErrorKind::Protocol)]);
}

#[tokio::test]
async fn test_drain_waits_for_open_connections_to_report() {
    let upstream = spawn_upstream().await;
    let reports = Reports::default();
    let proxy = spawn_proxy(config_with_credentials(), reports.hooks()).await;

    let mut client = connect_client(proxy.addr).await;
    let auth = credentials_header();
    send(&mut client, proxy_get(&format!("http://{}/", upstream), Some(&auth))).await;

    // Keep-alive connection still open: nothing reported yet
    assert_eq!(proxy.engine.drain(Duration::from_millis(100)).await, 1);
    assert!(reports.snapshot().is_empty());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);
    });
    assert_eq!(proxy.engine.drain(Duration::from_secs(5)).await, 0);
    assert_eq!(reports.snapshot().len(), 1);
}
