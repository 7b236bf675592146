//! End-to-end scenario 1 from the spec's testable-properties section:
//! authenticate, dial direct mode against a live server handler, and
//! round-trip bytes through a real TCP echo target.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use warren_core::{
    dial::{Dialer, Endpoint},
    stream::TunnelIo,
};
use warren_server::Handler;
use warren_serverhelper::{AuthKey, DefaultRealIp, StaticKeyAuthenticator};

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"22").await.unwrap();
        let mut buf = [0u8; 3];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"333");
        let mut rest = Vec::new();
        sock.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        sock.write_all(b"4444").await.unwrap();
        sock.shutdown().await.unwrap();
    });
    addr
}

async fn spawn_tunnel_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let auth = StaticKeyAuthenticator::new(AuthKey::new("12345"));
    let authenticator: warren_server::handler::Authenticator =
        Arc::new(move |ip, presented| auth.authenticate(ip, presented));
    let handler = Arc::new(Handler::new("/proxy", authenticator, Arc::new(DefaultRealIp)));
    tokio::spawn(async move {
        loop {
            let Ok((sock, peer)) = listener.accept().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.serve_connection(sock, peer).await });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_mode_echoes_bytes_end_to_end() {
    let echo_addr = spawn_echo_server().await;
    let tunnel_addr = spawn_tunnel_server().await;

    let endpoint = Endpoint::parse(&format!("ws://{tunnel_addr}/proxy")).unwrap();
    let dialer = Dialer::new(None);
    let conn = dialer
        .dial(&endpoint, "12345", "tcp", &echo_addr.to_string())
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"22");

    conn.write(b"333").await.unwrap();
    conn.close_write().await.unwrap();

    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"4444");
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_failure_surfaces_401_in_handshake_error() {
    let tunnel_addr = spawn_tunnel_server().await;
    let endpoint = Endpoint::parse(&format!("ws://{tunnel_addr}/proxy")).unwrap();
    let dialer = Dialer::new(None);
    let err = dialer
        .dial(&endpoint, "11111", "tcp", "127.0.0.1:1")
        .await
        .unwrap_err();
    assert!(err.contains("401"));
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_then_promote_echoes_bytes() {
    let echo_addr = spawn_echo_server().await;
    let tunnel_addr = spawn_tunnel_server().await;

    let endpoint = Endpoint::parse(&format!("ws://{tunnel_addr}/proxy")).unwrap();
    let dialer = Dialer::new(None);
    let on_error: warren_core::dial::OnIdleError = Arc::new(|_session| {});
    let idle = dialer.dial_idle(&endpoint, "12345", on_error).await.unwrap();
    let conn = idle.dial("tcp", &echo_addr.to_string()).await.unwrap();

    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"22");
    conn.write(b"333").await.unwrap();
    conn.close_write().await.unwrap();
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"4444");
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
}
