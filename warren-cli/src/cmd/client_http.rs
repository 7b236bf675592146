//! `warren client-http`: HTTP CONNECT tunnel and forward-proxy ingress
//! atop the idle-session pool (spec §10.3). Grounded on
//! `client_http.go`'s `HttpProxyServer` (original source); parses
//! requests by hand with `httparse` rather than hijacking a framework
//! connection, mirroring that file's direct socket handling.

use std::sync::Arc;

use clap::Args;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use warren_core::{
    dial::{Dialer, Endpoint},
    error::BoxError,
    io_adapter::as_async_io,
    stream::{RawIo, TunnelIo},
};
use warren_pool::Pool;

use crate::{cmd::CommonArgs, config::ClientConfig};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Args)]
pub struct ClientHttpArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Number of pre-handshaken idle sessions to keep pooled.
    #[arg(long)]
    pub client_pool: Option<usize>,
    /// Custom DNS resolver for outbound endpoint resolution, as
    /// `udp://host:port` or `tcp://host:port`.
    #[arg(long)]
    pub client_resolver: Option<String>,
}

pub async fn run(args: ClientHttpArgs) -> Result<(), BoxError> {
    let mut cfg = args.common.resolve()?;
    cfg.client_pool = args.client_pool.or(cfg.client_pool);
    cfg.client_resolver = args.client_resolver.or(cfg.client_resolver);
    let cfg = ClientConfig::from_file(cfg)?;

    let endpoint = Endpoint::parse(&cfg.endpoint)?;
    let mut dialer = Dialer::new(super::tls_connector_if_needed(&endpoint)?);
    if let Some(resolver) = super::build_resolver(cfg.client_resolver.as_deref())? {
        dialer = dialer.with_resolver(resolver);
    }
    let pool = Pool::new(endpoint, cfg.key.clone(), cfg.client_pool, dialer);

    let listener = TcpListener::bind(&cfg.listen).await?;
    tracing::info!(listen = %cfg.listen, "client-http listening");

    loop {
        let (sock, peer) = listener.accept().await?;
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(err) = handle_conn(sock, peer, pool).await {
                tracing::debug!(%peer, %err, "connection ended with error");
            }
        });
    }
}

struct RequestHead {
    method: String,
    target: String,
    version: u8,
    headers: Vec<(String, String)>,
    body_start: usize,
}

async fn read_request_head(sock: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<Option<RequestHead>> {
    loop {
        if let Some(pos) = find_head_end(buf) {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            return match req.parse(&buf[..pos]) {
                Ok(httparse::Status::Complete(_)) => Ok(Some(RequestHead {
                    method: req.method.unwrap_or_default().to_owned(),
                    target: req.path.unwrap_or_default().to_owned(),
                    version: req.version.unwrap_or(1),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| (h.name.to_owned(), String::from_utf8_lossy(h.value).into_owned()))
                        .collect(),
                    body_start: pos,
                })),
                _ => Ok(None),
            };
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(std::io::Error::other("request head too large"));
        }
        let mut chunk = [0u8; 4096];
        let n = sock.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn handle_conn(mut sock: TcpStream, peer: std::net::SocketAddr, pool: Arc<Pool>) -> Result<(), BoxError> {
    let mut buf = Vec::with_capacity(4096);
    let Some(head) = read_request_head(&mut sock, &mut buf).await? else {
        return Ok(());
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(sock, peer, &head.target, pool).await
    } else {
        handle_forward(sock, peer, head, buf, pool).await
    }
}

async fn handle_connect(
    mut sock: TcpStream,
    peer: std::net::SocketAddr,
    target: &str,
    pool: Arc<Pool>,
) -> Result<(), BoxError> {
    let conn = match pool.dial("tcp", target).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(%peer, target, %err, "server request err");
            let body = err.to_string();
            let resp = format!("HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\n\r\n{body}", body.len());
            let _ = sock.write_all(resp.as_bytes()).await;
            return Ok(());
        }
    };

    tracing::info!(%peer, target, "connected");
    sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;

    let client_io = Arc::new(RawIo::new(sock));
    let stats = warren_core::bridge::bridge(conn.as_ref(), client_io.as_ref()).await;
    tracing::info!(%peer, target, sent = stats.a_to_b, received = stats.b_to_a, "disconnect");
    Ok(())
}

async fn handle_forward(
    sock: TcpStream,
    peer: std::net::SocketAddr,
    head: RequestHead,
    mut buf: Vec<u8>,
    pool: Arc<Pool>,
) -> Result<(), BoxError> {
    let target = request_authority(&head)?;
    let conn = match pool.dial("tcp", &target).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(%peer, target, %err, "server request err");
            let body = err.to_string();
            let resp = format!("HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\n\r\n{body}", body.len());
            let mut sock = sock;
            let _ = sock.write_all(resp.as_bytes()).await;
            return Ok(());
        }
    };

    // Forward the request line and headers verbatim (minus the
    // proxy-only `Proxy-Connection` header), then any already-buffered
    // and any remaining body bytes up to Content-Length.
    let mut request_bytes = format!(
        "{} {} HTTP/1.{}\r\n",
        head.method, head.target, head.version
    )
    .into_bytes();
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("proxy-connection") {
            continue;
        }
        request_bytes.extend_from_slice(name.as_bytes());
        request_bytes.extend_from_slice(b": ");
        request_bytes.extend_from_slice(value.as_bytes());
        request_bytes.extend_from_slice(b"\r\n");
    }
    request_bytes.extend_from_slice(b"\r\n");

    let content_length: usize = header_value(&head.headers, "content-length")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    let mut sock = sock;
    let already_buffered = buf.split_off(head.body_start);
    request_bytes.extend_from_slice(&already_buffered[..already_buffered.len().min(content_length)]);
    let mut remaining = content_length.saturating_sub(already_buffered.len());
    while remaining > 0 {
        let mut chunk = vec![0u8; remaining.min(16 * 1024)];
        let n = sock.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        request_bytes.extend_from_slice(&chunk[..n]);
        remaining -= n;
    }

    conn.write(&request_bytes).await.map_err(|e| format!("send request: {e}"))?;

    let mut client_io = as_async_io(conn);
    let copied = tokio::io::copy(&mut tokio::io::BufReader::new(&mut client_io), &mut sock).await;
    let received = copied.unwrap_or(0);
    tracing::info!(%peer, target, received, "disconnected");
    Ok(())
}

fn request_authority(head: &RequestHead) -> Result<String, BoxError> {
    if let Some(rest) = head.target.strip_prefix("http://") {
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        return Ok(default_port(authority, 80));
    }
    if let Some(rest) = head.target.strip_prefix("https://") {
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        return Ok(default_port(authority, 443));
    }
    let host = header_value(&head.headers, "host").ok_or("forward-proxy request missing Host header")?;
    Ok(default_port(host, 80))
}

fn default_port(authority: &str, port: u16) -> String {
    if authority.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        authority.to_owned()
    } else {
        format!("{authority}:{port}")
    }
}
