//! Outbound handshake and the idle (pre-handshaken, parked) session
//! (spec §4.2). Grounded on `protocol/client.go` and
//! `protocol/client_idle.go` (original source).

use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use http::{Request, Uri};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    sync::Mutex as AsyncMutex,
};
use tokio_tungstenite::{WebSocketStream, client_async_with_config, tungstenite::Message};

use crate::{
    error::ProxyError,
    headers::{IDLE_OK, PROTOCOL_TCP, X_PROXY_AUTHORIZATION, X_PROXY_ID, X_PROXY_PROTOCOL, X_PROXY_TARGET},
    id::SessionId,
    stream::StreamConn,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const IDLE_KEEPALIVE_TICK: Duration = Duration::from_secs(1);
const IDLE_KEEPALIVE_TICKS_BEFORE_PING: u32 = 27;

/// The client-side transport for a dialed session: a plain TCP connection
/// or one wrapped in TLS, erased behind a single concrete type so
/// [`StreamConn`] does not need to be generic over it at every call site.
pub enum ClientIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An endpoint to dial: scheme (`ws`/`wss`), host, port and path.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub uri: Uri,
    pub tls: bool,
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ProxyError> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid endpoint `{endpoint}`: {e}")))?;
        let tls = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            _ => {
                return Err(ProxyError::Config(format!(
                    "invalid endpoint `{endpoint}`: scheme must be ws or wss"
                )));
            }
        };
        Ok(Self { uri, tls })
    }

    fn host(&self) -> Result<&str, ProxyError> {
        self.uri
            .host()
            .ok_or_else(|| ProxyError::Config(format!("endpoint `{}` has no host", self.uri)))
    }

    fn port(&self) -> u16 {
        self.uri
            .port_u16()
            .unwrap_or(if self.tls { 443 } else { 80 })
    }
}

/// An optional override for outbound name resolution (spec §4.2 "Client
/// resolver override"); `None` uses the system resolver unmodified.
pub type Resolver = Option<Arc<dyn Resolve>>;

/// Resolves a `host:port` pair to a connectable socket address, so a
/// custom resolver can be plugged in without pulling a full DNS client
/// crate into the core.
pub trait Resolve: Send + Sync {
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<std::net::SocketAddr>> + Send + '_>>;
}

/// Performs outbound WebSocket handshakes against a single endpoint.
pub struct Dialer {
    resolver: Resolver,
    tls_connector: Option<tokio_rustls::TlsConnector>,
}

impl Dialer {
    /// A dialer using the system resolver and, if `tls_connector` is
    /// `Some`, TLS termination for `wss://` endpoints.
    #[must_use]
    pub fn new(tls_connector: Option<tokio_rustls::TlsConnector>) -> Self {
        Self {
            resolver: None,
            tls_connector,
        }
    }

    /// Overrides outbound name resolution for the endpoint host.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn connect_tcp(&self, endpoint: &Endpoint) -> Result<TcpStream, ProxyError> {
        let host = endpoint.host()?;
        let port = endpoint.port();
        let stream = if let Some(resolver) = &self.resolver {
            let addr = resolver
                .resolve(host, port)
                .await
                .map_err(|e| ProxyError::Handshake(format!("resolve failure: {e}")))?;
            TcpStream::connect(addr)
                .await
                .map_err(|e| ProxyError::Handshake(format!("tcp connect failure: {e}")))?
        } else {
            TcpStream::connect((host, port))
                .await
                .map_err(|e| ProxyError::Handshake(format!("tcp connect failure: {e}")))?
        };
        stream
            .set_nodelay(true)
            .map_err(|e| ProxyError::Handshake(format!("set_nodelay failure: {e}")))?;
        Ok(stream)
    }

    async fn connect_io(&self, endpoint: &Endpoint) -> Result<ClientIo, ProxyError> {
        let tcp = self.connect_tcp(endpoint).await?;
        if !endpoint.tls {
            return Ok(ClientIo::Plain(tcp));
        }
        let connector = self
            .tls_connector
            .clone()
            .ok_or_else(|| ProxyError::Config("wss:// endpoint requires a TLS connector".into()))?;
        let server_name = rustls_pki_types::ServerName::try_from(endpoint.host()?.to_owned())
            .map_err(|e| ProxyError::Handshake(format!("invalid TLS server name: {e}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Handshake(format!("TLS handshake failure: {e}")))?;
        Ok(ClientIo::Tls(Box::new(tls)))
    }

    fn build_request(
        endpoint: &Endpoint,
        auth: &str,
        proto: Option<&str>,
        target: Option<&str>,
    ) -> Result<Request<()>, ProxyError> {
        let mut builder = Request::builder()
            .uri(endpoint.uri.clone())
            .header("Host", endpoint.host()?)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header(X_PROXY_AUTHORIZATION.as_str(), auth);
        if let Some(proto) = proto {
            builder = builder.header(X_PROXY_PROTOCOL.as_str(), proto);
        }
        if let Some(target) = target {
            builder = builder.header(X_PROXY_TARGET.as_str(), target);
        }
        builder
            .body(())
            .map_err(|e| ProxyError::Handshake(format!("malformed upgrade request: {e}")))
    }

    async fn handshake(
        &self,
        endpoint: &Endpoint,
        request: Request<()>,
    ) -> Result<(WebSocketStream<ClientIo>, SessionId), ProxyError> {
        let io = self.connect_io(endpoint).await?;
        let (ws, response) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            client_async_with_config(request, io, None),
        )
        .await
        .map_err(|_| ProxyError::Handshake("handshake timed out".into()))?
        .map_err(|e| ProxyError::Handshake(format!("{e} (101 expected)")))?;

        let id_str = response
            .headers()
            .get(X_PROXY_ID.as_str())
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProxyError::Handshake(format!("missing {X_PROXY_ID} header")))?;
        let id = SessionId::parse(id_str)
            .map_err(|_| ProxyError::Handshake(format!("unexpected {X_PROXY_ID} value: `{id_str}`")))?;

        Ok((ws, id))
    }

    /// Dials `endpoint` directly into `Active` phase for `proto`/`target`.
    pub async fn dial(
        &self,
        endpoint: &Endpoint,
        auth: &str,
        proto: &str,
        target: &str,
    ) -> Result<Arc<StreamConn<ClientIo>>, ProxyError> {
        let request = Self::build_request(endpoint, auth, Some(proto), Some(target))?;
        let (ws, id) = self.handshake(endpoint, request).await?;
        let conn = Arc::new(StreamConn::new(id, ws));
        conn.clone().spawn_keepalive();
        tracing::info!(%id, target, "connected");
        Ok(conn)
    }

    /// Dials `endpoint` into `Idle` phase (no proto/target headers).
    pub async fn dial_idle(
        &self,
        endpoint: &Endpoint,
        auth: &str,
        on_error: OnIdleError,
    ) -> Result<Arc<IdleSession>, ProxyError> {
        let request = Self::build_request(endpoint, auth, None, None)?;
        let (ws, id) = self.handshake(endpoint, request).await?;
        let session = Arc::new(IdleSession::new(id, ws, on_error));
        session.clone().spawn_keepalive();
        Ok(session)
    }
}

/// Invoked when the idle keepalive detects a dead session. Tolerant of
/// being invoked after the slot holding this session has already been
/// taken or repopulated (spec §4.4: compare-and-clear against identity).
pub type OnIdleError = Arc<dyn Fn(&Arc<IdleSession>) + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
struct IdleRequest<'a> {
    protocol: &'a str,
    target: &'a str,
}

/// A handshaken session parked with no data flow, awaiting promotion
/// (spec §3, §4.2).
pub struct IdleSession {
    id: SessionId,
    ws: AsyncMutex<Option<WebSocketStream<ClientIo>>>,
    idle: AtomicBool,
    on_error: OnIdleError,
}

impl IdleSession {
    fn new(id: SessionId, ws: WebSocketStream<ClientIo>, on_error: OnIdleError) -> Self {
        Self {
            id,
            ws: AsyncMutex::new(Some(ws)),
            idle: AtomicBool::new(true),
            on_error,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Closes the underlying socket. Used by the pool when draining slots
    /// on shutdown, and by a caller that decides not to promote after all.
    pub async fn close(&self) {
        self.idle.store(false, Ordering::Release);
        let mut guard = self.ws.lock().await;
        if let Some(mut ws) = guard.take() {
            let _ = futures_util::SinkExt::close(&mut ws).await;
        }
    }

    /// Promotes this idle session to an active [`StreamConn`] for
    /// `proto`/`target` (spec §4.2 "Idle promotion").
    pub async fn dial(
        self: &Arc<Self>,
        proto: &str,
        target: &str,
    ) -> Result<Arc<StreamConn<ClientIo>>, ProxyError> {
        let mut guard = self.ws.lock().await;
        if !self.idle.swap(false, Ordering::AcqRel) {
            return Err(ProxyError::StaleIdle("use another idle conn".into()));
        }

        let mut ws = guard
            .take()
            .ok_or_else(|| ProxyError::transport("idle session socket already taken"))?;

        let req = IdleRequest { protocol: proto, target };
        let payload = serde_json::to_string(&req)
            .map_err(|e| ProxyError::transport(format!("encode idle request: {e}")))?;
        if let Err(err) = futures_util::SinkExt::send(&mut ws, Message::Text(payload.into())).await {
            return Err(ProxyError::transport(format!("send req failure: {err}")));
        }

        let resp = futures_util::StreamExt::next(&mut ws)
            .await
            .ok_or_else(|| ProxyError::transport("read resp failure: connection closed"))?
            .map_err(|e| ProxyError::transport(format!("read resp failure: {e}")))?;

        let text = match resp {
            Message::Text(text) => text,
            other => {
                return Err(ProxyError::transport(format!(
                    "unexpected resp type: {other:?}"
                )));
            }
        };
        if text != IDLE_OK {
            return Err(ProxyError::transport(format!("cannot open: {text}")));
        }

        let conn = Arc::new(StreamConn::new(self.id, ws));
        conn.clone().spawn_keepalive();
        tracing::info!(id = %self.id, target, "connected");
        Ok(conn)
    }

    fn spawn_keepalive(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticks_since_ping = 0u32;
            let mut interval = tokio::time::interval(IDLE_KEEPALIVE_TICK);
            loop {
                interval.tick().await;
                if !self.idle.load(Ordering::Acquire) {
                    break;
                }
                ticks_since_ping += 1;
                if ticks_since_ping < IDLE_KEEPALIVE_TICKS_BEFORE_PING {
                    continue;
                }
                ticks_since_ping = 0;

                let mut guard = self.ws.lock().await;
                if !self.idle.load(Ordering::Acquire) {
                    break;
                }
                let Some(ws) = guard.as_mut() else { break };
                if let Err(err) =
                    futures_util::SinkExt::send(ws, Message::Ping(bytes::Bytes::new())).await
                {
                    tracing::debug!(id = %self.id, %err, "send ping failure on idle conn");
                    self.idle.store(false, Ordering::Release);
                    drop(guard);
                    (self.on_error)(&self);
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_ws_schemes() {
        assert!(Endpoint::parse("http://example.com").is_err());
    }

    #[test]
    fn parses_ws_endpoint() {
        let e = Endpoint::parse("ws://127.0.0.1:10080/proxy").unwrap();
        assert!(!e.tls);
        assert_eq!(e.port(), 10080);
    }

    #[test]
    fn parses_wss_endpoint_default_port() {
        let e = Endpoint::parse("wss://example.com/proxy").unwrap();
        assert!(e.tls);
        assert_eq!(e.port(), 443);
    }
}
