//! The inbound upgrade handler (spec §4.3). Grounded on
//! `protocol/server.go`'s `Handler`/`request.handle` (original source).

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncRead, io::AsyncWrite, net::TcpStream};
use tokio_tungstenite::WebSocketStream;
use tungstenite::{
    Message,
    protocol::{CloseFrame, Role, frame::coding::CloseCode},
};

use warren_core::{
    headers::{PROTOCOL_TCP, X_PROXY_AUTHORIZATION, X_PROXY_ID, X_PROXY_PROTOCOL, X_PROXY_TARGET},
    id::SessionId,
    stream::StreamConn,
};
use warren_serverhelper::RealIp;

const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_WRITE_DEADLINE: Duration = Duration::from_secs(1);

type ResponseBody = BoxBody<Bytes, Infallible>;

fn empty() -> ResponseBody {
    Empty::new().boxed()
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).boxed()
}

/// Authenticates the tuple (resolved real IP, presented `X-PROXY-Authorization`
/// value). Injected so the core never hard-codes a credential scheme.
pub type Authenticator = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
struct IdleRequest {
    protocol: String,
    target: String,
}

/// The inbound tunnel endpoint: one instance is shared across every
/// accepted connection on a listener.
pub struct Handler {
    path: String,
    authenticator: Authenticator,
    real_ip: Arc<dyn RealIp>,
    speedtest_path: Option<String>,
}

impl Handler {
    #[must_use]
    pub fn new(path: impl Into<String>, authenticator: Authenticator, real_ip: Arc<dyn RealIp>) -> Self {
        Self {
            path: path.into(),
            authenticator,
            real_ip,
            speedtest_path: None,
        }
    }

    #[must_use]
    pub fn with_speedtest_path(mut self, path: impl Into<String>) -> Self {
        self.speedtest_path = Some(path.into());
        self
    }

    /// Drives one accepted connection (plain or already TLS-wrapped) to
    /// completion: serves HTTP/1.1 on it, upgrading at most once.
    pub async fn serve_connection<IO>(self: Arc<Self>, io: IO, peer_addr: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(io);
        let service = service_fn(move |req| {
            let handler = Arc::clone(&self);
            async move { handler.handle(req, peer_addr).await }
        });
        if let Err(err) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!(%err, %peer_addr, "connection closed with error");
        }
    }

    async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<ResponseBody>, Infallible> {
        let is_upgrade = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

        if !is_upgrade {
            if let Some(st_path) = &self.speedtest_path
                && req.uri().path() == st_path
            {
                let resp = warren_serverhelper::speedtest::response(req.uri().query());
                return Ok(resp.map(|body| body.map_err(|never| match never {}).boxed()));
            }
            return Ok(status_response(StatusCode::NOT_FOUND, "not found"));
        }

        if req.uri().path() != self.path {
            return Ok(status_response(StatusCode::NOT_FOUND, "not found"));
        }

        let Some(ws_key) = req
            .headers()
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        else {
            return Ok(status_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key"));
        };

        let real_ip = self.real_ip.real_ip(peer_addr.ip(), req.headers());
        let presented = header_str(req.headers(), &X_PROXY_AUTHORIZATION).unwrap_or_default();
        if !(self.authenticator)(&real_ip, presented) {
            tracing::warn!(real_ip, "unauthorized upgrade attempt");
            return Ok(status_response(StatusCode::UNAUTHORIZED, "Invalid credentials"));
        }

        let proto = header_str(req.headers(), &X_PROXY_PROTOCOL).map(str::to_owned);
        let target = header_str(req.headers(), &X_PROXY_TARGET).map(str::to_owned);
        let id = SessionId::new();

        match (proto, target) {
            (None, None) => {
                tracing::debug!(%id, real_ip, "idle conn");
                let upgrade = hyper::upgrade::on(&mut req);
                let resp = upgrade_response(&ws_key, id)?;
                tokio::spawn(Self::run_idle(upgrade, id, real_ip));
                Ok(resp)
            }
            (Some(proto), Some(target)) => {
                if proto != PROTOCOL_TCP {
                    tracing::warn!(%id, real_ip, proto, "unsupported protocol");
                    return Ok(status_response(StatusCode::BAD_REQUEST, "Unsupported protocol"));
                }
                tracing::info!(%id, real_ip, target, "connect");
                match tokio::time::timeout(TARGET_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
                    Ok(Ok(upstream)) => {
                        let _ = upstream.set_nodelay(true);
                        let upgrade = hyper::upgrade::on(&mut req);
                        let resp = upgrade_response(&ws_key, id)?;
                        tokio::spawn(Self::run_direct(upgrade, id, upstream, real_ip, target));
                        Ok(resp)
                    }
                    Ok(Err(err)) => {
                        tracing::error!(%id, real_ip, target, %err, "connection failure");
                        Ok(status_response(
                            StatusCode::BAD_GATEWAY,
                            &format!("Connection failure: {err}"),
                        ))
                    }
                    Err(_) => {
                        tracing::error!(%id, real_ip, target, "connection failure: timed out");
                        Ok(status_response(
                            StatusCode::BAD_GATEWAY,
                            "Connection failure: timed out",
                        ))
                    }
                }
            }
            _ => Ok(status_response(StatusCode::BAD_REQUEST, "Unsupported protocol")),
        }
    }

    async fn run_direct(
        upgrade: hyper::upgrade::OnUpgrade,
        id: SessionId,
        upstream: TcpStream,
        real_ip: String,
        target: String,
    ) {
        let upgraded = match upgrade.await {
            Ok(u) => u,
            Err(err) => {
                tracing::error!(%id, %err, "websocket upgrade failure");
                return;
            }
        };
        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        tracing::debug!(%id, "ws upgraded");
        let conn = StreamConn::new(id, ws);
        let stats = warren_core::bridge::bridge(&conn, &upstream).await;
        tracing::info!(
            %id, real_ip, target,
            sent = stats.a_to_b, received = stats.b_to_a,
            "connection closed"
        );
    }

    async fn run_idle(upgrade: hyper::upgrade::OnUpgrade, id: SessionId, real_ip: String) {
        let upgraded = match upgrade.await {
            Ok(u) => u,
            Err(err) => {
                tracing::error!(%id, %err, "websocket upgrade failure");
                return;
            }
        };
        let mut ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        tracing::debug!(%id, "ws upgraded");

        let msg = match ws.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                tracing::warn!(%id, %err, "cannot read request");
                close_with_reason(&mut ws, CloseCode::Abnormal, "cannot read request").await;
                return;
            }
            None => {
                tracing::warn!(%id, "cannot read request: connection closed");
                return;
            }
        };
        let Message::Text(text) = msg else {
            close_with_reason(&mut ws, CloseCode::Abnormal, "cannot read request").await;
            return;
        };
        let req: IdleRequest = match serde_json::from_str(&text) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(%id, %err, "cannot read request");
                close_with_reason(&mut ws, CloseCode::Abnormal, "cannot read request").await;
                return;
            }
        };
        if req.protocol != PROTOCOL_TCP {
            tracing::warn!(%id, protocol = req.protocol, "unsupported protocol");
            close_with_reason(&mut ws, CloseCode::Abnormal, "unsupported protocol").await;
            return;
        }

        tracing::info!(%id, real_ip, target = req.target, "connect");
        let upstream = match tokio::time::timeout(TARGET_DIAL_TIMEOUT, TcpStream::connect(&req.target)).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => {
                tracing::error!(%id, real_ip, target = req.target, %err, "connection failure");
                close_with_reason(&mut ws, CloseCode::Error, &format!("Connection failure: {err}")).await;
                return;
            }
            Err(_) => {
                tracing::error!(%id, real_ip, target = req.target, "connection failure: timed out");
                close_with_reason(&mut ws, CloseCode::Error, "Connection failure: timed out").await;
                return;
            }
        };
        let _ = upstream.set_nodelay(true);

        if let Err(err) = ws.send(Message::Text("ok".into())).await {
            tracing::error!(%id, %err, "response failure");
            return;
        }

        let conn = StreamConn::new(id, ws);
        let stats = warren_core::bridge::bridge(&conn, &upstream).await;
        tracing::info!(
            %id, real_ip, target = req.target,
            sent = stats.a_to_b, received = stats.b_to_a,
            "connection closed"
        );
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &http::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn status_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut resp = Response::new(full(message.to_owned()));
    *resp.status_mut() = status;
    resp
}

fn upgrade_response(ws_key: &str, id: SessionId) -> Result<Response<ResponseBody>, Infallible> {
    let accept = tungstenite::handshake::derive_accept_key(ws_key.as_bytes());
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        "Sec-WebSocket-Accept",
        HeaderValue::from_str(&accept).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(
        X_PROXY_ID.as_str(),
        HeaderValue::from_str(&id.to_string()).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    Ok(resp)
}

async fn close_with_reason<S>(ws: &mut WebSocketStream<S>, code: CloseCode, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    let _ = tokio::time::timeout(CONTROL_WRITE_DEADLINE, ws.send(Message::Close(Some(frame)))).await;
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("path", &self.path).finish_non_exhaustive()
    }
}
