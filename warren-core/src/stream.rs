//! The WebSocket-framed byte-stream state machine (spec §4.1).
//!
//! Grounded on `protocol/conn.go`'s `connTcp` (original source),
//! re-expressed as an async Rust type over any `AsyncRead + AsyncWrite`
//! transport. The write half is serialized by an async mutex so every
//! outbound frame (data, ping, empty-EOF, close) traverses the same
//! critical section; the read half assumes a single reader, per the
//! caller-convention in the spec, and is likewise mutex-guarded only so
//! `&self` methods work from behind an `Arc`.

use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::{Buf, Bytes};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{io::AsyncRead, io::AsyncWrite, sync::Mutex as AsyncMutex};
use tokio_tungstenite::WebSocketStream;
use tungstenite::{
    Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

use crate::error::ProxyError;
use crate::id::SessionId;

/// One tick of the keepalive ticker.
const KEEPALIVE_TICK: Duration = Duration::from_secs(1);
/// Ticks of silence before a keepalive ping is sent.
const KEEPALIVE_TICKS_BEFORE_PING: u32 = 27;
/// Deadline for a single ping write.
const PING_WRITE_DEADLINE: Duration = Duration::from_secs(1);
/// Deadline for best-effort close-frame writes.
const CLOSE_WRITE_DEADLINE: Duration = Duration::from_secs(1);

/// A full-duplex, half-close-capable byte stream.
///
/// Implemented by [`StreamConn`] (the WebSocket-backed tunnel leg) and by
/// `tokio::net::TcpStream` (the server's upstream leg and the client's
/// hijacked ingress sockets), so [`crate::bridge::bridge`] can copy
/// between either combination without caring which side is which.
pub trait TunnelIo: Send + Sync {
    /// Reads into `buf`. `Ok(0)` means end-of-stream (half-close observed).
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize, ProxyError>> + Send;

    /// Writes `buf` verbatim as a single unit. Never returns a short count.
    fn write(&self, buf: &[u8]) -> impl Future<Output = Result<usize, ProxyError>> + Send;

    /// Half-closes the send direction; the peer's next read observes EOF.
    fn close_write(&self) -> impl Future<Output = Result<(), ProxyError>> + Send;

    /// Closes both directions and the underlying transport. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// The promoted, active-phase view over a [`crate::dial::IdleSession`] or a
/// freshly dialed/accepted session (spec §3, §4.1).
pub struct StreamConn<S> {
    id: SessionId,
    write: AsyncMutex<SplitSink<WebSocketStream<S>, Message>>,
    read: AsyncMutex<SplitStream<WebSocketStream<S>>>,
    read_residual: parking_lot::Mutex<Option<Bytes>>,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    /// One-shot latch: the underlying socket close call happens at most once.
    closed_once: AtomicBool,
}

impl<S> StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already-upgraded WebSocket stream.
    pub fn new(id: SessionId, ws: WebSocketStream<S>) -> Self {
        let (write, read) = ws.split();
        Self {
            id,
            write: AsyncMutex::new(write),
            read: AsyncMutex::new(read),
            read_residual: parking_lot::Mutex::new(None),
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            closed_once: AtomicBool::new(false),
        }
    }

    /// The session id inherited from the handshake.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn mark_both_closed(&self) {
        self.read_closed.store(true, Ordering::Release);
        self.write_closed.store(true, Ordering::Release);
    }

    /// Closes the underlying transport exactly once, best-effort emitting a
    /// normal-closure close frame first.
    async fn close_once(&self) {
        if self.closed_once.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut write = self.write.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "ok".into(),
        };
        let _ = tokio::time::timeout(CLOSE_WRITE_DEADLINE, write.send(Message::Close(Some(frame))))
            .await;
        let _ = write.close().await;
    }

    async fn handle_remote_close(&self, frame: Option<CloseFrame>) {
        tracing::debug!(id = %self.id, ?frame, "ws remote closing");
        self.mark_both_closed();
        let mut write = self.write.lock().await;
        let _ = tokio::time::timeout(CLOSE_WRITE_DEADLINE, write.send(Message::Close(frame))).await;
    }

    async fn ping(&self) -> Result<(), ProxyError> {
        let mut write = self.write.lock().await;
        tokio::time::timeout(PING_WRITE_DEADLINE, write.send(Message::Ping(Bytes::new())))
            .await
            .map_err(|_| ProxyError::transport("ping write timed out"))?
            .map_err(ProxyError::transport)
    }

    /// Spawns the client-side keepalive task (spec §4.1: server does not
    /// run a stream-keepalive pinger). Two consecutive ping failures tear
    /// the session down (a deliberate deviation from the idle pinger's
    /// single-failure teardown, see `DESIGN.md`).
    pub fn spawn_keepalive(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut ticks_since_ping = 0u32;
            let mut consecutive_failures = 0u32;
            let mut interval = tokio::time::interval(KEEPALIVE_TICK);
            loop {
                interval.tick().await;
                if self.read_closed.load(Ordering::Acquire) && self.write_closed.load(Ordering::Acquire)
                {
                    break;
                }
                ticks_since_ping += 1;
                if ticks_since_ping < KEEPALIVE_TICKS_BEFORE_PING {
                    continue;
                }
                ticks_since_ping = 0;
                match self.ping().await {
                    Ok(()) => consecutive_failures = 0,
                    Err(err) => {
                        consecutive_failures += 1;
                        tracing::debug!(id = %self.id, %err, consecutive_failures, "keepalive ping failed");
                        if consecutive_failures >= 2 {
                            self.mark_both_closed();
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl<S> TunnelIo for StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ProxyError> {
        if buf.is_empty() {
            return Err(ProxyError::transport("buffer size is 0"));
        }
        if self.read_closed.load(Ordering::Acquire) {
            return Err(ProxyError::transport("read already closed"));
        }

        {
            let mut residual = self.read_residual.lock();
            if let Some(data) = residual.as_mut() {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                data.advance(n);
                if data.is_empty() {
                    *residual = None;
                }
                return Ok(n);
            }
        }

        loop {
            let next = {
                let mut read = self.read.lock().await;
                read.next().await
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    self.mark_both_closed();
                    return Err(ProxyError::transport(err));
                }
                None => {
                    self.mark_both_closed();
                    return Err(ProxyError::transport("connection closed"));
                }
            };

            match msg {
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(frame) => {
                    self.handle_remote_close(frame).await;
                    return Ok(0);
                }
                Message::Text(_) => {
                    self.mark_both_closed();
                    return Err(ProxyError::transport("unexpected text frame on data stream"));
                }
                Message::Binary(data) => {
                    if data.is_empty() {
                        self.read_closed.store(true, Ordering::Release);
                        if self.write_closed.load(Ordering::Acquire) {
                            self.close_once().await;
                        }
                        return Ok(0);
                    }
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if data.len() > n {
                        *self.read_residual.lock() = Some(Bytes::copy_from_slice(&data[n..]));
                    }
                    return Ok(n);
                }
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ProxyError> {
        if buf.is_empty() {
            return Err(ProxyError::transport("empty data"));
        }
        let mut write = self.write.lock().await;
        if self.write_closed.load(Ordering::Acquire) {
            return Err(ProxyError::transport("write already closed"));
        }
        if let Err(err) = write.send(Message::Binary(Bytes::copy_from_slice(buf))).await {
            drop(write);
            self.mark_both_closed();
            return Err(ProxyError::transport(err));
        }
        Ok(buf.len())
    }

    async fn close_write(&self) -> Result<(), ProxyError> {
        let mut write = self.write.lock().await;
        if self.write_closed.load(Ordering::Acquire) {
            return Err(ProxyError::transport("write already closed"));
        }
        let result = write.send(Message::Binary(Bytes::new())).await;
        self.write_closed.store(true, Ordering::Release);
        match result {
            Ok(()) => {
                if self.read_closed.load(Ordering::Acquire) {
                    drop(write);
                    self.close_once().await;
                }
                Ok(())
            }
            Err(err) => {
                drop(write);
                self.mark_both_closed();
                Err(ProxyError::transport(err))
            }
        }
    }

    async fn close(&self) {
        self.mark_both_closed();
        self.close_once().await;
    }
}

impl TunnelIo for tokio::net::TcpStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ProxyError> {
        use tokio::io::AsyncReadExt;
        (&mut &*self).read(buf).await.map_err(ProxyError::transport)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ProxyError> {
        use tokio::io::AsyncWriteExt;
        (&mut &*self)
            .write_all(buf)
            .await
            .map_err(ProxyError::transport)?;
        Ok(buf.len())
    }

    async fn close_write(&self) -> Result<(), ProxyError> {
        use tokio::io::AsyncWriteExt;
        (&mut &*self).shutdown().await.map_err(ProxyError::transport)
    }

    async fn close(&self) {
        use tokio::io::AsyncWriteExt;
        let _ = (&mut &*self).shutdown().await;
    }
}

/// Adapts any split-able byte stream into [`TunnelIo`], for bridging a
/// plain `AsyncRead + AsyncWrite` connection (e.g. a hijacked HTTP
/// CONNECT socket) against a tunneled [`StreamConn`] without giving
/// `TcpStream` a monopoly on the raw-stream side of [`crate::bridge::bridge`].
pub struct RawIo<S> {
    read: AsyncMutex<tokio::io::ReadHalf<S>>,
    write: AsyncMutex<tokio::io::WriteHalf<S>>,
}

impl<S> RawIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            read: AsyncMutex::new(read),
            write: AsyncMutex::new(write),
        }
    }
}

impl<S> TunnelIo for RawIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ProxyError> {
        use tokio::io::AsyncReadExt;
        let mut read = self.read.lock().await;
        read.read(buf).await.map_err(ProxyError::transport)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ProxyError> {
        use tokio::io::AsyncWriteExt;
        let mut write = self.write.lock().await;
        write.write_all(buf).await.map_err(ProxyError::transport)?;
        Ok(buf.len())
    }

    async fn close_write(&self) -> Result<(), ProxyError> {
        use tokio::io::AsyncWriteExt;
        let mut write = self.write.lock().await;
        write.shutdown().await.map_err(ProxyError::transport)
    }

    async fn close(&self) {
        use tokio::io::AsyncWriteExt;
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, client_async};

    async fn pair() -> (StreamConn<TcpStream>, StreamConn<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_fut = async {
            let (sock, _) = listener.accept().await.unwrap();
            accept_async(sock).await.unwrap()
        };
        let connect_fut = async {
            let sock = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = client_async(format!("ws://{addr}/"), sock).await.unwrap();
            ws
        };
        let (server_ws, client_ws) = tokio::join!(accept_fut, connect_fut);
        (
            StreamConn::new(SessionId::new(), server_ws),
            StreamConn::new(SessionId::new(), client_ws),
        )
    }

    #[tokio::test]
    async fn round_trips_a_single_write() {
        let (server, client) = pair().await;
        client.write(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn splits_an_oversized_message_across_reads() {
        let (server, client) = pair().await;
        client.write(&[7u8; 10]).await.unwrap();
        let mut small = [0u8; 4];
        let n1 = server.read(&mut small).await.unwrap();
        assert_eq!(n1, 4);
        let n2 = server.read(&mut small).await.unwrap();
        assert_eq!(n2, 4);
        let n3 = server.read(&mut small).await.unwrap();
        assert_eq!(n3, 2);
    }

    #[tokio::test]
    async fn close_write_surfaces_as_eof() {
        let (server, client) = pair().await;
        client.close_write().await.unwrap();
        let mut buf = [0u8; 4];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn rejects_empty_buffers_and_writes() {
        let (server, _client) = pair().await;
        assert!(server.write(&[]).await.is_err());
    }

    #[tokio::test]
    async fn reads_after_eof_fail_immediately() {
        let (server, client) = pair().await;
        client.close_write().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        assert!(server.read(&mut buf).await.is_err());
    }
}
