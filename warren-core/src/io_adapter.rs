//! Adapts a [`TunnelIo`] into a plain `AsyncRead + AsyncWrite` half, for
//! handing a tunneled connection to code that only understands raw byte
//! streams (an HTTP/1.1 client connection, say) rather than the framed
//! [`TunnelIo`] interface. Bridges the two with a pair of pump tasks over
//! an in-process duplex pipe, the same read-until-EOF-then-propagate
//! shape as [`crate::bridge::bridge`]'s copy loop.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::stream::TunnelIo;

const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Spawns two pump tasks bridging `conn` to a fresh duplex pipe and
/// returns the caller-facing half of that pipe. Dropping the returned
/// stream stops both pumps once a pending operation on `conn` completes.
pub fn as_async_io<T>(conn: Arc<T>) -> DuplexStream
where
    T: TunnelIo + Send + Sync + 'static,
{
    let (local, remote) = tokio::io::duplex(PUMP_BUFFER_SIZE);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let read_conn = Arc::clone(&conn);
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            match read_conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if remote_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = remote_write.shutdown().await;
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            match remote_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = conn.close_write().await;
    });

    local
}
