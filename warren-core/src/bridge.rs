//! Bidirectional byte-copy between two half-close-capable streams
//! (spec §4.5). Grounded on `protocol/server.go`'s `handleNetwork`
//! (original source), but reworked so both directions log their
//! terminal condition independently — the original's HTTP-CONNECT
//! bridge assigns one direction's error variable after the error check,
//! making its logging path dead code; that is not replicated here
//! (spec §9).

use crate::stream::TunnelIo;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Total bytes carried in each direction once both copy loops finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
}

/// Copies `a` → `b` and `b` → `a` concurrently until each direction's
/// source observes end-of-stream or an error, propagating half-close to
/// the destination of each direction as it finishes. An error on one
/// direction does not interrupt the other.
pub async fn bridge<A, B>(a: &A, b: &B) -> BridgeStats
where
    A: TunnelIo,
    B: TunnelIo,
{
    let (a_to_b, b_to_a) = tokio::join!(copy(a, b, "a->b"), copy(b, a, "b->a"));
    BridgeStats { a_to_b, b_to_a }
}

async fn copy<S, D>(src: &S, dst: &D, direction: &'static str) -> u64
where
    S: TunnelIo,
    D: TunnelIo,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        match src.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(direction, total, "bridge direction reached EOF");
                break;
            }
            Ok(n) => {
                total += n as u64;
                if let Err(err) = dst.write(&buf[..n]).await {
                    tracing::debug!(direction, %err, total, "bridge direction write failed");
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(direction, %err, total, "bridge direction read failed");
                break;
            }
        }
    }
    let _ = dst.close_write().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{id::SessionId, stream::StreamConn};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, client_async};

    async fn ws_pair() -> (StreamConn<TcpStream>, StreamConn<TcpStream>) {
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
    async fn propagates_half_close_and_counts_bytes() {
        let (server_a, client_a) = ws_pair().await;
        let (server_b, client_b) = ws_pair().await;

        let bridge_task = tokio::spawn(async move { bridge(&server_a, &server_b).await });

        client_a.write(b"hello").await.unwrap();
        client_a.close_write().await.unwrap();

        let mut buf = [0u8; 16];
        let mut received = Vec::new();
        loop {
            let n = client_b.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"hello");

        client_b.write(b"ack").await.unwrap();
        client_b.close_write().await.unwrap();

        let mut received_back = Vec::new();
        loop {
            let n = client_a.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received_back.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received_back, b"ack");

        let stats = bridge_task.await.unwrap();
        assert_eq!(stats.a_to_b, 5);
        assert_eq!(stats.b_to_a, 3);
    }
}
