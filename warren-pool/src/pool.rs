//! Fixed-slot set of idle sessions refilled by background workers
//! (spec §4.4). Grounded on `pool/pool.go` (original source).

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::{Duration, sleep};
use warren_core::{
    dial::{ClientIo, Dialer, Endpoint, IdleSession, OnIdleError},
    error::ProxyError,
    stream::StreamConn,
};

const WORKER_TICK: Duration = Duration::from_millis(500);
const WORKER_RETRY_BACKOFF: Duration = Duration::from_millis(500);

struct Slots {
    occupants: Vec<Option<Arc<IdleSession>>>,
    closed: bool,
}

/// A client-process-lifetime pool of pre-handshaken idle sessions,
/// amortizing handshake latency for the common case of many short-lived
/// tunneled connections to the same endpoint.
pub struct Pool {
    endpoint: Endpoint,
    auth: String,
    dialer: Arc<Dialer>,
    state: Arc<RwLock<Slots>>,
}

impl Pool {
    /// Creates a pool of `size` slots against `endpoint`, immediately
    /// spawning one background refill worker per slot.
    pub fn new(endpoint: Endpoint, auth: String, size: usize, dialer: Dialer) -> Arc<Self> {
        let pool = Arc::new(Self {
            endpoint,
            auth,
            dialer: Arc::new(dialer),
            state: Arc::new(RwLock::new(Slots {
                occupants: (0..size).map(|_| None).collect(),
                closed: false,
            })),
        });
        for index in 0..size {
            tokio::spawn(Self::worker(Arc::clone(&pool), index));
        }
        pool
    }

    async fn worker(pool: Arc<Self>, index: usize) {
        loop {
            sleep(WORKER_TICK).await;

            let (need, closed) = {
                let state = pool.state.read();
                (state.occupants[index].is_none(), state.closed)
            };
            if closed {
                break;
            }
            if !need {
                continue;
            }

            let on_error_state = Arc::clone(&pool.state);
            let on_error: OnIdleError = Arc::new(move |dying: &Arc<IdleSession>| {
                let mut state = on_error_state.write();
                if let Some(occupant) = &state.occupants[index]
                    && Arc::ptr_eq(occupant, dying)
                {
                    tracing::warn!(id = %dying.id(), index, "pool slot's idle session died");
                    state.occupants[index] = None;
                }
            });

            match pool
                .dialer
                .dial_idle(&pool.endpoint, &pool.auth, on_error)
                .await
            {
                Ok(session) => {
                    let stale = {
                        let mut state = pool.state.write();
                        if state.closed {
                            true
                        } else {
                            tracing::info!(id = %session.id(), index, "pool slot filled");
                            state.occupants[index] = Some(session.clone());
                            false
                        }
                    };
                    if stale {
                        session.close().await;
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, index, "pool connect failure");
                    sleep(WORKER_RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Takes the first occupied slot, handing ownership to the caller.
    /// `Ok(None)` means no slot is currently occupied.
    fn pick(&self) -> Result<Option<Arc<IdleSession>>, ProxyError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(ProxyError::PoolClosed);
        }
        for occupant in &mut state.occupants {
            if let Some(session) = occupant.take() {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    /// Dials `proto`/`target`, promoting a pooled idle session when one is
    /// available and falling back to a fresh direct dial otherwise. A
    /// promotion failure on the picked session is surfaced as-is — the
    /// pool does not retry on another slot; the emptied slot is left for
    /// its worker to refill (spec §4.4, §9).
    pub async fn dial(
        &self,
        proto: &str,
        target: &str,
    ) -> Result<Arc<StreamConn<ClientIo>>, ProxyError> {
        match self.pick()? {
            Some(idle) => idle.dial(proto, target).await,
            None => {
                self.dialer
                    .dial(&self.endpoint, &self.auth, proto, target)
                    .await
            }
        }
    }

    /// Marks the pool closed and drains+closes any remaining occupants.
    /// Workers observe the closed flag on their next tick and exit.
    pub async fn close(&self) {
        let occupants: Vec<Arc<IdleSession>> = {
            let mut state = self.state.write();
            state.closed = true;
            state.occupants.iter_mut().filter_map(Option::take).collect()
        };
        for occupant in occupants {
            occupant.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use http::{Request, Response};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tungstenite::{handshake::server::ErrorResponse, protocol::Message};

    /// A minimal idle-mode-only fake server: upgrades unconditionally,
    /// stamps `X-PROXY-ID`, then answers every post-upgrade JSON request
    /// with `"ok"` without actually dialing a target. Sufficient to
    /// exercise pool refill and idle-promotion plumbing.
    async fn spawn_fake_idle_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let callback = |_req: &Request<()>, mut response: Response<()>| {
                        response.headers_mut().insert(
                            warren_core::headers::X_PROXY_ID.clone(),
                            warren_core::SessionId::new().to_string().parse().unwrap(),
                        );
                        Ok::<_, ErrorResponse>(response)
                    };
                    let mut ws = match accept_hdr_async(sock, callback).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    loop {
                        match ws.next().await {
                            Some(Ok(Message::Text(_))) => {
                                if ws.send(Message::Text("ok".into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if ws.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(_)) => continue,
                            _ => break,
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refills_slots_and_dials_via_idle_promotion() {
        let addr = spawn_fake_idle_server().await;
        let endpoint = Endpoint::parse(&format!("ws://{addr}/proxy")).unwrap();
        let pool = Pool::new(endpoint, "12345".to_owned(), 2, Dialer::new(None));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(
            pool.state.read().occupants.iter().filter(|o| o.is_some()).count(),
            2
        );

        pool.dial("tcp", "127.0.0.1:1").await.unwrap();
        pool.dial("tcp", "127.0.0.1:1").await.unwrap();
        assert_eq!(
            pool.state.read().occupants.iter().filter(|o| o.is_some()).count(),
            0
        );

        sleep(Duration::from_secs(2)).await;
        assert_eq!(
            pool.state.read().occupants.iter().filter(|o| o.is_some()).count(),
            2
        );

        pool.close().await;
        assert!(matches!(pool.dial("tcp", "x:1").await, Err(ProxyError::PoolClosed)));
    }
}
