//! Bounded pool of live TCP connections to a single upstream.
//!
//! The pool eagerly dials its full capacity at construction and fails
//! atomically if any dial fails. Idle connections wait in a bounded channel;
//! a single receiver guarded by a mutex guarantees no connection is ever
//! handed to two callers. Every acquire is preceded by a liveness probe —
//! a framed `SELECT 1;` with a two-second read deadline — and a dead, stale
//! or over-age connection is replaced by a fresh dial to the same address.

use crate::pg_wire::codec::encode_simple_query;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read deadline for the acquire-time liveness probe.
const PING_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upstream address (host:port).
    pub conn_string: String,
    /// Number of connections held by the pool.
    pub max_connections: usize,
    /// How long a connection may sit idle before it is replaced on acquire.
    pub max_idle_time: Duration,
    /// How long an entry may live in the pool before it is replaced.
    pub max_lifetime: Duration,
}

impl PoolConfig {
    pub fn new(conn_string: impl Into<String>, max_connections: usize) -> Self {
        Self {
            conn_string: conn_string.into(),
            max_connections: max_connections.max(1),
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,

    #[error("timed out waiting for a pooled connection")]
    Timeout,

    #[error("failed to dial upstream: {0}")]
    Dial(#[source] std::io::Error),
}

/// One pooled entry. `opened_at` restarts when a checked-out connection is
/// returned, so lifetime bounds the time an entry sits in the pool.
struct Idle {
    stream: TcpStream,
    opened_at: Instant,
    parked_at: Instant,
}

pub struct ConnectionPool {
    config: PoolConfig,
    idle_tx: mpsc::Sender<Idle>,
    idle_rx: Mutex<mpsc::Receiver<Idle>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Eagerly open the configured number of connections. If any dial fails
    /// the already-opened connections are closed and the error is returned.
    pub async fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let mut opened = Vec::with_capacity(config.max_connections);
        for _ in 0..config.max_connections {
            match TcpStream::connect(&config.conn_string).await {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    drop(opened);
                    return Err(PoolError::Dial(err));
                }
            }
        }

        let (idle_tx, idle_rx) = mpsc::channel(config.max_connections);
        let now = Instant::now();
        for stream in opened {
            // capacity matches, so this cannot fail
            let _ = idle_tx.try_send(Idle {
                stream,
                opened_at: now,
                parked_at: now,
            });
        }

        debug!(
            addr = %config.conn_string,
            capacity = config.max_connections,
            "connection pool filled"
        );

        Ok(Self {
            config,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            closed: CancellationToken::new(),
        })
    }

    /// Take a connection, waiting up to `deadline` for one to be released.
    /// The returned connection has just answered a liveness probe, or is a
    /// fresh dial replacing one that did not (or that aged out).
    pub async fn acquire(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<TcpStream, PoolError> {
        if self.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let expired = tokio::time::sleep(deadline);
        tokio::pin!(expired);

        let mut rx = tokio::select! {
            guard = self.idle_rx.lock() => guard,
            _ = self.closed.cancelled() => return Err(PoolError::Closed),
            _ = cancel.cancelled() => return Err(PoolError::Closed),
            _ = &mut expired => return Err(PoolError::Timeout),
        };

        let entry = tokio::select! {
            entry = rx.recv() => entry.ok_or(PoolError::Closed)?,
            _ = self.closed.cancelled() => return Err(PoolError::Closed),
            _ = cancel.cancelled() => return Err(PoolError::Closed),
            _ = &mut expired => return Err(PoolError::Timeout),
        };
        drop(rx);

        if entry.opened_at.elapsed() >= self.config.max_lifetime
            || entry.parked_at.elapsed() >= self.config.max_idle_time
        {
            debug!(addr = %self.config.conn_string, "pooled connection aged out, redialing");
            drop(entry);
            return TcpStream::connect(&self.config.conn_string)
                .await
                .map_err(PoolError::Dial);
        }

        match ping(entry.stream).await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                warn!(
                    addr = %self.config.conn_string,
                    error = %err,
                    "pooled connection failed probe, redialing"
                );
                TcpStream::connect(&self.config.conn_string)
                    .await
                    .map_err(PoolError::Dial)
            }
        }
    }

    /// Return a connection to the idle set. After close, or when the pool is
    /// somehow full, the connection is simply dropped (which closes it).
    pub fn release(&self, stream: TcpStream) {
        if self.closed.is_cancelled() {
            return;
        }
        let now = Instant::now();
        // a release racing close parks the connection in the channel; it is
        // closed when the pool itself drops
        let _ = self.idle_tx.try_send(Idle {
            stream,
            opened_at: now,
            parked_at: now,
        });
    }

    /// Close the pool: wake blocked acquirers, close all idle connections.
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut rx = self.idle_rx.lock().await;
        while rx.try_recv().is_ok() {}
    }
}

/// Probe a connection: write a framed `SELECT 1;`, require at least one
/// response byte within the deadline. EOF counts as failure. This is not a
/// protocol-complete round trip; it only proves the socket is writable and
/// the peer responsive.
async fn ping(mut conn: TcpStream) -> std::io::Result<TcpStream> {
    conn.write_all(&encode_simple_query("SELECT 1;")).await?;

    let mut buf = [0u8; 512];
    let n = timeout(PING_DEADLINE, conn.read(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "ping read deadline"))??;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "upstream closed during ping",
        ));
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Minimal upstream that answers every read with one byte.
    async fn fake_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if sock.write_all(b"Z").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn pool(addr: &str, capacity: usize) -> ConnectionPool {
        ConnectionPool::new(PoolConfig::new(addr, capacity))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_release_cycle() {
        let addr = fake_upstream().await;
        let pool = pool(&addr, 2).await;
        let cancel = CancellationToken::new();

        let a = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        // pool exhausted: third acquire times out
        let err = pool
            .acquire(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout));

        pool.release(a);
        let c = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        pool.release(b);
        pool.release(c);
    }

    #[tokio::test]
    async fn blocked_acquire_proceeds_on_release() {
        let addr = fake_upstream().await;
        let pool = Arc::new(pool(&addr, 1).await);
        let cancel = CancellationToken::new();

        let held = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held);

        let conn = waiter.await.unwrap().unwrap();
        pool.release(conn);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_future_acquires() {
        let addr = fake_upstream().await;
        let pool = pool(&addr, 1).await;
        let cancel = CancellationToken::new();

        pool.close().await;
        pool.close().await;

        let err = pool
            .acquire(Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test]
    async fn eager_open_fails_atomically() {
        // bind a port then free it: the dial should be refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = ConnectionPool::new(PoolConfig::new(&addr, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Dial(_)));
    }

    #[tokio::test]
    async fn idle_connections_are_replaced_after_max_idle() {
        let addr = fake_upstream().await;
        let mut config = PoolConfig::new(&addr, 1);
        config.max_idle_time = Duration::from_millis(10);
        let pool = ConnectionPool::new(config).await.unwrap();
        let cancel = CancellationToken::new();

        tokio::time::sleep(Duration::from_millis(30)).await;

        // the aged entry is silently replaced by a fresh dial
        let conn = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        pool.release(conn);
    }

    #[tokio::test]
    async fn concurrent_churn_preserves_capacity() {
        let addr = fake_upstream().await;
        let pool = Arc::new(pool(&addr, 3).await);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let conn = pool.acquire(Duration::from_secs(5), &cancel).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    pool.release(conn);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // after all releases the full capacity is acquirable again
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire(Duration::from_secs(1), &cancel).await.unwrap());
        }
        let err = pool
            .acquire(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout));
        for conn in held {
            pool.release(conn);
        }
    }
}
