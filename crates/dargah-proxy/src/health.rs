//! Periodic health probing of every configured upstream.
//!
//! One task per upstream. Each tick dials a fresh connection (never one
//! borrowed from the pool, so pool bookkeeping is undisturbed), sends a
//! framed `SELECT 1`, and waits up to two seconds for any response byte.
//! The outcome is recorded as a health-check row; when liveness flips, the
//! upstream is spliced between the shared healthy and unhealthy sets while
//! holding the set mutex only for that splice.

use crate::metrics;
use crate::pg_wire::codec::encode_simple_query;
use crate::upstream::{ServerSets, Upstream};
use chrono::Utc;
use dargah_store::{HealthCheck, HealthCheckStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Read deadline for one probe.
const PROBE_DEADLINE: Duration = Duration::from_secs(2);

/// Shared pieces every per-upstream monitor task needs.
#[derive(Clone)]
pub struct HealthMonitor {
    pub interval: Duration,
    pub sets: Arc<Mutex<ServerSets>>,
    pub checks: HealthCheckStore,
    pub tick_counter: Arc<AtomicU64>,
    pub cancel: CancellationToken,
}

impl HealthMonitor {
    /// Spawn the monitor task for one upstream. The task runs until the
    /// proxy's root cancellation fires.
    pub fn spawn(&self, upstream: Arc<Upstream>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            // first probe one full interval after startup
            let start = tokio::time::Instant::now() + monitor.interval;
            let mut ticker = tokio::time::interval_at(start, monitor.interval);

            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                monitor.tick(&upstream).await;
            }
        });
    }

    async fn tick(&self, upstream: &Arc<Upstream>) {
        let prev_healthy = upstream.is_healthy();

        let started = Instant::now();
        let healthy = match probe(&upstream.addr).await {
            Ok(()) => true,
            Err(err) => {
                warn!(addr = %upstream.addr, id = %upstream.id, error = %err, "ping failed");
                false
            }
        };
        let lag_ms = if healthy {
            started.elapsed().as_millis() as u64
        } else {
            0
        };

        upstream.set_health(healthy, lag_ms);

        let state_change = healthy != prev_healthy;
        let nth = self.tick_counter.fetch_add(1, Ordering::Relaxed) + 1;

        let row = HealthCheck {
            id: uuid::Uuid::new_v4().to_string(),
            addr: upstream.addr.clone(),
            healthy,
            lag_ms: lag_ms as i64,
            state_change,
            nth: nth as i64,
            created_at: Utc::now(),
        };
        if let Err(err) = self.checks.create(&row).await {
            warn!(addr = %upstream.addr, error = %err, "failed to record health check");
        }

        metrics::observe_probe(&upstream.addr, healthy);

        if state_change {
            info!(
                addr = %upstream.addr,
                healthy,
                lag_ms,
                "upstream changed state"
            );
            metrics::record_health_transition(healthy);

            let mut sets = self.sets.lock().unwrap();
            if healthy {
                sets.promote(upstream.id);
            } else {
                sets.demote(upstream.id);
            }
        }
    }
}

/// Dial, write a framed `SELECT 1`, and require at least one response byte
/// within the deadline. EOF counts as failure.
async fn probe(addr: &str) -> std::io::Result<()> {
    let mut conn = TcpStream::connect(addr).await?;
    conn.write_all(&encode_simple_query("SELECT 1")).await?;

    let mut buf = [0u8; 512];
    let n = timeout(PROBE_DEADLINE, conn.read(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "probe read deadline"))??;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "upstream closed during probe",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use dargah_store::Store;
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio::net::TcpListener;

    async fn responsive_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn serve(listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
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
        })
    }

    async fn memory_checks() -> (Store, HealthCheckStore) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::from_pool(pool);
        store.migrate().await.unwrap();
        let checks = store.health_checks();
        (store, checks)
    }

    #[tokio::test]
    async fn probe_against_live_and_dead_ports() {
        let (listener, addr) = responsive_listener().await;
        let server = serve(listener);
        assert!(probe(&addr).await.is_ok());
        server.abort();

        let (listener, dead_addr) = responsive_listener().await;
        drop(listener);
        assert!(probe(&dead_addr).await.is_err());
    }

    #[tokio::test]
    async fn failing_upstream_is_demoted_once() {
        let (listener, addr) = responsive_listener().await;
        let server = serve(listener);

        let pool = ConnectionPool::new(PoolConfig::new(&addr, 1)).await.unwrap();
        let upstream = Upstream::from_parts(addr.clone(), pool);

        let sets = Arc::new(Mutex::new(ServerSets {
            healthy: vec![upstream.clone()],
            unhealthy: Vec::new(),
        }));
        let (_store, checks) = memory_checks().await;

        let monitor = HealthMonitor {
            interval: Duration::from_millis(50),
            sets: sets.clone(),
            checks: checks.clone(),
            tick_counter: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        };

        // kill the upstream, then run two ticks by hand
        server.abort();
        monitor.tick(&upstream).await;
        monitor.tick(&upstream).await;

        {
            let sets = sets.lock().unwrap();
            assert!(sets.healthy.is_empty());
            assert_eq!(sets.unhealthy.len(), 1);
        }
        assert!(!upstream.is_healthy());
        // two rows recorded, exactly one transition
        assert_eq!(checks.list(1, 10).await.unwrap().result.len(), 2);
        assert_eq!(checks.transition_count(&addr).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recovered_upstream_is_promoted() {
        let (listener, addr) = responsive_listener().await;
        let server = serve(listener);

        let pool = ConnectionPool::new(PoolConfig::new(&addr, 1)).await.unwrap();
        let upstream = Upstream::from_parts(addr.clone(), pool);
        upstream.set_health(false, 0);

        let sets = Arc::new(Mutex::new(ServerSets {
            healthy: Vec::new(),
            unhealthy: vec![upstream.clone()],
        }));
        let (_store, checks) = memory_checks().await;

        let monitor = HealthMonitor {
            interval: Duration::from_millis(50),
            sets: sets.clone(),
            checks,
            tick_counter: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        };

        monitor.tick(&upstream).await;

        let sets = sets.lock().unwrap();
        assert_eq!(sets.healthy.len(), 1);
        assert!(sets.unhealthy.is_empty());
        assert!(upstream.is_healthy());
        server.abort();
    }
}
