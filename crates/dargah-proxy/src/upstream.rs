//! Upstream endpoints and the healthy/unhealthy partition.

use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use std::sync::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// One backend PostgreSQL server known to the proxy. Created once from
/// configuration, never destroyed; only its set membership changes.
pub struct Upstream {
    pub id: Uuid,
    pub addr: String,
    state: Mutex<UpstreamState>,
    pub pool: ConnectionPool,
}

#[derive(Debug, Clone, Copy)]
struct UpstreamState {
    healthy: bool,
    lag_ms: u64,
}

impl Upstream {
    /// Dial the upstream and fill its connection pool.
    pub async fn connect(addr: &str, pool_size: usize) -> Result<Arc<Self>, PoolError> {
        let pool = ConnectionPool::new(PoolConfig::new(addr, pool_size)).await?;
        Ok(Self::from_parts(addr.to_string(), pool))
    }

    /// Wrap an already-built pool. Starts healthy.
    pub fn from_parts(addr: String, pool: ConnectionPool) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            addr,
            state: Mutex::new(UpstreamState {
                healthy: true,
                lag_ms: 0,
            }),
            pool,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().unwrap().healthy
    }

    pub fn lag_ms(&self) -> u64 {
        self.state.lock().unwrap().lag_ms
    }

    /// Record the outcome of a probe. Called only by the health monitor.
    pub fn set_health(&self, healthy: bool, lag_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.healthy = healthy;
        state.lag_ms = lag_ms;
    }
}

/// The two ordered partitions of configured upstreams. Every upstream is in
/// exactly one of the two vectors at all times; moves happen under the
/// owning mutex and touch nothing else.
#[derive(Default)]
pub struct ServerSets {
    pub healthy: Vec<Arc<Upstream>>,
    pub unhealthy: Vec<Arc<Upstream>>,
}

impl ServerSets {
    /// Move an upstream from the unhealthy set to the healthy set.
    pub fn promote(&mut self, id: Uuid) {
        if let Some(pos) = self.unhealthy.iter().position(|u| u.id == id) {
            let upstream = self.unhealthy.remove(pos);
            self.healthy.push(upstream);
        }
    }

    /// Move an upstream from the healthy set to the unhealthy set.
    pub fn demote(&mut self, id: Uuid) {
        if let Some(pos) = self.healthy.iter().position(|u| u.id == id) {
            let upstream = self.healthy.remove(pos);
            self.unhealthy.push(upstream);
        }
    }

    pub fn all(&self) -> Vec<Arc<Upstream>> {
        self.healthy
            .iter()
            .chain(self.unhealthy.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn upstream() -> Arc<Upstream> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while matches!(sock.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });
        let pool = ConnectionPool::new(PoolConfig::new(&addr, 1)).await.unwrap();
        Upstream::from_parts(addr, pool)
    }

    #[tokio::test]
    async fn membership_is_exclusive() {
        let a = upstream().await;
        let b = upstream().await;
        let mut sets = ServerSets::default();
        sets.healthy.push(a.clone());
        sets.healthy.push(b.clone());

        sets.demote(a.id);
        assert_eq!(sets.healthy.len(), 1);
        assert_eq!(sets.unhealthy.len(), 1);
        assert_eq!(sets.unhealthy[0].id, a.id);

        // demoting again is a no-op
        sets.demote(a.id);
        assert_eq!(sets.healthy.len(), 1);
        assert_eq!(sets.unhealthy.len(), 1);

        sets.promote(a.id);
        assert_eq!(sets.healthy.len(), 2);
        assert!(sets.unhealthy.is_empty());
        assert_eq!(sets.all().len(), 2);
    }
}
