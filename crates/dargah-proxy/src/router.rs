//! Round-robin selection over the healthy set.

use crate::upstream::{ServerSets, Upstream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct Router {
    sets: Arc<Mutex<ServerSets>>,
    counter: AtomicU64,
}

impl Router {
    pub fn new(sets: Arc<Mutex<ServerSets>>) -> Self {
        Self {
            sets,
            counter: AtomicU64::new(0),
        }
    }

    /// Next healthy upstream, or `None` when the healthy set is empty.
    ///
    /// The healthy set is snapshotted once per call; a concurrent move by
    /// the health monitor yields a stale-but-consistent pick, which the
    /// acquire-time probe will catch.
    pub fn next_healthy(&self) -> Option<Arc<Upstream>> {
        let healthy = self.sets.lock().unwrap().healthy.clone();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize % healthy.len();
        Some(healthy[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    async fn upstreams(n: usize) -> Vec<Arc<Upstream>> {
        let mut result = Vec::new();
        for _ in 0..n {
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
            result.push(Upstream::from_parts(addr, pool));
        }
        result
    }

    #[tokio::test]
    async fn empty_set_yields_none() {
        let router = Router::new(Arc::new(Mutex::new(ServerSets::default())));
        assert!(router.next_healthy().is_none());
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let ups = upstreams(3).await;
        let sets = Arc::new(Mutex::new(ServerSets {
            healthy: ups.clone(),
            unhealthy: Vec::new(),
        }));
        let router = Router::new(sets);

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        let k = 10;
        for _ in 0..k {
            let picked = router.next_healthy().unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }

        // over K calls with H stable upstreams each is picked ⌊K/H⌋ or ⌈K/H⌉ times
        for up in &ups {
            let count = counts.get(&up.id).copied().unwrap_or(0);
            assert!(count == 3 || count == 4, "unfair pick count {count}");
        }
    }
}
