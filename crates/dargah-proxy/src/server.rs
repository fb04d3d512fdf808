//! Proxy assembly: configured upstreams, server sets, health monitors,
//! audit sink and the client accept loop.

use crate::audit::AuditSink;
use crate::health::HealthMonitor;
use crate::router::Router;
use crate::session::{handle_session, SessionContext};
use crate::upstream::{ServerSets, Upstream};
use anyhow::Context;
use dargah_common::Config;
use dargah_store::Store;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One upstream's place in the partition, with its last observed probe
/// latency.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UpstreamStatus {
    pub addr: String,
    pub lag_ms: u64,
}

pub struct Proxy {
    config: Config,
    sets: Arc<Mutex<ServerSets>>,
    router: Arc<Router>,
    store: Store,
    session_ctx: Arc<SessionContext>,
    conn_counter: AtomicU64,
    cancel: CancellationToken,
}

impl Proxy {
    /// Build the proxy: dial every configured upstream, fill its pool, and
    /// start the health monitors and audit drain. Startup fails if any
    /// upstream is unreachable — membership churn afterwards is the health
    /// monitor's job.
    pub async fn new(config: Config, store: Store) -> anyhow::Result<Arc<Self>> {
        let mut healthy = Vec::new();
        for addr in &config.servers {
            let addr = addr.trim();
            if addr.is_empty() {
                continue;
            }
            let upstream = Upstream::connect(addr, config.connection_pool_size)
                .await
                .with_context(|| format!("failed to connect upstream {addr}"))?;
            info!(addr, pool_size = config.connection_pool_size, "upstream connected");
            healthy.push(upstream);
        }
        anyhow::ensure!(!healthy.is_empty(), "no upstream servers configured");

        let sets = Arc::new(Mutex::new(ServerSets {
            healthy,
            unhealthy: Vec::new(),
        }));
        let router = Arc::new(Router::new(sets.clone()));
        let cancel = CancellationToken::new();
        let audit = AuditSink::spawn(store.requests(), store.sqls());

        let session_ctx = Arc::new(SessionContext {
            jwt_secret: config.jwt_secret.clone(),
            max_frame_size: config.max_frame_size,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            users: store.users(),
            router: router.clone(),
            audit,
            cancel: cancel.clone(),
        });

        let monitor = HealthMonitor {
            interval: Duration::from_secs(config.ping_interval.max(1)),
            sets: sets.clone(),
            checks: store.health_checks(),
            tick_counter: Arc::new(AtomicU64::new(0)),
            cancel: cancel.clone(),
        };
        for upstream in sets.lock().unwrap().all() {
            monitor.spawn(upstream);
        }

        Ok(Arc::new(Self {
            config,
            sets,
            router,
            store,
            session_ctx,
            conn_counter: AtomicU64::new(0),
            cancel,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Snapshot of the healthy and unhealthy sets, for the admin surface.
    pub fn membership(&self) -> (Vec<UpstreamStatus>, Vec<UpstreamStatus>) {
        let status = |u: &Arc<Upstream>| UpstreamStatus {
            addr: u.addr.clone(),
            lag_ms: u.lag_ms(),
        };
        let sets = self.sets.lock().unwrap();
        (
            sets.healthy.iter().map(status).collect(),
            sets.unhealthy.iter().map(status).collect(),
        )
    }

    /// Bind the client listener.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .with_context(|| format!("failed to listen on {}", self.config.listen_address))?;
        info!(addr = %listener.local_addr()?, "proxy listening");
        Ok(listener)
    }

    /// Accept clients until shutdown. One task per session.
    pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept connection");
                    continue;
                }
            };

            let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(conn_id, peer = %peer_addr, "client connected");

            tune_client_socket(&socket, conn_id);

            let ctx = self.session_ctx.clone();
            tokio::spawn(handle_session(ctx, socket, conn_id));
        }
    }

    /// Cancel every task and close every pool. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("proxy shutting down");
        self.cancel.cancel();
        let upstreams = self.sets.lock().unwrap().all();
        for upstream in upstreams {
            upstream.pool.close().await;
        }
    }
}

/// Keepalive idle time for accepted client sockets. A client that vanishes
/// without a FIN must be detected well before its session pins a pooled
/// backend connection for good.
const CLIENT_KEEPALIVE: Duration = Duration::from_secs(10);

/// Tune an accepted client socket: disable Nagle and arm TCP keepalive.
/// Failures are logged against the session and otherwise ignored; a socket
/// without keepalive still works, it just dies slower.
fn tune_client_socket(stream: &TcpStream, conn_id: u64) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(conn_id, error = %err, "could not disable Nagle on client socket");
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(CLIENT_KEEPALIVE)
        .with_interval(CLIENT_KEEPALIVE / 2);
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    let sock = socket2::SockRef::from(stream);
    let armed = sock
        .set_keepalive(true)
        .and_then(|()| sock.set_tcp_keepalive(&keepalive));
    if let Err(err) = armed {
        warn!(conn_id, error = %err, "keepalive not armed on client socket");
    }
}
