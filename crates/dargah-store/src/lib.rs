//! Dargah audit store
//!
//! SQLite-backed repositories for the proxy's durable state: users,
//! requests, the SQL trail, health-check history and captured log lines.
//! The proxy core only ever sees the narrow async APIs exposed here.

pub mod health_checks;
pub mod log_writer;
pub mod logs;
pub mod models;
pub mod requests;
pub mod sqls;
pub mod users;

pub use health_checks::HealthCheckStore;
pub use log_writer::StoreLayer;
pub use logs::LogStore;
pub use models::{HealthCheck, LogEntry, Paginated, Request, Sql, User};
pub use requests::RequestStore;
pub use sqls::SqlStore;
pub use users::UserStore;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Handle to the audit database; hands out per-table stores.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the SQLite database at `url`.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url: {url}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to open audit database")?;

        info!("Audit database connection established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool. Useful for in-memory test databases where the
    /// pool must be capped at a single connection.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create every table the proxy relies on.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                conn_id INTEGER NOT NULL,
                server_addr TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sqls (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                sql TEXT NOT NULL,
                is_read BOOLEAN NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS health_checks (
                id TEXT PRIMARY KEY,
                addr TEXT NOT NULL,
                healthy BOOLEAN NOT NULL,
                lag_ms INTEGER NOT NULL,
                state_change BOOLEAN NOT NULL,
                nth INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                target TEXT NOT NULL,
                message TEXT NOT NULL,
                fields TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sqls_request_id ON sqls(request_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_health_checks_addr ON health_checks(addr)")
            .execute(&self.pool)
            .await?;

        info!("Audit database migrations completed");

        Ok(())
    }

    pub fn users(&self) -> UserStore {
        UserStore::new(self.pool.clone())
    }

    pub fn requests(&self) -> RequestStore {
        RequestStore::new(self.pool.clone())
    }

    pub fn sqls(&self) -> SqlStore {
        SqlStore::new(self.pool.clone())
    }

    pub fn health_checks(&self) -> HealthCheckStore {
        HealthCheckStore::new(self.pool.clone())
    }

    pub fn logs(&self) -> LogStore {
        LogStore::new(self.pool.clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn memory_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store { pool };
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = memory_store().await;
        store.migrate().await.unwrap();
    }
}

#[cfg(test)]
pub(crate) use tests::memory_store;
