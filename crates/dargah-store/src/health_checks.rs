//! Health-check history repository

use crate::models::{page_offset, HealthCheck, Paginated};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct HealthCheckStore {
    pool: SqlitePool,
}

impl HealthCheckStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, check: &HealthCheck) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO health_checks (id, addr, healthy, lag_ms, state_change, nth, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&check.id)
        .bind(&check.addr)
        .bind(check.healthy)
        .bind(check.lag_ms)
        .bind(check.state_change)
        .bind(check.nth)
        .bind(check.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self, page: i64, page_size: i64) -> sqlx::Result<Paginated<HealthCheck>> {
        let (page, page_size, offset) = page_offset(page, page_size);
        let rows = sqlx::query_as::<_, HealthCheck>(
            "SELECT * FROM health_checks ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(Paginated::new(rows, page, page_size))
    }

    /// Number of recorded transitions for one upstream.
    pub async fn transition_count(&self, addr: &str) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM health_checks WHERE addr = ? AND state_change = 1",
        )
        .bind(addr)
        .fetch_one(&self.pool)
        .await
    }
}
