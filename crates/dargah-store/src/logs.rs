//! Log repository

use crate::models::{page_offset, LogEntry, Paginated};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct LogStore {
    pool: SqlitePool,
}

impl LogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        level: &str,
        timestamp: i64,
        target: &str,
        message: &str,
        fields: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO log_entries (level, timestamp, target, message, fields)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(level)
        .bind(timestamp)
        .bind(target)
        .bind(message)
        .bind(fields)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self, page: i64, page_size: i64) -> sqlx::Result<Paginated<LogEntry>> {
        let (page, page_size, offset) = page_offset(page, page_size);
        let rows = sqlx::query_as::<_, LogEntry>(
            "SELECT * FROM log_entries ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(Paginated::new(rows, page, page_size))
    }
}
