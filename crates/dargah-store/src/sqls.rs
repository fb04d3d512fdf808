//! SQL-trail repository

use crate::models::{page_offset, Paginated, Sql};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, sql: &Sql) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sqls (id, request_id, sql, is_read, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sql.id)
        .bind(&sql.request_id)
        .bind(&sql.sql)
        .bind(sql.is_read)
        .bind(sql.created_at)
        .bind(sql.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Statements observed during one request, oldest first.
    pub async fn list_by_request(&self, request_id: &str) -> sqlx::Result<Vec<Sql>> {
        sqlx::query_as::<_, Sql>(
            "SELECT * FROM sqls WHERE request_id = ? ORDER BY created_at",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list(&self, page: i64, page_size: i64) -> sqlx::Result<Paginated<Sql>> {
        let (page, page_size, offset) = page_offset(page, page_size);
        let rows = sqlx::query_as::<_, Sql>(
            "SELECT * FROM sqls ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(Paginated::new(rows, page, page_size))
    }
}
