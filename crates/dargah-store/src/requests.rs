//! Request repository

use crate::models::{page_offset, Paginated, Request};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct RequestStore {
    pool: SqlitePool,
}

impl RequestStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, request: &Request) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO requests (id, user_id, conn_id, server_addr, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.user_id)
        .bind(request.conn_id)
        .bind(&request.server_addr)
        .bind(request.created_at)
        .bind(request.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> sqlx::Result<Option<Request>> {
        sqlx::query_as::<_, Request>("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list(&self, page: i64, page_size: i64) -> sqlx::Result<Paginated<Request>> {
        let (page, page_size, offset) = page_offset(page, page_size);
        let rows = sqlx::query_as::<_, Request>(
            "SELECT * FROM requests ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(Paginated::new(rows, page, page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn create_and_list() {
        let store = memory_store().await;
        let requests = store.requests();

        let row = Request {
            id: Uuid::new_v4().to_string(),
            user_id: Uuid::new_v4().to_string(),
            conn_id: 7,
            server_addr: Some("127.0.0.1:5432".to_string()),
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        requests.create(&row).await.unwrap();

        let page = requests.list(1, 10).await.unwrap();
        assert_eq!(page.result.len(), 1);
        assert_eq!(page.result[0].conn_id, 7);
        assert!(requests.get(&row.id).await.unwrap().is_some());
    }
}
