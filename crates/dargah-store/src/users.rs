//! User repository

use crate::models::{page_offset, Paginated, User};
use chrono::Utc;
use dargah_common::Role;
use sha2::{Digest, Sha512};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

/// Hash a cleartext password for storage.
pub fn hash_password(password: &str) -> String {
    let digest = Sha512::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new user. The password is hashed here; callers pass cleartext.
    pub async fn create(&self, username: &str, password: &str, role: Role) -> sqlx::Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password: hash_password(password),
            role: role.as_str().to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        debug!(username, role = %role, "creating user");

        sqlx::query(
            r#"
            INSERT INTO users (id, username, password, role, created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.password)
        .bind(&user.role)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    /// Ensure a user exists with the given credentials and role, creating or
    /// updating as needed. Used to bootstrap the admin account at startup.
    pub async fn upsert(&self, username: &str, password: &str, role: Role) -> sqlx::Result<User> {
        match self.get_by_username(username).await? {
            Some(existing) => {
                sqlx::query("UPDATE users SET password = ?, role = ?, updated_at = ? WHERE id = ?")
                    .bind(hash_password(password))
                    .bind(role.as_str())
                    .bind(Utc::now())
                    .bind(&existing.id)
                    .execute(&self.pool)
                    .await?;
                self.get_by_username(username)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)
            }
            None => self.create(username, password, role).await,
        }
    }

    pub async fn get_by_username(&self, username: &str) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE username = ? AND deleted_at IS NULL",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_by_id(&self, id: &str) -> sqlx::Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Update password and/or role for an existing user.
    pub async fn update(
        &self,
        id: &str,
        password: Option<&str>,
        role: Option<Role>,
    ) -> sqlx::Result<bool> {
        let mut changed = false;
        if let Some(password) = password {
            let result = sqlx::query("UPDATE users SET password = ?, updated_at = ? WHERE id = ?")
                .bind(hash_password(password))
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
            changed |= result.rows_affected() > 0;
        }
        if let Some(role) = role {
            let result = sqlx::query("UPDATE users SET role = ?, updated_at = ? WHERE id = ?")
                .bind(role.as_str())
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
            changed |= result.rows_affected() > 0;
        }
        Ok(changed)
    }

    /// Soft-delete a user.
    pub async fn delete(&self, id: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE users SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, page: i64, page_size: i64) -> sqlx::Result<Paginated<User>> {
        let (page, page_size, offset) = page_offset(page, page_size);
        let rows = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE deleted_at IS NULL ORDER BY created_at LIMIT ? OFFSET ?",
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(Paginated::new(rows, page, page_size))
    }

    /// Verify a cleartext password against the stored digest.
    pub fn verify_password(user: &User, password: &str) -> bool {
        user.password == hash_password(password)
    }
}
