//! Rows persisted by the audit repository.
//!
//! Identifiers are stored as hyphenated UUID text so the rows stay readable
//! with plain `sqlite3` tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A proxy user as recorded in the `users` table.
///
/// `password` holds a hex-encoded SHA-512 digest, never the cleartext.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One accepted client connection.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub user_id: String,
    pub conn_id: i64,
    pub server_addr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One SQL statement observed during a request.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Sql {
    pub id: String,
    pub request_id: String,
    pub sql: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One health probe of one upstream.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: String,
    pub addr: String,
    pub healthy: bool,
    pub lag_ms: i64,
    pub state_change: bool,
    pub nth: i64,
    pub created_at: DateTime<Utc>,
}

/// A structured log line captured from the tracing pipeline.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub level: String,
    pub timestamp: i64,
    pub target: String,
    pub message: String,
    /// Remaining event fields, JSON-encoded.
    pub fields: String,
}

/// A page of rows together with its pagination parameters.
#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub result: Vec<T>,
    pub page: i64,
    pub page_size: i64,
}

impl<T> Paginated<T> {
    pub fn new(result: Vec<T>, page: i64, page_size: i64) -> Self {
        Self {
            result,
            page,
            page_size,
        }
    }
}

/// Clamp page/page_size to sane bounds and return the OFFSET.
pub(crate) fn page_offset(page: i64, page_size: i64) -> (i64, i64, i64) {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 500);
    (page, page_size, (page - 1) * page_size)
}
