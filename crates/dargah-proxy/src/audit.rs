//! Buffering of per-session audit records and their hand-off to the store.
//!
//! Sessions push one completed record when they end; a single background
//! task drains the channel and writes rows. A failing store write is logged
//! and dropped — the proxy path never waits on audit durability.

use crate::classify::QueryClass;
use chrono::{DateTime, Utc};
use dargah_store::{Request, RequestStore, Sql, SqlStore};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// One statement observed during a session, before persistence.
#[derive(Debug, Clone)]
pub struct SqlDraft {
    pub sql: String,
    pub class: QueryClass,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SqlDraft {
    pub fn new(sql: String, class: QueryClass) -> Self {
        Self {
            sql,
            class,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }
}

/// Everything a finished session hands to the audit sink.
#[derive(Debug)]
pub struct SessionRecord {
    pub request_id: String,
    pub user_id: String,
    pub conn_id: u64,
    pub server_addr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sqls: Vec<SqlDraft>,
}

impl SessionRecord {
    fn into_rows(self) -> (Request, Vec<Sql>) {
        let request = Request {
            id: self.request_id.clone(),
            user_id: self.user_id,
            conn_id: self.conn_id as i64,
            server_addr: self.server_addr,
            created_at: self.created_at,
            completed_at: self.completed_at,
        };
        let sqls = self
            .sqls
            .into_iter()
            .map(|draft| Sql {
                id: Uuid::new_v4().to_string(),
                request_id: self.request_id.clone(),
                sql: draft.sql,
                is_read: draft.class.is_read(),
                created_at: draft.created_at,
                completed_at: draft.completed_at,
            })
            .collect();
        (request, sqls)
    }
}

#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::UnboundedSender<SessionRecord>,
}

impl AuditSink {
    /// Create the sink and spawn its drain task on the current runtime.
    pub fn spawn(requests: RequestStore, sqls: SqlStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionRecord>();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let request_id = record.request_id.clone();
                let (request, rows) = record.into_rows();

                if let Err(err) = requests.create(&request).await {
                    warn!(request_id, error = %err, "failed to persist request");
                    continue;
                }
                for row in rows {
                    if let Err(err) = sqls.create(&row).await {
                        warn!(request_id, error = %err, "failed to persist sql record");
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queue a finished session; never blocks.
    pub fn submit(&self, record: SessionRecord) {
        let _ = self.tx.send(record);
    }
}
