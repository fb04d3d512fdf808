//! Tracing layer that copies log events into the audit database.
//!
//! Events are handed to a background task over an unbounded channel so the
//! logging hot path never touches SQLite. Insert failures are dropped on the
//! floor; logging about them would recurse into this layer.

use crate::logs::LogStore;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

struct CapturedEvent {
    level: String,
    timestamp: i64,
    target: String,
    message: String,
    fields: String,
}

/// A `tracing_subscriber` layer forwarding events to the log store.
pub struct StoreLayer {
    tx: mpsc::UnboundedSender<CapturedEvent>,
}

impl StoreLayer {
    /// Create the layer and spawn its writer task on the current runtime.
    pub fn spawn(store: LogStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CapturedEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = store
                    .append(
                        &event.level,
                        event.timestamp,
                        &event.target,
                        &event.message,
                        &event.fields,
                    )
                    .await;
            }
        });

        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for StoreLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let captured = CapturedEvent {
            level: event.metadata().level().to_string(),
            timestamp: Utc::now().timestamp(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
            fields: serde_json::Value::Object(visitor.fields).to_string(),
        };

        let _ = self.tx.send(captured);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}").into());
        }
    }
}
