//! Audit trail mirrored into the store's append-only event table.
//!
//! Recording is fire-and-forget: a failed insert is logged and dropped, and
//! never changes control flow.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::store::{RunEvent, RunStore};

/// Event type names written by the worker.
pub mod events {
    pub const CLAIM_ACQUIRED: &str = "claim.acquired";
    pub const CLAIM_RELEASED: &str = "claim.released";
    pub const CLAIM_STALE_RELEASED: &str = "claim.stale_released";
    pub const FAIL_COUNT_INCREMENTED: &str = "run.fail_count_incremented";
    pub const CIRCUIT_OPEN: &str = "run.circuit_open";
    pub const RUN_BLOCKED: &str = "run.blocked";
    pub const RUN_ERROR: &str = "run.error";
    pub const STAGE_STARTED: &str = "stage.started";
    pub const STAGE_SUCCEEDED: &str = "stage.succeeded";
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    pub const STAGE_TRANSIENT_FAILURE: &str = "stage.transient_failure";
    pub const STAGE_FATAL_FAILURE: &str = "stage.fatal_failure";
    pub const PASS_COMPLETED: &str = "worker.pass_completed";
}

/// Deterministic content hash used as the event table's unique key.
pub fn event_hash(ts: &DateTime<Utc>, event_type: &str, message: &str, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ts.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    hasher.update([0u8]);
    hasher.update(event_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    hasher.update([0u8]);
    hasher.update(data.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Build an event, tagging `data` with the worker identity and run slug.
pub fn build_event(
    worker_id: &str,
    run_slug: Option<&str>,
    event_type: &str,
    message: &str,
    data: Value,
) -> RunEvent {
    let mut data = match data {
        Value::Object(map) => Value::Object(map),
        Value::Null => json!({}),
        other => json!({ "detail": other }),
    };
    if let Value::Object(map) = &mut data {
        map.insert("worker_id".into(), Value::String(worker_id.to_string()));
        if let Some(slug) = run_slug {
            map.insert("run_slug".into(), Value::String(slug.to_string()));
        }
    }

    let ts = Utc::now();
    RunEvent {
        event_hash: event_hash(&ts, event_type, message, &data),
        ts,
        event_type: event_type.to_string(),
        message: message.to_string(),
        data,
    }
}

/// Writes audit events for one worker identity.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn RunStore>,
    worker_id: String,
}

impl AuditLog {
    pub fn new(store: Arc<dyn RunStore>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
        }
    }

    /// Record an event about a specific run. Never fails.
    pub async fn record(&self, run_slug: &str, event_type: &str, message: &str, data: Value) {
        self.insert(Some(run_slug), event_type, message, data).await;
    }

    /// Record an event not tied to a run. Never fails.
    pub async fn record_worker(&self, event_type: &str, message: &str, data: Value) {
        self.insert(None, event_type, message, data).await;
    }

    async fn insert(&self, run_slug: Option<&str>, event_type: &str, message: &str, data: Value) {
        let event = build_event(&self.worker_id, run_slug, event_type, message, data);
        if let Err(e) = self.store.insert_event(&event).await {
            warn!(
                event_type,
                run_slug = run_slug.unwrap_or("-"),
                error = %e,
                "failed to record audit event"
            );
        }
    }
}
