//! Claim lifecycle on the shared run table.
//!
//! The conditional patch `claimed_by IS NULL` is the only mutual exclusion
//! between workers. Workers may live on different machines, so there are no
//! in-process locks here.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditLog, events};
use crate::errors::StoreError;
use crate::store::{Run, RunFilter, RunPatch, RunQuery, RunStatus, RunStore};

pub const DEFAULT_STALE_MINUTES: i64 = 30;

/// Result of a fail-count increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailCount {
    pub count: u32,
    /// The increment pushed the run into `failed`.
    pub tripped: bool,
}

pub struct ClaimManager {
    store: Arc<dyn RunStore>,
    audit: AuditLog,
    max_fail_count: u32,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn RunStore>, audit: AuditLog, max_fail_count: u32) -> Self {
        Self {
            store,
            audit,
            max_fail_count,
        }
    }

    /// Atomically claim `run_slug` for `worker_id`.
    ///
    /// The claim only succeeds while the run is unclaimed and still eligible
    /// (actionable status, fail count below the limit), and yields the row as
    /// the store wrote it. `Ok(None)` means another worker holds the claim or
    /// the run is no longer eligible. Store failures are returned as errors,
    /// not as a lost race.
    pub async fn try_claim(
        &self,
        run_slug: &str,
        worker_id: &str,
    ) -> Result<Option<Run>, StoreError> {
        let now = Utc::now();
        let filter = RunFilter::new()
            .slug(run_slug)
            .unclaimed()
            .fail_count_below(self.max_fail_count)
            .status_in(RunStatus::ACTIONABLE);
        let rows = self
            .store
            .conditional_patch(&filter, &RunPatch::claim(worker_id, now))
            .await?;

        let claimed = rows.into_iter().next();
        if claimed.is_some() {
            info!(run_slug, worker_id, "claimed run");
            self.audit
                .record(
                    run_slug,
                    events::CLAIM_ACQUIRED,
                    "claim acquired",
                    json!({ "claimed_at": now }),
                )
                .await;
        }
        Ok(claimed)
    }

    /// Clear the claim on `run_slug` unconditionally. Safe to repeat.
    pub async fn release(&self, run_slug: &str) {
        match self
            .store
            .conditional_patch(&RunFilter::new().slug(run_slug), &RunPatch::release())
            .await
        {
            Ok(_) => {
                info!(run_slug, "released run");
                self.audit
                    .record(
                        run_slug,
                        events::CLAIM_RELEASED,
                        "claim released",
                        json!({}),
                    )
                    .await;
            }
            Err(e) => warn!(run_slug, error = %e, "failed to release claim"),
        }
    }

    /// Clear claims older than `stale_minutes`, recovering runs whose worker
    /// died before releasing. Best effort: errors are logged and count as zero.
    pub async fn release_stale(&self, stale_minutes: i64) -> usize {
        let Some(cutoff) = Duration::try_minutes(stale_minutes)
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            warn!(stale_minutes, "stale threshold out of range, skipping sweep");
            return 0;
        };
        let rows = match self
            .store
            .conditional_patch(&RunFilter::new().claimed_before(cutoff), &RunPatch::release())
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "stale claim sweep failed");
                return 0;
            }
        };

        for run in &rows {
            info!(run_slug = %run.run_slug, stale_minutes, "released stale claim");
            self.audit
                .record(
                    &run.run_slug,
                    events::CLAIM_STALE_RELEASED,
                    "stale claim released",
                    json!({ "stale_minutes": stale_minutes, "cutoff": cutoff }),
                )
                .await;
        }
        rows.len()
    }

    /// Count one fatal failure against `run_slug`.
    ///
    /// Reaching the limit sets `status = failed` in the same patch as the new
    /// count. Returns `None` if the run does not exist.
    pub async fn increment_fail(&self, run_slug: &str) -> Result<Option<FailCount>, StoreError> {
        let current = self
            .store
            .get(&RunQuery::new(RunFilter::new().slug(run_slug)).limit(1))
            .await?;
        let Some(run) = current.into_iter().next() else {
            warn!(run_slug, "cannot count failure for missing run");
            return Ok(None);
        };

        let count = run.fail_count.saturating_add(1);
        let patch = RunPatch::fail_count(count, self.max_fail_count);
        let tripped = patch.status.is_some();
        self.store
            .conditional_patch(&RunFilter::new().slug(run_slug), &patch)
            .await?;

        warn!(run_slug, fail_count = count, tripped, "counted fatal failure");
        self.audit
            .record(
                run_slug,
                events::FAIL_COUNT_INCREMENTED,
                &format!("fail_count {} -> {}", run.fail_count, count),
                json!({ "fail_count": count, "max_fail_count": self.max_fail_count }),
            )
            .await;
        if tripped {
            self.audit
                .record(
                    run_slug,
                    events::CIRCUIT_OPEN,
                    "fail limit reached, run marked failed",
                    json!({ "fail_count": count }),
                )
                .await;
        }
        Ok(Some(FailCount { count, tripped }))
    }
}
