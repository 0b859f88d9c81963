//! Remote run store: typed reads, conditional patches, and event inserts.
//!
//! The store speaks a PostgREST-style REST dialect. Filters are built as typed
//! [`RunFilter`] values so the same predicate can be rendered to query
//! parameters for [`HttpRunStore`] or evaluated directly by [`MemoryRunStore`].

pub mod http;
pub mod memory;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::errors::StoreError;
pub use http::HttpRunStore;
pub use memory::MemoryRunStore;
pub use models::{MAX_FAIL_COUNT, Run, RunEvent, RunStatus};

/// Abstraction over the shared run table for testability.
/// Real implementation: `HttpRunStore`. Test double: `MemoryRunStore`.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError>;

    /// Apply `patch` to every row matching `filter` and return the rows that
    /// were updated. An empty result means the precondition did not hold.
    async fn conditional_patch(
        &self,
        filter: &RunFilter,
        patch: &RunPatch,
    ) -> Result<Vec<Run>, StoreError>;

    async fn insert_event(&self, event: &RunEvent) -> Result<(), StoreError>;
}

/// A single predicate on a run row.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    SlugEq(String),
    ClaimedByIsNull,
    ClaimedAtBefore(DateTime<Utc>),
    FailCountBelow(u32),
    StatusIn(Vec<RunStatus>),
}

impl Condition {
    fn to_query_pair(&self) -> (String, String) {
        match self {
            Condition::SlugEq(slug) => ("run_slug".into(), format!("eq.{}", slug)),
            Condition::ClaimedByIsNull => ("claimed_by".into(), "is.null".into()),
            Condition::ClaimedAtBefore(ts) => (
                "claimed_at".into(),
                format!("lt.{}", ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            Condition::FailCountBelow(n) => ("fail_count".into(), format!("lt.{}", n)),
            Condition::StatusIn(statuses) => {
                let list = statuses
                    .iter()
                    .map(RunStatus::as_str)
                    .collect::<Vec<_>>()
                    .join(",");
                ("status".into(), format!("in.({})", list))
            }
        }
    }

    fn matches(&self, run: &Run) -> bool {
        match self {
            Condition::SlugEq(slug) => &run.run_slug == slug,
            Condition::ClaimedByIsNull => run.claimed_by.is_none(),
            // A null timestamp never compares as older, same as SQL.
            Condition::ClaimedAtBefore(ts) => run.claimed_at.is_some_and(|at| at < *ts),
            Condition::FailCountBelow(n) => run.fail_count < *n,
            Condition::StatusIn(statuses) => statuses.contains(&run.status),
        }
    }
}

/// Conjunction of [`Condition`]s. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFilter {
    conditions: Vec<Condition>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slug(mut self, slug: impl Into<String>) -> Self {
        self.conditions.push(Condition::SlugEq(slug.into()));
        self
    }

    pub fn unclaimed(mut self) -> Self {
        self.conditions.push(Condition::ClaimedByIsNull);
        self
    }

    pub fn claimed_before(mut self, ts: DateTime<Utc>) -> Self {
        self.conditions.push(Condition::ClaimedAtBefore(ts));
        self
    }

    pub fn fail_count_below(mut self, n: u32) -> Self {
        self.conditions.push(Condition::FailCountBelow(n));
        self
    }

    pub fn status_in(mut self, statuses: impl IntoIterator<Item = RunStatus>) -> Self {
        self.conditions
            .push(Condition::StatusIn(statuses.into_iter().collect()));
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.conditions.iter().all(|c| c.matches(run))
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.conditions.iter().map(Condition::to_query_pair).collect()
    }
}

/// A read against the run table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunQuery {
    pub filter: RunFilter,
    /// Most recently updated first when set.
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl RunQuery {
    pub fn new(filter: RunFilter) -> Self {
        Self {
            filter,
            newest_first: false,
            limit: None,
        }
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), "*".to_string())];
        pairs.extend(self.filter.to_query_pairs());
        if self.newest_first {
            pairs.push(("order".into(), "updated_at.desc".into()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".into(), limit.to_string()));
        }
        pairs
    }
}

/// Partial update of a run row. Only `Some` fields are sent; `Some(None)`
/// writes an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

impl RunPatch {
    pub fn claim(worker_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            claimed_by: Some(Some(worker_id.to_string())),
            claimed_at: Some(Some(at)),
            ..Default::default()
        }
    }

    pub fn release() -> Self {
        Self {
            claimed_by: Some(None),
            claimed_at: Some(None),
            ..Default::default()
        }
    }

    /// Set the fail count, tripping the run to `failed` once it reaches `max`.
    pub fn fail_count(count: u32, max: u32) -> Self {
        Self {
            fail_count: Some(count),
            status: (count >= max).then_some(RunStatus::Failed),
            ..Default::default()
        }
    }

    pub fn apply(&self, run: &mut Run) {
        if let Some(claimed_by) = &self.claimed_by {
            run.claimed_by = claimed_by.clone();
        }
        if let Some(claimed_at) = self.claimed_at {
            run.claimed_at = claimed_at;
        }
        if let Some(fail_count) = self.fail_count {
            run.fail_count = fail_count;
        }
        if let Some(status) = &self.status {
            run.status = status.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    #[test]
    fn test_filter_renders_postgrest_pairs() {
        let cutoff = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let filter = RunFilter::new()
            .slug("r1")
            .unclaimed()
            .claimed_before(cutoff)
            .fail_count_below(3)
            .status_in(RunStatus::ACTIONABLE);

        assert_eq!(
            filter.to_query_pairs(),
            vec![
                ("run_slug".to_string(), "eq.r1".to_string()),
                ("claimed_by".to_string(), "is.null".to_string()),
                (
                    "claimed_at".to_string(),
                    "lt.2026-10-18T09:00:00.000Z".to_string()
                ),
                ("fail_count".to_string(), "lt.3".to_string()),
                (
                    "status".to_string(),
                    "in.(draft_ready_waiting_gate_1,assets_ready_waiting_gate_2,rendering)"
                        .to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_query_adds_order_and_limit() {
        let query = RunQuery::new(RunFilter::new().unclaimed())
            .newest_first()
            .limit(20);
        let pairs = query.to_query_pairs();
        assert_eq!(pairs[0], ("select".to_string(), "*".to_string()));
        assert!(pairs.contains(&("order".to_string(), "updated_at.desc".to_string())));
        assert!(pairs.contains(&("limit".to_string(), "20".to_string())));
    }

    #[test]
    fn test_filter_matches_claim_state() {
        let mut run = Run::new("r1", RunStatus::Rendering);
        let filter = RunFilter::new().slug("r1").unclaimed();
        assert!(filter.matches(&run));

        run.claimed_by = Some("worker-a".into());
        run.claimed_at = Some(Utc::now());
        assert!(!filter.matches(&run));
        assert!(!RunFilter::new().slug("r2").matches(&run));
    }

    #[test]
    fn test_claimed_before_ignores_unclaimed_rows() {
        let cutoff = Utc::now() - Duration::minutes(30);
        let mut run = Run::new("r1", RunStatus::Rendering);
        let filter = RunFilter::new().claimed_before(cutoff);
        assert!(!filter.matches(&run));

        run.claimed_at = Some(Utc::now() - Duration::minutes(45));
        assert!(filter.matches(&run));

        run.claimed_at = Some(Utc::now() - Duration::minutes(5));
        assert!(!filter.matches(&run));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let run = Run::new("anything", RunStatus::Other("published".into()));
        assert!(RunFilter::new().matches(&run));
    }

    #[test]
    fn test_release_patch_writes_explicit_nulls() {
        let value = serde_json::to_value(RunPatch::release()).unwrap();
        assert_eq!(value, json!({"claimed_by": null, "claimed_at": null}));
    }

    #[test]
    fn test_fail_count_patch_trips_status_at_threshold() {
        let below = serde_json::to_value(RunPatch::fail_count(2, 3)).unwrap();
        assert_eq!(below, json!({"fail_count": 2}));

        let at = serde_json::to_value(RunPatch::fail_count(3, 3)).unwrap();
        assert_eq!(at, json!({"fail_count": 3, "status": "failed"}));
    }

    #[test]
    fn test_patch_apply_sets_claim_pair_together() {
        let mut run = Run::new("r1", RunStatus::Rendering);
        let now = Utc::now();
        RunPatch::claim("worker-a", now).apply(&mut run);
        assert_eq!(run.claimed_by.as_deref(), Some("worker-a"));
        assert_eq!(run.claimed_at, Some(now));

        RunPatch::release().apply(&mut run);
        assert!(run.claimed_by.is_none());
        assert!(run.claimed_at.is_none());
    }
}
