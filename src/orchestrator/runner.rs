use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, events};
use crate::claim::ClaimManager;
use crate::config::Config;
use crate::dispatch::{DispatchOutcome, RunDispatcher};
use crate::stage::StageRunner;
use crate::store::{Run, RunFilter, RunQuery, RunStatus, RunStore};

/// Longest error message stored in a `run.error` event.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Counters for one pass over the run table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub stale_released: usize,
    pub candidates: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    pub advanced: usize,
    pub awaiting_gate: usize,
    pub blocked: usize,
    pub transient_failures: usize,
    pub fatal_failures: usize,
    pub ignored: usize,
    pub errors: usize,
}

impl PassSummary {
    fn count(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Advanced { .. } => self.advanced += 1,
            DispatchOutcome::AwaitingGate => self.awaiting_gate += 1,
            DispatchOutcome::Blocked { .. } => self.blocked += 1,
            DispatchOutcome::StageFailed {
                transient: true, ..
            } => self.transient_failures += 1,
            DispatchOutcome::StageFailed { .. } => self.fatal_failures += 1,
            DispatchOutcome::Ignored => self.ignored += 1,
        }
    }
}

/// One worker identity polling the run table.
pub struct WorkerLoop {
    store: Arc<dyn RunStore>,
    claims: Arc<ClaimManager>,
    dispatcher: RunDispatcher,
    audit: AuditLog,
    worker_id: String,
    limit: usize,
    stale_minutes: i64,
    max_fail_count: u32,
}

impl WorkerLoop {
    pub fn new(config: &Config, store: Arc<dyn RunStore>, runner: Arc<dyn StageRunner>) -> Self {
        let audit = AuditLog::new(store.clone(), config.worker_id.clone());
        let claims = Arc::new(ClaimManager::new(
            store.clone(),
            audit.clone(),
            config.max_fail_count,
        ));
        let dispatcher = RunDispatcher::new(config, claims.clone(), runner, audit.clone());
        Self {
            store,
            claims,
            dispatcher,
            audit,
            worker_id: config.worker_id.clone(),
            limit: config.limit,
            stale_minutes: config.stale_minutes,
            max_fail_count: config.max_fail_count,
        }
    }

    /// Sweep stale claims, then claim and dispatch each eligible run in turn.
    ///
    /// Every claim this pass acquires is released before it returns,
    /// whatever the dispatch did.
    pub async fn run_pass(&self) -> PassSummary {
        let started = Instant::now();
        let mut summary = PassSummary {
            stale_released: self.claims.release_stale(self.stale_minutes).await,
            ..Default::default()
        };

        let candidates = match self.store.get(&self.candidate_query()).await {
            Ok(runs) => runs,
            Err(e) => {
                error!(error = %e, "failed to fetch candidate runs");
                return summary;
            }
        };
        summary.candidates = candidates.len();
        debug!(count = candidates.len(), "fetched candidate runs");

        for candidate in &candidates {
            let slug = candidate.run_slug.as_str();
            let run = match self.claims.try_claim(slug, &self.worker_id).await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    debug!(run_slug = slug, "claimed elsewhere or no longer eligible, skipping");
                    summary.lost_claims += 1;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    warn!(run_slug = slug, error = %e, "claim request failed, skipping");
                    summary.errors += 1;
                    continue;
                }
                Err(e) => {
                    // Every later claim would be rejected the same way.
                    error!(run_slug = slug, error = %e, "claim request rejected, ending pass");
                    summary.errors += 1;
                    break;
                }
            };
            summary.claimed += 1;

            // Dispatch the row returned by the claim, not the fetched one.
            match self.dispatch_caught(&run).await {
                Ok(outcome) => {
                    info!(run_slug = slug, outcome = outcome.label(), "dispatched run");
                    summary.count(&outcome);
                }
                Err(e) => {
                    summary.errors += 1;
                    self.record_error(&run, &e).await;
                }
            }

            self.claims.release(slug).await;
        }

        info!(
            candidates = summary.candidates,
            claimed = summary.claimed,
            errors = summary.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pass completed"
        );
        self.audit
            .record_worker(
                events::PASS_COMPLETED,
                "pass completed",
                json!({ "summary": summary }),
            )
            .await;
        summary
    }

    /// Repeat [`run_pass`](Self::run_pass) every `interval` until `shutdown`
    /// resolves. A pass in progress always finishes. Returns the pass count.
    pub async fn watch<F>(&self, interval: Duration, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut passes = 0;
        loop {
            self.run_pass().await;
            passes += 1;
            tokio::select! {
                _ = &mut shutdown => {
                    info!(passes, "shutdown requested, stopping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        passes
    }

    /// Dispatch `run`, turning a panic anywhere below into an error so the
    /// claim is still released and the rest of the batch still runs.
    async fn dispatch_caught(&self, run: &Run) -> anyhow::Result<DispatchOutcome> {
        match AssertUnwindSafe(self.dispatcher.process(run))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("dispatch panicked: {}", panic_message(&*payload))),
        }
    }

    fn candidate_query(&self) -> RunQuery {
        RunQuery::new(
            RunFilter::new()
                .unclaimed()
                .fail_count_below(self.max_fail_count)
                .status_in(RunStatus::ACTIONABLE),
        )
        .newest_first()
        .limit(self.limit)
    }

    async fn record_error(&self, run: &Run, err: &anyhow::Error) {
        let message = truncate_chars(&format!("{:#}", err), MAX_ERROR_MESSAGE_CHARS);
        error!(run_slug = %run.run_slug, error = %message, "dispatch failed");
        self.audit
            .record(
                &run.run_slug,
                events::RUN_ERROR,
                &message,
                json!({ "status": run.status }),
            )
            .await;
        if let Err(e) = self.claims.increment_fail(&run.run_slug).await {
            warn!(run_slug = %run.run_slug, error = %e, "failed to count dispatch error");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
