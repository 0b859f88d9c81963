//! Worker entry point: `runclaim [--watch]`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use runclaim::config::{CliOverrides, Config};
use runclaim::orchestrator::WorkerLoop;
use runclaim::stage::{ProcessRunner, StageRunner};
use runclaim::store::{HttpRunStore, RunStore};

use super::super::Cli;

pub async fn cmd_worker(cli: &Cli) -> Result<()> {
    let overrides = CliOverrides {
        worker_id: cli.worker_id.clone(),
        limit: cli.limit,
        timeout_sec: cli.timeout_sec,
        stale_minutes: cli.stale_minutes,
        interval_sec: cli.interval_sec,
    };
    let config = Config::load(cli.config.as_deref(), &overrides)
        .context("Failed to load worker configuration")?;

    let store: Arc<dyn RunStore> =
        Arc::new(HttpRunStore::new(&config.store).context("Failed to build run store client")?);
    let runner: Arc<dyn StageRunner> = Arc::new(ProcessRunner::new());
    let worker = WorkerLoop::new(&config, store, runner);

    info!(
        worker_id = %config.worker_id,
        limit = config.limit,
        timeout_secs = config.stage_timeout.as_secs(),
        watch = cli.watch,
        "worker starting"
    );

    if cli.watch {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };
        worker.watch(config.poll_interval, shutdown).await;
    } else {
        let summary = worker.run_pass().await;
        info!(
            claimed = summary.claimed,
            advanced = summary.advanced,
            errors = summary.errors,
            "single pass finished"
        );
    }
    Ok(())
}
