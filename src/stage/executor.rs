//! Stage execution engine.
//!
//! Spawns one stage command as a subprocess, captures its output, and kills it
//! if it outlives the timeout. Retry and failure accounting live in the
//! dispatcher, not here.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::types::{CommandOutput, StageInvocation};

/// Abstraction over stage execution for testability.
/// Real implementation: `ProcessRunner`. Test double: scripted runners in tests.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Run the invocation to completion or until `limit` elapses.
    ///
    /// `Err` means the process could not be started or awaited at all.
    async fn run(&self, invocation: &StageInvocation, limit: Duration) -> Result<CommandOutput>;
}

/// Runs stage commands as local subprocesses.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageRunner for ProcessRunner {
    async fn run(&self, invocation: &StageInvocation, limit: Duration) -> Result<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("RUNCLAIM_RUN_SLUG", &invocation.run_slug)
            .env("RUNCLAIM_STAGE", invocation.kind.as_str());
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        info!(
            run_slug = %invocation.run_slug,
            stage = %invocation.kind,
            program = %invocation.program,
            timeout_secs = limit.as_secs(),
            "starting stage"
        );

        let started = Instant::now();
        let child = command.spawn().with_context(|| {
            format!(
                "Failed to spawn {} stage command: {}",
                invocation.kind, invocation.program
            )
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for stage command")?,
            Err(_) => {
                return Ok(CommandOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("stage timed out after {} seconds", limit.as_secs()),
                    timed_out: true,
                    duration: started.elapsed(),
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            duration: started.elapsed(),
        };
        debug!(
            run_slug = %invocation.run_slug,
            stage = %invocation.kind,
            exit_code = ?result.exit_code,
            elapsed_ms = result.duration.as_millis() as u64,
            "stage finished"
        );
        Ok(result)
    }
}
