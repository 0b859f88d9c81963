//! Run status state machine.
//!
//! Given a claimed run, decide which external stages to invoke next and what
//! their outcomes mean:
//!
//! | Status                          | Needs                              | Action                                   |
//! |---------------------------------|------------------------------------|------------------------------------------|
//! | `draft_ready_waiting_gate_1`    | gate 1 approved                    | record gate → assets → voice → manifest  |
//! | `assets_ready_waiting_gate_2`   | gate 2 approved                    | record gate                              |
//! | `rendering`                     | gate 2, run-state file, manifest   | render against the manifest              |
//!
//! A fatal stage failure is counted with [`ClaimManager::increment_fail`] and
//! stops the sequence. A transient one is only logged.

pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditLog, events};
use crate::claim::ClaimManager;
use crate::config::Config;
use crate::stage::{OutcomeClassifier, StageKind, StageOutcome, StageRunner, build_invocation};
use crate::store::{Run, RunStatus};
use crate::worker_config::StagesSection;
pub use workspace::{ManifestSource, ResolvedManifest, RunWorkspace};

/// Stages run for an approved gate 1, in order.
pub const GATE1_SEQUENCE: [StageKind; 4] = [
    StageKind::ApproveGate,
    StageKind::GenerateAssets,
    StageKind::GenerateVoice,
    StageKind::BuildManifest,
];

/// What one dispatch pass did to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every stage in the sequence succeeded or was already done.
    Advanced {
        ran: Vec<StageKind>,
        skipped: Vec<StageKind>,
    },
    /// The gate for the current status has not been approved yet.
    AwaitingGate,
    /// Rendering preconditions are not met.
    Blocked { reason: String },
    /// A stage failed; fatal failures have already been counted.
    StageFailed {
        stage: StageKind,
        transient: bool,
        reason: String,
    },
    /// The status is not one the worker acts on.
    Ignored,
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::AwaitingGate => "awaiting_gate",
            Self::Blocked { .. } => "blocked",
            Self::StageFailed {
                transient: true, ..
            } => "transient_failure",
            Self::StageFailed { .. } => "fatal_failure",
            Self::Ignored => "ignored",
        }
    }
}

/// Outcome of running (or skipping) a single stage.
enum StepResult {
    Ran,
    Skipped,
    Failed(DispatchOutcome),
}

pub struct RunDispatcher {
    claims: Arc<ClaimManager>,
    runner: Arc<dyn StageRunner>,
    audit: AuditLog,
    classifier: OutcomeClassifier,
    stages: StagesSection,
    runs_root: PathBuf,
    stage_timeout: Duration,
}

impl RunDispatcher {
    pub fn new(
        config: &Config,
        claims: Arc<ClaimManager>,
        runner: Arc<dyn StageRunner>,
        audit: AuditLog,
    ) -> Self {
        Self {
            claims,
            runner,
            audit,
            classifier: OutcomeClassifier::new(&config.transient_patterns),
            stages: config.stages.clone(),
            runs_root: config.runs_root.clone(),
            stage_timeout: config.stage_timeout,
        }
    }

    /// Advance `run` as far as its status and gates allow.
    ///
    /// `Err` means something unexpected happened (a stage could not be
    /// spawned, for example); the caller counts that as a fatal failure.
    pub async fn process(&self, run: &Run) -> Result<DispatchOutcome> {
        let workspace = RunWorkspace::resolve(run, &self.runs_root);
        match &run.status {
            RunStatus::DraftReadyWaitingGate1 => {
                if !run.gate1_approved {
                    return Ok(DispatchOutcome::AwaitingGate);
                }
                self.run_sequence(run, &workspace, &GATE1_SEQUENCE, 1).await
            }
            RunStatus::AssetsReadyWaitingGate2 => {
                if !run.gate2_approved {
                    return Ok(DispatchOutcome::AwaitingGate);
                }
                self.run_sequence(run, &workspace, &[StageKind::ApproveGate], 2)
                    .await
            }
            RunStatus::Rendering => self.render(run, &workspace).await,
            RunStatus::Failed | RunStatus::Other(_) => Ok(DispatchOutcome::Ignored),
        }
    }

    async fn run_sequence(
        &self,
        run: &Run,
        workspace: &RunWorkspace,
        sequence: &[StageKind],
        gate: u8,
    ) -> Result<DispatchOutcome> {
        let mut ran = Vec::new();
        let mut skipped = Vec::new();
        for &kind in sequence {
            let extra = match kind {
                StageKind::ApproveGate => gate_args(run, gate),
                _ => Vec::new(),
            };
            match self.step(run, workspace, kind, extra).await? {
                StepResult::Ran => ran.push(kind),
                StepResult::Skipped => skipped.push(kind),
                StepResult::Failed(outcome) => return Ok(outcome),
            }
        }
        Ok(DispatchOutcome::Advanced { ran, skipped })
    }

    async fn render(&self, run: &Run, workspace: &RunWorkspace) -> Result<DispatchOutcome> {
        let manifest = if !run.gate2_approved {
            Err("gate 2 not approved".to_string())
        } else if !workspace.has_state_file() {
            Err(format!(
                "run state file missing: {}",
                workspace.state_file().display()
            ))
        } else {
            workspace
                .manifest(run)
                .ok_or_else(|| "render manifest not found".to_string())
        };

        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(reason) => {
                info!(run_slug = %run.run_slug, %reason, "render blocked");
                self.audit
                    .record(
                        &run.run_slug,
                        events::RUN_BLOCKED,
                        &reason,
                        json!({ "status": run.status, "run_dir": workspace.dir }),
                    )
                    .await;
                return Ok(DispatchOutcome::Blocked { reason });
            }
        };

        let extra = vec![
            "--manifest".to_string(),
            manifest.path.to_string_lossy().into_owned(),
        ];
        match self.step(run, workspace, StageKind::Render, extra).await? {
            StepResult::Failed(outcome) => Ok(outcome),
            StepResult::Ran | StepResult::Skipped => Ok(DispatchOutcome::Advanced {
                ran: vec![StageKind::Render],
                skipped: Vec::new(),
            }),
        }
    }

    async fn step(
        &self,
        run: &Run,
        workspace: &RunWorkspace,
        kind: StageKind,
        extra: Vec<String>,
    ) -> Result<StepResult> {
        let slug = run.run_slug.as_str();
        if workspace.stage_done(kind, run) {
            info!(run_slug = slug, stage = %kind, "stage output present, skipping");
            self.audit
                .record(
                    slug,
                    events::STAGE_SKIPPED,
                    &format!("{} already done", kind),
                    json!({ "stage": kind.as_str() }),
                )
                .await;
            return Ok(StepResult::Skipped);
        }

        let working_dir = workspace.exists().then_some(workspace.dir.as_path());
        let invocation = build_invocation(&self.stages, kind, slug, &extra, working_dir);
        self.audit
            .record(
                slug,
                events::STAGE_STARTED,
                &format!("{} started", kind),
                json!({ "stage": kind.as_str(), "program": invocation.program, "args": invocation.args }),
            )
            .await;

        let output = self.runner.run(&invocation, self.stage_timeout).await?;
        let outcome = self.classifier.classify(&output);
        let data = json!({
            "stage": kind.as_str(),
            "exit_code": output.exit_code,
            "timed_out": output.timed_out,
            "duration_ms": output.duration.as_millis() as u64,
        });

        match outcome {
            StageOutcome::Success => {
                info!(run_slug = slug, stage = %kind, "stage succeeded");
                self.audit
                    .record(slug, events::STAGE_SUCCEEDED, &format!("{} succeeded", kind), data)
                    .await;
                Ok(StepResult::Ran)
            }
            StageOutcome::TransientFailure(reason) => {
                warn!(run_slug = slug, stage = %kind, %reason, "stage failed (transient)");
                self.audit
                    .record(slug, events::STAGE_TRANSIENT_FAILURE, &reason, data)
                    .await;
                Ok(StepResult::Failed(DispatchOutcome::StageFailed {
                    stage: kind,
                    transient: true,
                    reason,
                }))
            }
            StageOutcome::FatalFailure(reason) => {
                warn!(run_slug = slug, stage = %kind, %reason, "stage failed (fatal)");
                self.audit
                    .record(slug, events::STAGE_FATAL_FAILURE, &reason, data)
                    .await;
                if let Err(e) = self.claims.increment_fail(slug).await {
                    warn!(run_slug = slug, error = %e, "failed to count stage failure");
                }
                Ok(StepResult::Failed(DispatchOutcome::StageFailed {
                    stage: kind,
                    transient: false,
                    reason,
                }))
            }
        }
    }
}

/// Arguments passed to the gate recording stage.
fn gate_args(run: &Run, gate: u8) -> Vec<String> {
    let (reviewer, notes) = match gate {
        1 => (&run.gate1_reviewer, &run.gate1_notes),
        _ => (&run.gate2_reviewer, &run.gate2_notes),
    };
    let mut args = vec!["--gate".to_string(), gate.to_string()];
    if let Some(reviewer) = reviewer.as_deref().filter(|r| !r.is_empty()) {
        args.push("--reviewer".to_string());
        args.push(reviewer.to_string());
    }
    if let Some(notes) = notes.as_deref().filter(|n| !n.is_empty()) {
        args.push("--notes".to_string());
        args.push(notes.to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{CommandOutput, StageInvocation};
    use crate::store::{MAX_FAIL_COUNT, MemoryRunStore, RunStore};
    use crate::worker_config::WorkerToml;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Stage runner that records invocations and replays scripted results.
    /// Unscripted stages succeed; `writes` lets a stage create local output.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<StageInvocation>>,
        results: HashMap<StageKind, (i32, &'static str)>,
        spawn_errors: Vec<StageKind>,
        writes: HashMap<StageKind, PathBuf>,
    }

    impl ScriptedRunner {
        fn failing(kind: StageKind, code: i32, stderr: &'static str) -> Self {
            let mut runner = Self::default();
            runner.results.insert(kind, (code, stderr));
            runner
        }

        fn kinds(&self) -> Vec<StageKind> {
            self.calls.lock().unwrap().iter().map(|c| c.kind).collect()
        }
    }

    #[async_trait]
    impl StageRunner for ScriptedRunner {
        async fn run(&self, invocation: &StageInvocation, _limit: Duration) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            if self.spawn_errors.contains(&invocation.kind) {
                anyhow::bail!("Failed to spawn {} stage command", invocation.kind);
            }
            if let Some(path) = self.writes.get(&invocation.kind) {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, b"out").unwrap();
            }
            let (code, stderr) = self
                .results
                .get(&invocation.kind)
                .copied()
                .unwrap_or((0, ""));
            Ok(CommandOutput {
                exit_code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
                timed_out: false,
                duration: Duration::from_millis(5),
            })
        }
    }

    struct Harness {
        root: TempDir,
        store: Arc<MemoryRunStore>,
        runner: Arc<ScriptedRunner>,
        dispatcher: RunDispatcher,
    }

    fn harness(run: Run, runner: ScriptedRunner) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let mut file = WorkerToml::default();
        file.paths.runs_root = root.path().to_path_buf();
        let config = Config::from_parts(
            file,
            |name| match name {
                "RUN_STORE_URL" => Some("http://localhost".into()),
                "RUN_STORE_SERVICE_KEY" => Some("k".into()),
                _ => None,
            },
            &Default::default(),
        )
        .unwrap();

        let store = Arc::new(MemoryRunStore::with_runs([run]));
        let dyn_store: Arc<dyn RunStore> = store.clone();
        let audit = AuditLog::new(dyn_store.clone(), "test-worker");
        let claims = Arc::new(ClaimManager::new(dyn_store, audit.clone(), MAX_FAIL_COUNT));
        let runner = Arc::new(runner);
        let dispatcher = RunDispatcher::new(&config, claims, runner.clone(), audit);
        Harness {
            root,
            store,
            runner,
            dispatcher,
        }
    }

    fn gate1_run() -> Run {
        let mut run = Run::new("r1", RunStatus::DraftReadyWaitingGate1);
        run.gate1_approved = true;
        run.gate1_reviewer = Some("dana".into());
        run
    }

    fn rendering_run() -> Run {
        let mut run = Run::new("r1", RunStatus::Rendering);
        run.gate2_approved = true;
        run
    }

    fn prepare_render_dir(root: &std::path::Path) -> PathBuf {
        let dir = root.join("r1");
        std::fs::create_dir_all(dir.join("render")).unwrap();
        std::fs::write(dir.join(workspace::RUN_STATE_FILE), "{}").unwrap();
        let manifest = dir.join(workspace::CANONICAL_MANIFEST);
        std::fs::write(&manifest, "{}").unwrap();
        manifest
    }

    #[tokio::test]
    async fn test_gate1_all_stages_succeed() {
        let h = harness(gate1_run(), ScriptedRunner::default());
        let outcome = h.dispatcher.process(&gate1_run()).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Advanced {
                ran: GATE1_SEQUENCE.to_vec(),
                skipped: vec![],
            }
        );
        assert_eq!(h.runner.kinds(), GATE1_SEQUENCE.to_vec());
        assert_eq!(h.store.run("r1").unwrap().fail_count, 0);
    }

    #[tokio::test]
    async fn test_gate_record_passes_reviewer_and_gate_number() {
        let h = harness(gate1_run(), ScriptedRunner::default());
        h.dispatcher.process(&gate1_run()).await.unwrap();

        let calls = h.runner.calls.lock().unwrap();
        let gate = &calls[0];
        assert_eq!(gate.kind, StageKind::ApproveGate);
        assert_eq!(
            gate.args,
            vec![
                "approve-gate",
                "--run-slug",
                "r1",
                "--gate",
                "1",
                "--reviewer",
                "dana"
            ]
        );
    }

    #[tokio::test]
    async fn test_fatal_voice_failure_stops_sequence_and_counts() {
        let runner = ScriptedRunner::failing(StageKind::GenerateVoice, 1, "quota exceeded");
        let h = harness(gate1_run(), runner);
        let outcome = h.dispatcher.process(&gate1_run()).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::StageFailed {
                stage: StageKind::GenerateVoice,
                transient: false,
                reason: "exit 1: quota exceeded".into(),
            }
        );
        assert!(!h.runner.kinds().contains(&StageKind::BuildManifest));
        assert_eq!(h.store.run("r1").unwrap().fail_count, 1);
        assert_eq!(h.store.events_of_type(events::STAGE_FATAL_FAILURE).len(), 1);
    }

    #[tokio::test]
    async fn test_rendering_without_gate2_is_blocked() {
        let mut run = rendering_run();
        run.gate2_approved = false;
        let h = harness(run.clone(), ScriptedRunner::default());
        prepare_render_dir(h.root.path());

        let outcome = h.dispatcher.process(&run).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Blocked { .. }));
        assert!(h.runner.kinds().is_empty());
        assert_eq!(h.store.events_of_type(events::RUN_BLOCKED).len(), 1);
        assert_eq!(h.store.run("r1").unwrap().fail_count, 0);
    }

    #[tokio::test]
    async fn test_rendering_without_state_file_is_blocked() {
        let h = harness(rendering_run(), ScriptedRunner::default());
        let outcome = h.dispatcher.process(&rendering_run()).await.unwrap();
        match outcome {
            DispatchOutcome::Blocked { reason } => assert!(reason.contains("run state file")),
            other => panic!("Expected Blocked, got {:?}", other),
        }
        assert!(h.runner.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_render_passes_manifest() {
        let h = harness(rendering_run(), ScriptedRunner::default());
        let manifest = prepare_render_dir(h.root.path());

        let outcome = h.dispatcher.process(&rendering_run()).await.unwrap();
        assert_eq!(outcome.label(), "advanced");
        let calls = h.runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args.last().unwrap(), &manifest.to_string_lossy());
        assert_eq!(calls[0].working_dir.as_deref(), Some(h.root.path().join("r1").as_path()));
    }

    #[tokio::test]
    async fn test_transient_render_failure_is_not_counted() {
        let runner =
            ScriptedRunner::failing(StageKind::Render, 1, "Error: no active project in editor");
        let h = harness(rendering_run(), runner);
        prepare_render_dir(h.root.path());

        let outcome = h.dispatcher.process(&rendering_run()).await.unwrap();
        assert_eq!(outcome.label(), "transient_failure");
        assert_eq!(h.store.run("r1").unwrap().fail_count, 0);
        assert_eq!(
            h.store.events_of_type(events::STAGE_TRANSIENT_FAILURE).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_fatal_render_failure_is_counted() {
        let runner = ScriptedRunner::failing(StageKind::Render, 2, "manifest schema invalid");
        let h = harness(rendering_run(), runner);
        prepare_render_dir(h.root.path());

        let outcome = h.dispatcher.process(&rendering_run()).await.unwrap();
        assert_eq!(outcome.label(), "fatal_failure");
        assert_eq!(h.store.run("r1").unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn test_redispatch_skips_completed_stages() {
        let h = harness(gate1_run(), ScriptedRunner::default());
        let run_dir = h.root.path().join("r1");
        std::fs::create_dir_all(run_dir.join(workspace::ASSETS_DIR)).unwrap();
        std::fs::write(run_dir.join(workspace::ASSETS_DIR).join("a.png"), b"x").unwrap();
        std::fs::create_dir_all(run_dir.join("render")).unwrap();
        std::fs::write(run_dir.join(workspace::CANONICAL_MANIFEST), "{}").unwrap();

        let outcome = h.dispatcher.process(&gate1_run()).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Advanced {
                ran: vec![StageKind::ApproveGate, StageKind::GenerateVoice],
                skipped: vec![StageKind::GenerateAssets, StageKind::BuildManifest],
            }
        );
        assert_eq!(
            h.runner.kinds(),
            vec![StageKind::ApproveGate, StageKind::GenerateVoice]
        );
    }

    #[tokio::test]
    async fn test_second_pass_skips_outputs_written_by_first() {
        let h = harness(gate1_run(), ScriptedRunner::default());
        let run_dir = h.root.path().join("r1");
        let mut runner = ScriptedRunner::default();
        runner
            .writes
            .insert(StageKind::GenerateAssets, run_dir.join("assets/01.png"));
        runner
            .writes
            .insert(StageKind::GenerateVoice, run_dir.join("voice/vo.wav"));
        runner.writes.insert(
            StageKind::BuildManifest,
            run_dir.join(workspace::CANONICAL_MANIFEST),
        );
        let runner = Arc::new(runner);
        let dispatcher = RunDispatcher {
            runner: runner.clone(),
            ..h.dispatcher
        };

        dispatcher.process(&gate1_run()).await.unwrap();
        assert_eq!(runner.kinds().len(), 4);

        let second = dispatcher.process(&gate1_run()).await.unwrap();
        assert_eq!(
            second,
            DispatchOutcome::Advanced {
                ran: vec![StageKind::ApproveGate],
                skipped: vec![
                    StageKind::GenerateAssets,
                    StageKind::GenerateVoice,
                    StageKind::BuildManifest
                ],
            }
        );
    }

    #[tokio::test]
    async fn test_spawn_error_propagates() {
        let runner = ScriptedRunner {
            spawn_errors: vec![StageKind::GenerateAssets],
            ..Default::default()
        };
        let h = harness(gate1_run(), runner);
        let err = h.dispatcher.process(&gate1_run()).await.unwrap_err();
        assert!(err.to_string().contains("generate_assets"));
    }

    #[tokio::test]
    async fn test_unapproved_gates_wait() {
        let mut run = gate1_run();
        run.gate1_approved = false;
        let h = harness(run.clone(), ScriptedRunner::default());
        assert_eq!(
            h.dispatcher.process(&run).await.unwrap(),
            DispatchOutcome::AwaitingGate
        );

        let run = Run::new("r1", RunStatus::AssetsReadyWaitingGate2);
        assert_eq!(
            h.dispatcher.process(&run).await.unwrap(),
            DispatchOutcome::AwaitingGate
        );
        assert!(h.runner.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_gate2_records_approval_only() {
        let mut run = Run::new("r1", RunStatus::AssetsReadyWaitingGate2);
        run.gate2_approved = true;
        run.gate2_notes = Some("cut intro".into());
        let h = harness(run.clone(), ScriptedRunner::default());

        let outcome = h.dispatcher.process(&run).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Advanced {
                ran: vec![StageKind::ApproveGate],
                skipped: vec![],
            }
        );
        let calls = h.runner.calls.lock().unwrap();
        assert!(calls[0].args.ends_with(&[
            "--gate".to_string(),
            "2".to_string(),
            "--notes".to_string(),
            "cut intro".to_string()
        ]));
    }

    #[tokio::test]
    async fn test_other_statuses_are_ignored() {
        let run = Run::new("r1", RunStatus::Other("published".into()));
        let h = harness(run.clone(), ScriptedRunner::default());
        assert_eq!(
            h.dispatcher.process(&run).await.unwrap(),
            DispatchOutcome::Ignored
        );
    }
}
