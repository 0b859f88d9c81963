//! File-based configuration for the worker, read from `runclaim.toml`.
//!
//! Every section is optional; missing values fall back to defaults. The store
//! URL and service key are never read from here, only from the environment.
//!
//! # Configuration File Format
//!
//! ```toml
//! [worker]
//! worker_id = "render-box-1"
//! limit = 20
//! stale_minutes = 30
//! max_fail_count = 3
//! stage_timeout_secs = 900
//! poll_interval_secs = 60
//!
//! [store]
//! rest_path = "rest/v1"
//! runs_table = "runs"
//! events_table = "run_events"
//! request_timeout_secs = 20
//!
//! [paths]
//! runs_root = "data/runs"
//!
//! [stages]
//! run_flag = "--run-slug"
//! generate_voice = { program = "python3", args = ["tools/voice.py"] }
//! render = { program = "autocut", args = ["render"] }
//!
//! [classifier]
//! transient_patterns = ["keep render tool open", "no active project"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::stage::StageKind;

pub const DEFAULT_CONFIG_FILE: &str = "runclaim.toml";
pub const DEFAULT_WORKER_ID: &str = "runclaim-worker";
/// One week. Claims older than this are always stale.
pub const MAX_STALE_MINUTES: i64 = 7 * 24 * 60;

/// `[worker]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_stale_minutes")]
    pub stale_minutes: i64,
    #[serde(default = "default_max_fail_count")]
    pub max_fail_count: u32,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_worker_id() -> String {
    DEFAULT_WORKER_ID.to_string()
}

fn default_limit() -> usize {
    20
}

fn default_stale_minutes() -> i64 {
    30
}

fn default_max_fail_count() -> u32 {
    crate::store::MAX_FAIL_COUNT
}

fn default_stage_timeout_secs() -> u64 {
    900
}

fn default_poll_interval_secs() -> u64 {
    60
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            limit: default_limit(),
            stale_minutes: default_stale_minutes(),
            max_fail_count: default_max_fail_count(),
            stage_timeout_secs: default_stage_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// `[store]` section: table layout and request behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_rest_path")]
    pub rest_path: String,
    #[serde(default = "default_runs_table")]
    pub runs_table: String,
    #[serde(default = "default_events_table")]
    pub events_table: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_rest_path() -> String {
    "rest/v1".to_string()
}

fn default_runs_table() -> String {
    "runs".to_string()
}

fn default_events_table() -> String {
    "run_events".to_string()
}

fn default_request_timeout_secs() -> u64 {
    20
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            rest_path: default_rest_path(),
            runs_table: default_runs_table(),
            events_table: default_events_table(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// `[paths]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsSection {
    /// Parent of conventional run directories (`<runs_root>/<run_slug>`).
    #[serde(default = "default_runs_root")]
    pub runs_root: PathBuf,
}

fn default_runs_root() -> PathBuf {
    PathBuf::from("data/runs")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            runs_root: default_runs_root(),
        }
    }
}

/// An executable plus leading arguments. The run flag and run slug are
/// appended by the stage runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// `[stages]` section: the external commands for every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagesSection {
    #[serde(default = "default_run_flag")]
    pub run_flag: String,
    #[serde(default = "default_approve_gate")]
    pub approve_gate: StageCommand,
    #[serde(default = "default_generate_assets")]
    pub generate_assets: StageCommand,
    #[serde(default = "default_generate_voice")]
    pub generate_voice: StageCommand,
    #[serde(default = "default_build_manifest")]
    pub build_manifest: StageCommand,
    #[serde(default = "default_render")]
    pub render: StageCommand,
}

fn default_run_flag() -> String {
    "--run-slug".to_string()
}

fn default_approve_gate() -> StageCommand {
    StageCommand::new("pipeline", &["approve-gate"])
}

fn default_generate_assets() -> StageCommand {
    StageCommand::new("pipeline", &["generate-assets"])
}

fn default_generate_voice() -> StageCommand {
    StageCommand::new("pipeline", &["generate-voice"])
}

fn default_build_manifest() -> StageCommand {
    StageCommand::new("pipeline", &["build-manifest"])
}

fn default_render() -> StageCommand {
    StageCommand::new("autocut", &["render"])
}

impl Default for StagesSection {
    fn default() -> Self {
        Self {
            run_flag: default_run_flag(),
            approve_gate: default_approve_gate(),
            generate_assets: default_generate_assets(),
            generate_voice: default_generate_voice(),
            build_manifest: default_build_manifest(),
            render: default_render(),
        }
    }
}

impl StagesSection {
    pub fn command_for(&self, kind: StageKind) -> &StageCommand {
        match kind {
            StageKind::ApproveGate => &self.approve_gate,
            StageKind::GenerateAssets => &self.generate_assets,
            StageKind::GenerateVoice => &self.generate_voice,
            StageKind::BuildManifest => &self.build_manifest,
            StageKind::Render => &self.render,
        }
    }
}

/// `[classifier]` section: stderr fragments that mark a stage failure
/// as transient. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSection {
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,
}

pub fn default_transient_patterns() -> Vec<String> {
    [
        "keep render tool open",
        "could not connect to render api",
        "no active project",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            transient_patterns: default_transient_patterns(),
        }
    }
}

/// Root of `runclaim.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerToml {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub stages: StagesSection,
    #[serde(default)]
    pub classifier: ClassifierSection,
}

impl WorkerToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::FileParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load `runclaim.toml` from `dir`, or defaults when it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(DEFAULT_CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check values that would make the worker misbehave rather than fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.to_string(),
        };
        if self.worker.worker_id.trim().is_empty() {
            return Err(invalid("worker.worker_id", "must not be empty"));
        }
        if self.worker.limit == 0 {
            return Err(invalid("worker.limit", "must be at least 1"));
        }
        if self.worker.stale_minutes <= 0 || self.worker.stale_minutes > MAX_STALE_MINUTES {
            return Err(invalid(
                "worker.stale_minutes",
                &format!("must be between 1 and {}", MAX_STALE_MINUTES),
            ));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(invalid("worker.poll_interval_secs", "must be positive"));
        }
        if self.worker.max_fail_count == 0 {
            return Err(invalid("worker.max_fail_count", "must be at least 1"));
        }
        if self.worker.stage_timeout_secs == 0 {
            return Err(invalid("worker.stage_timeout_secs", "must be positive"));
        }
        for kind in StageKind::ALL {
            if self.stages.command_for(kind).program.trim().is_empty() {
                return Err(invalid(
                    &format!("stages.{}", kind.as_str()),
                    "program must not be empty",
                ));
            }
        }
        Ok(())
    }
}
