//! Stage identities, invocations, and outcome classification.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The external pipeline steps the worker knows how to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    ApproveGate,
    GenerateAssets,
    GenerateVoice,
    BuildManifest,
    Render,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::ApproveGate,
        StageKind::GenerateAssets,
        StageKind::GenerateVoice,
        StageKind::BuildManifest,
        StageKind::Render,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApproveGate => "approve_gate",
            Self::GenerateAssets => "generate_assets",
            Self::GenerateVoice => "generate_voice",
            Self::BuildManifest => "build_manifest",
            Self::Render => "render",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved command line for one stage of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInvocation {
    pub kind: StageKind,
    pub run_slug: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Raw result of a finished (or killed) stage process.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal or the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Last non-empty stderr line, falling back to stdout, for event messages.
    pub fn summary_line(&self) -> String {
        let pick = |text: &str| {
            text.lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        };
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_default()
    }
}

/// What a stage run means for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    /// An external dependency was unavailable; retry on the next poll.
    TransientFailure(String),
    /// Counted against the run's fail budget.
    FatalFailure(String),
}

/// Maps raw process output to a [`StageOutcome`] using known transient
/// fragments found in stderr. This is the only place output text is inspected.
#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    patterns: Vec<String>,
}

impl OutcomeClassifier {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, output: &CommandOutput) -> StageOutcome {
        if output.success() {
            return StageOutcome::Success;
        }

        if output.timed_out {
            return StageOutcome::FatalFailure(format!(
                "timed out after {}s",
                output.duration.as_secs()
            ));
        }

        let haystack = output.stderr.to_lowercase();
        let exit = output
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = output.summary_line();
        let reason = if detail.is_empty() {
            format!("exit {}", exit)
        } else {
            format!("exit {}: {}", exit, detail)
        };

        if let Some(pattern) = self.patterns.iter().find(|p| haystack.contains(p.as_str())) {
            StageOutcome::TransientFailure(format!("{} (matched '{}')", reason, pattern))
        } else {
            StageOutcome::FatalFailure(reason)
        }
    }
}
