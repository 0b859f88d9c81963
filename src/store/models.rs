use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Number of fatal failures after which a run is parked in `failed`.
pub const MAX_FAIL_COUNT: u32 = 3;

/// Artifact key holding the legacy pointer to a render manifest.
pub const RENDER_MANIFEST_ARTIFACT: &str = "render_manifest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    DraftReadyWaitingGate1,
    AssetsReadyWaitingGate2,
    Rendering,
    Failed,
    /// Any status written by upstream stages that the worker does not act on.
    Other(String),
}

impl RunStatus {
    /// Statuses the worker polls for.
    pub const ACTIONABLE: [RunStatus; 3] = [
        RunStatus::DraftReadyWaitingGate1,
        RunStatus::AssetsReadyWaitingGate2,
        RunStatus::Rendering,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::DraftReadyWaitingGate1 => "draft_ready_waiting_gate_1",
            Self::AssetsReadyWaitingGate2 => "assets_ready_waiting_gate_2",
            Self::Rendering => "rendering",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }

    pub fn is_actionable(&self) -> bool {
        Self::ACTIONABLE.contains(self)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "draft_ready_waiting_gate_1" => Self::DraftReadyWaitingGate1,
            "assets_ready_waiting_gate_2" => Self::AssetsReadyWaitingGate2,
            "rendering" => Self::Rendering,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Treat an explicit JSON `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// One row of the remote run table.
///
/// Fields the worker does not know about are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_slug: String,
    pub status: RunStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub gate1_approved: bool,
    #[serde(default)]
    pub gate1_reviewer: Option<String>,
    #[serde(default)]
    pub gate1_notes: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub gate2_approved: bool,
    #[serde(default)]
    pub gate2_reviewer: Option<String>,
    #[serde(default)]
    pub gate2_notes: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub artifacts: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fail_count: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(run_slug: impl Into<String>, status: RunStatus) -> Self {
        Self {
            run_slug: run_slug.into(),
            status,
            gate1_approved: false,
            gate1_reviewer: None,
            gate1_notes: None,
            gate2_approved: false,
            gate2_reviewer: None,
            gate2_notes: None,
            artifacts: BTreeMap::new(),
            claimed_by: None,
            claimed_at: None,
            fail_count: 0,
            updated_at: Some(Utc::now()),
        }
    }

    /// Artifact entries whose value is a path string, in key order.
    pub fn artifact_paths(&self) -> impl Iterator<Item = (&str, &str)> {
        self.artifacts
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|p| (k.as_str(), p)))
    }

    pub fn artifact_path(&self, key: &str) -> Option<&str> {
        self.artifacts.get(key).and_then(|v| v.as_str())
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }
}

/// One row of the append-only event table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_hash: String,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}
