//! Local run directory lookup.
//!
//! Run directories are written by the stages; the worker only reads them to
//! decide what is already done and where the render inputs live.

use std::path::{Path, PathBuf};

use crate::stage::StageKind;
use crate::store::Run;
use crate::store::models::RENDER_MANIFEST_ARTIFACT;

pub const RUN_STATE_FILE: &str = "run_state.json";
pub const CANONICAL_MANIFEST: &str = "render/render_manifest.json";
pub const ASSETS_DIR: &str = "assets";
pub const VOICE_DIR: &str = "voice";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    Canonical,
    LegacyArtifact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedManifest {
    pub path: PathBuf,
    pub source: ManifestSource,
}

/// Where a run's local files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkspace {
    pub dir: PathBuf,
    /// True when `dir` came from an artifact path rather than the convention.
    pub from_artifact: bool,
}

impl RunWorkspace {
    /// First artifact path that exists on disk wins (the path itself if it is a
    /// directory, else its parent). Otherwise `<runs_root>/<run_slug>`.
    ///
    /// Artifacts are checked in alphabetical key order, not the order the
    /// store returned them in.
    pub fn resolve(run: &Run, runs_root: &Path) -> Self {
        for (_, raw) in run.artifact_paths() {
            let path = Path::new(raw);
            if !path.exists() {
                continue;
            }
            let dir = if path.is_dir() {
                Some(path.to_path_buf())
            } else {
                path.parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
            };
            if let Some(dir) = dir {
                return Self {
                    dir,
                    from_artifact: true,
                };
            }
        }
        Self {
            dir: runs_root.join(&run.run_slug),
            from_artifact: false,
        }
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.join(RUN_STATE_FILE)
    }

    pub fn has_state_file(&self) -> bool {
        self.state_file().is_file()
    }

    /// Canonical project manifest first, then the legacy artifact pointer.
    pub fn manifest(&self, run: &Run) -> Option<ResolvedManifest> {
        let canonical = self.dir.join(CANONICAL_MANIFEST);
        if canonical.is_file() {
            return Some(ResolvedManifest {
                path: canonical,
                source: ManifestSource::Canonical,
            });
        }
        run.artifact_path(RENDER_MANIFEST_ARTIFACT)
            .map(PathBuf::from)
            .filter(|p| p.is_file())
            .map(|path| ResolvedManifest {
                path,
                source: ManifestSource::LegacyArtifact,
            })
    }

    /// Whether the local output of `kind` is already present, so re-running
    /// the stage would only repeat work.
    pub fn stage_done(&self, kind: StageKind, run: &Run) -> bool {
        match kind {
            StageKind::GenerateAssets => non_empty_dir(&self.dir.join(ASSETS_DIR)),
            StageKind::GenerateVoice => non_empty_dir(&self.dir.join(VOICE_DIR)),
            StageKind::BuildManifest => self.manifest(run).is_some(),
            StageKind::ApproveGate | StageKind::Render => false,
        }
    }
}

fn non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
