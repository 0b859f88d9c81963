//! External pipeline stages.
//!
//! | Module     | Contents                                             |
//! |------------|------------------------------------------------------|
//! | `types`    | `StageKind`, `CommandOutput`, `StageOutcome`, classifier |
//! | `executor` | `StageRunner` trait and the subprocess `ProcessRunner` |

pub mod executor;
pub mod types;

use std::path::Path;

pub use executor::{ProcessRunner, StageRunner};
pub use types::{CommandOutput, OutcomeClassifier, StageInvocation, StageKind, StageOutcome};

use crate::worker_config::StagesSection;

/// Build the command line for `kind` on `run_slug`:
/// `<program> <args...> <run_flag> <run_slug> <extra...>`.
pub fn build_invocation(
    stages: &StagesSection,
    kind: StageKind,
    run_slug: &str,
    extra: &[String],
    working_dir: Option<&Path>,
) -> StageInvocation {
    let command = stages.command_for(kind);
    let mut args = command.args.clone();
    args.push(stages.run_flag.clone());
    args.push(run_slug.to_string());
    args.extend(extra.iter().cloned());
    StageInvocation {
        kind,
        run_slug: run_slug.to_string(),
        program: command.program.clone(),
        args,
        working_dir: working_dir.map(Path::to_path_buf),
    }
}
