//! hostguard: command-line interface for the hg-core engine
//!
//! Provides the `hostguard` binary: apply, plan and status for the
//! configured domains, plus backup inspection, restore and config editing.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};

use hg_core::config::overrides::{self, Override};
use hg_core::config::HardeningConfig;
use hg_core::error::{ErrorKind, HgError};
use hg_core::host::Host;
use hg_core::pipeline::PipelineState;

/// Process exit statuses
pub mod exit_code {
    pub const COMPLETED: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const ABORTED: u8 = 2;
    /// Bad configuration, missing privilege or tools, or a held lock
    pub const PRECONDITION: u8 = 3;
}

/// Exit status for a finished run
pub fn exit_code_for(state: &PipelineState) -> u8 {
    match state {
        PipelineState::Completed { .. } => exit_code::COMPLETED,
        PipelineState::Aborted { .. } => exit_code::ABORTED,
        PipelineState::Failed { .. } | PipelineState::NotStarted | PipelineState::Running => {
            exit_code::FAILED
        }
    }
}

/// Exit status for an error that ended the command early.
///
/// Failures that stop a run before any step starts carry an `HgError`
/// of kind `Precondition`.
pub fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<HgError>().map(HgError::kind) {
        Some(ErrorKind::Precondition) => exit_code::PRECONDITION,
        _ => exit_code::FAILED,
    }
}

/// Directories searched for system tools in addition to `PATH`
const SBIN_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// The real host, with the search path captured now
pub fn system_host() -> Host {
    let mut search_path: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default();
    for dir in SBIN_DIRS {
        let dir = PathBuf::from(dir);
        if !search_path.contains(&dir) {
            search_path.push(dir);
        }
    }
    Host::system(search_path)
}

/// Build the run's configuration: file, then environment, then `--set`
pub fn load_config(path: Option<&Path>, sets: &[Override]) -> Result<HardeningConfig, HgError> {
    let mut all = overrides::from_env_pairs(std::env::vars());
    all.extend(sets.iter().cloned());
    Ok(HardeningConfig::load(path, &all)?)
}
