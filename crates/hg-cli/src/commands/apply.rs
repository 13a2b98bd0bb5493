//! Apply command implementation

use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::output::{format_run, print_error, print_info, print_success, print_warning};
use crate::{exit_code_for, system_host};
use hg_core::config::HardeningConfig;
use hg_core::error::HgError;
use hg_core::gate::CheckpointGate;
use hg_core::lock::{lock_path, RunLock};
use hg_core::pipeline::{Pipeline, PipelineState, Step};
use hg_core::preflight::preflight;
use hg_core::reconcile::Context;

/// Run the standard pipeline and report; returns the exit status
pub async fn apply_command(
    config: HardeningConfig,
    json: bool,
    non_interactive_override: bool,
) -> Result<u8> {
    let host = system_host();
    preflight(&config, &host).map_err(HgError::from)?;

    let state_dir = host.path(&config.pipeline.state_dir);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;
    let _lock = RunLock::acquire(lock_path(&state_dir), std::process::id()).map_err(HgError::from)?;

    let pipeline = Pipeline::standard(&config);
    if !json {
        let steps: Vec<String> = pipeline.steps().iter().map(Step::label).collect();
        print_info(&format!("Pipeline: {}", steps.join(" -> ")));
    }

    let override_declared = non_interactive_override || config.pipeline.non_interactive_confirm;
    let mut gate = CheckpointGate::stdin(override_declared);
    let ctx = Context::new(host, Arc::new(config));

    let run = pipeline.run(&ctx, &mut gate).await;

    match run.save(&state_dir) {
        Ok(path) => tracing::info!("Run report written to {:?}", path),
        Err(e) => print_warning(&format!("Failed to write run report: {}", e)),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print!("{}", format_run(&run));
        match run.state() {
            PipelineState::Completed { changes } => {
                print_success(&format!("Completed with {} change(s)", changes));
            }
            PipelineState::Aborted { reason, .. } => {
                print_warning(&format!("Aborted: {}", reason));
                print_info("Steps already applied are kept; re-run apply to continue.");
            }
            PipelineState::Failed { message, .. } => print_error(message),
            PipelineState::NotStarted | PipelineState::Running => {}
        }
    }

    Ok(exit_code_for(run.state()))
}
