//! Backup listing and restore command implementations

use anyhow::{bail, Context as _, Result};

use crate::output::{format_backups, print_error, print_info, print_success, print_warning};
use crate::{exit_code, system_host};
use hg_core::backup::BackupStore;
use hg_core::config::HardeningConfig;
use hg_core::domains::reconciler;
use hg_core::error::{BackupError, HgError};
use hg_core::gate::CheckpointGate;
use hg_core::lock::{lock_path, RunLock};
use hg_core::types::ConfigurationDomain;

/// List recorded originals and verify each checksum
pub fn backups_command(config: &HardeningConfig, json: bool) -> Result<()> {
    let host = system_host();
    let store = BackupStore::for_host(&host, &config.pipeline.state_dir);
    let entries = store
        .list()
        .with_context(|| format!("Failed to read backups in {:?}", store.dir()))?;

    let checked: Vec<_> = entries
        .into_iter()
        .map(|entry| {
            let check = store.verify(&entry).map_err(|e| e.to_string());
            (entry, check)
        })
        .collect();

    if json {
        let report: Vec<_> = checked
            .iter()
            .map(|(entry, check)| {
                serde_json::json!({
                    "entry": entry,
                    "backup": store.data_path(&entry.artifact),
                    "verified": check.is_ok(),
                    "error": check.as_ref().err(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", format_backups(&checked));
    if checked.iter().any(|(_, check)| check.is_err()) {
        print_warning("Some backups failed verification; do not restore them blindly");
    }
    Ok(())
}

/// Put the original artifact of `domain` back after operator confirmation
pub async fn restore_command(config: &HardeningConfig, domain: ConfigurationDomain) -> Result<u8> {
    let host = system_host();
    let euid = host.effective_uid();
    if euid != 0 {
        print_error(&format!("restore must run as root (effective uid is {})", euid));
        return Ok(exit_code::PRECONDITION);
    }

    let state_dir = host.path(&config.pipeline.state_dir);
    let _lock = RunLock::acquire(lock_path(&state_dir), std::process::id()).map_err(HgError::from)?;

    let artifact = reconciler(domain).artifact(config);
    let store = BackupStore::for_host(&host, &config.pipeline.state_dir);
    let entry = match store.get(&artifact)? {
        Some(entry) => entry,
        None => bail!(BackupError::NotFound(artifact)),
    };
    store.verify(&entry)?;

    let action = if entry.existed {
        format!("Overwrite {} with the original saved before hardening", artifact.display())
    } else {
        format!("Delete {}, which did not exist before hardening", artifact.display())
    };
    let mut gate = CheckpointGate::stdin(false);
    let confirmation = gate.confirm(&action).await;
    if !confirmation.granted() {
        print_warning(&format!("Restore aborted: {}", confirmation.reason()));
        return Ok(exit_code::ABORTED);
    }

    store.restore(&host, &entry)?;
    print_success(&format!("Restored {}", artifact.display()));
    if domain.affects_reachability() {
        print_warning("The service has not been reloaded. Reload it yourself and test access from a new session.");
    } else {
        print_info("The service has not been reloaded.");
    }
    Ok(exit_code::COMPLETED)
}
