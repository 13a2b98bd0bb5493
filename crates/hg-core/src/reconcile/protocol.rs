//! The shared convergence protocol

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{ApplyResult, Context, Diff, Domain};
use crate::error::StepError;
use crate::host::set_permission_bits;

/// Suffix of the staged render, written beside the live artifact so the
/// swap is a same-directory rename. Services ignore it: it matches none of
/// the `*.conf`, `*.local`, `*.xml` patterns they load and contains a dot,
/// which sudoers include directories skip.
const STAGED_SUFFIX: &str = ".hostguard-staged";

/// Staged location for `artifact`
pub fn staged_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(STAGED_SUFFIX);
    PathBuf::from(name)
}

/// Drive one domain from its actual to its desired state, once.
///
/// 1. probe and diff; an empty diff returns without writing anything
/// 2. record the original artifact unless already recorded
/// 3. render from desired state
/// 4. stage, validate, swap; a failed validation discards the stage
/// 5. activate
/// 6. re-read live state and verify, giving the service `ctx.settle` to catch up
///
/// Every failure is returned in the result, never retried.
pub async fn converge<D: Domain + ?Sized>(domain: &D, ctx: &Context) -> ApplyResult {
    let id = domain.domain();
    let desired = domain.resolve(&ctx.config);

    let actual = match domain.probe(ctx).await {
        Ok(actual) => actual,
        Err(error) => {
            tracing::error!("{}", error);
            return ApplyResult {
                validated: false,
                error: Some(error),
                ..ApplyResult::unchanged(id)
            };
        }
    };

    let diff = domain.diff(&actual, &desired);
    if diff.is_empty() {
        tracing::info!("{}: already converged", id);
        return ApplyResult::unchanged(id);
    }
    tracing::info!("{}: {}", id, diff);

    let io_failure = |detail: String| ApplyResult {
        domain: id,
        changed: false,
        validated: false,
        diff: diff.clone(),
        backup: None,
        error: Some(StepError::Io { domain: id, detail }),
    };

    let artifact = domain.artifact(&ctx.config);
    let backup = match ctx.backups.ensure(&ctx.host, &artifact) {
        Ok(outcome) => outcome
            .entry()
            .existed
            .then(|| ctx.backups.data_path(&artifact)),
        Err(e) => return io_failure(format!("backup of {} failed: {}", artifact.display(), e)),
    };

    let rendered = domain.render(&desired);
    let current = match ctx.host.read_optional(&artifact) {
        Ok(current) => current,
        Err(e) => return io_failure(format!("cannot read {}: {}", artifact.display(), e)),
    };

    if current.as_deref() == Some(rendered.as_bytes()) {
        // content already right; the live service has not picked it up
        tracing::debug!("{}: {} already matches the render", id, artifact.display());
        if let Err(e) = ctx.host.set_mode(&artifact, domain.mode()) {
            return io_failure(format!("cannot set mode on {}: {}", artifact.display(), e));
        }
    } else {
        let staged = staged_path(&artifact);
        let staged_local = ctx.host.path(&staged);
        if let Err(e) = write_staged(&staged_local, rendered.as_bytes(), domain.mode()) {
            let _ = fs::remove_file(&staged_local);
            return io_failure(format!("cannot stage {}: {}", staged.display(), e));
        }

        if let Err(detail) = domain.validate(ctx, &staged, &rendered, &desired).await {
            discard(&staged_local);
            tracing::error!("{}: validation failed: {}", id, detail);
            return ApplyResult {
                domain: id,
                changed: false,
                validated: false,
                diff,
                backup,
                error: Some(StepError::Validation { domain: id, detail }),
            };
        }

        if let Err(e) = fs::rename(&staged_local, ctx.host.path(&artifact)) {
            discard(&staged_local);
            return io_failure(format!("cannot swap in {}: {}", artifact.display(), e));
        }
        tracing::info!("{}: wrote {}", id, artifact.display());
    }

    if let Err(detail) = domain.activate(ctx, &desired, &actual).await {
        tracing::error!("{}: activation failed: {}", id, detail);
        return ApplyResult {
            domain: id,
            changed: true,
            validated: true,
            diff,
            backup: backup.clone(),
            error: Some(StepError::Activation {
                domain: id,
                detail,
                backup,
            }),
        };
    }

    let remaining = match settle(domain, ctx, &desired).await {
        Ok(remaining) => remaining,
        Err(e) => {
            return ApplyResult {
                domain: id,
                changed: true,
                validated: true,
                diff,
                backup: backup.clone(),
                error: Some(StepError::Verification {
                    domain: id,
                    detail: format!("cannot re-read live state: {}", e),
                    backup,
                }),
            };
        }
    };

    if !remaining.is_empty() {
        tracing::error!("{}: verification mismatch: {}", id, remaining);
        return ApplyResult {
            domain: id,
            changed: true,
            validated: true,
            diff,
            backup: backup.clone(),
            error: Some(StepError::Verification {
                domain: id,
                detail: remaining.to_string(),
                backup,
            }),
        };
    }

    tracing::info!("{}: converged and verified", id);
    ApplyResult {
        domain: id,
        changed: true,
        validated: true,
        diff,
        backup,
        error: None,
    }
}

fn write_staged(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    set_permission_bits(path, mode)
}

fn discard(staged: &Path) {
    if let Err(e) = fs::remove_file(staged) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove staged file {:?}: {}", staged, e);
        }
    }
}

/// Re-read live state until verification passes or the settle window runs out.
///
/// Returns the fields still wrong after the last read. A read error only
/// counts when it happens on the last attempt.
async fn settle<D: Domain + ?Sized>(
    domain: &D,
    ctx: &Context,
    desired: &D::Desired,
) -> Result<Diff, StepError> {
    let attempts = ctx.settle.attempts.max(1);
    let mut attempt = 1;
    loop {
        let last = attempt >= attempts;
        match domain.probe(ctx).await {
            Ok(after) => {
                let remaining = domain.verify(&after, desired);
                if remaining.is_empty() || last {
                    return Ok(remaining);
                }
                tracing::debug!(
                    "{}: not settled after read {}/{}: {}",
                    domain.domain(),
                    attempt,
                    attempts,
                    remaining
                );
            }
            Err(e) if last => return Err(e),
            Err(e) => tracing::debug!("{}: read {}/{} failed: {}", domain.domain(), attempt, attempts, e),
        }
        tokio::time::sleep(ctx.settle.interval).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardeningConfig;
    use crate::host::{Host, ScriptedRunner};
    use crate::reconcile::{Diff, Settle};
    use crate::types::ConfigurationDomain;
    use async_trait::async_trait;
    use serde::Serialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// A domain whose live state is a single value held in memory and
    /// copied from the artifact on activation
    struct Toy {
        live: Mutex<Option<String>>,
        reject: bool,
        activate_fails: bool,
        ignore_activation: bool,
        activations: AtomicUsize,
        /// Probes after activation that still see the old value
        lag: AtomicUsize,
        pending: Mutex<Option<String>>,
        reads: AtomicUsize,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct ToyState(Option<String>);

    impl Toy {
        fn new(live: Option<&str>) -> Self {
            Self {
                live: Mutex::new(live.map(str::to_string)),
                reject: false,
                activate_fails: false,
                ignore_activation: false,
                activations: AtomicUsize::new(0),
                lag: AtomicUsize::new(0),
                pending: Mutex::new(None),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Domain for Toy {
        type Desired = String;
        type Actual = ToyState;

        fn domain(&self) -> ConfigurationDomain {
            ConfigurationDomain::IntrusionJail
        }

        fn artifact(&self, _config: &HardeningConfig) -> PathBuf {
            PathBuf::from("/etc/toy.conf")
        }

        fn resolve(&self, config: &HardeningConfig) -> String {
            format!("maxretry={}", config.jail.max_retry)
        }

        async fn probe(&self, _ctx: &Context) -> Result<ToyState, StepError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                if self.lag.load(Ordering::SeqCst) == 0 {
                    *self.live.lock().unwrap() = pending.take();
                } else {
                    self.lag.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Ok(ToyState(self.live.lock().unwrap().clone()))
        }

        fn diff(&self, actual: &ToyState, desired: &String) -> Diff {
            Diff::new().field("value", actual.0.as_ref(), desired)
        }

        fn render(&self, desired: &String) -> String {
            format!("{}\n", desired)
        }

        async fn validate(
            &self,
            _ctx: &Context,
            _staged: &Path,
            _rendered: &str,
            _desired: &String,
        ) -> Result<(), String> {
            if self.reject {
                Err("syntax error on line 1".into())
            } else {
                Ok(())
            }
        }

        async fn activate(
            &self,
            ctx: &Context,
            _desired: &String,
            _actual: &ToyState,
        ) -> Result<(), String> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            if self.activate_fails {
                return Err("service refused to reload".into());
            }
            if !self.ignore_activation {
                let content = ctx
                    .host
                    .read_string_optional(Path::new("/etc/toy.conf"))
                    .map_err(|e| e.to_string())?
                    .unwrap_or_default();
                *self.pending.lock().unwrap() = Some(content.trim().to_string());
            }
            Ok(())
        }
    }

    fn context(dir: &TempDir) -> Context {
        let host = Host::with_root(dir.path(), Arc::new(ScriptedRunner::succeeding()));
        Context::new(host, Arc::new(HardeningConfig::default()))
    }

    #[tokio::test]
    async fn test_first_apply_changes_then_second_is_noop() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let toy = Toy::new(Some("maxretry=9"));

        let first = converge(&toy, &ctx).await;
        assert!(first.changed && first.validated && first.is_success());
        assert_eq!(first.diff.fields(), vec!["value"]);

        let second = converge(&toy, &ctx).await;
        assert_eq!(second, ApplyResult::unchanged(ConfigurationDomain::IntrusionJail));
        assert_eq!(toy.activations.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.backups.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_artifact_untouched() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/toy.conf"), "original\n").unwrap();
        let ctx = context(&dir);
        let mut toy = Toy::new(Some("original"));
        toy.reject = true;

        let result = converge(&toy, &ctx).await;
        assert!(!result.changed);
        assert!(!result.validated);
        assert!(matches!(result.error, Some(StepError::Validation { .. })));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("etc/toy.conf")).unwrap(),
            "original\n"
        );
        assert!(!dir.path().join("etc/toy.conf.hostguard-staged").exists());
        assert_eq!(toy.activations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_activation_failure_reports_backup() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/toy.conf"), "original\n").unwrap();
        let ctx = context(&dir);
        let mut toy = Toy::new(Some("original"));
        toy.activate_fails = true;

        let result = converge(&toy, &ctx).await;
        assert!(result.changed && result.validated);
        match result.error {
            Some(StepError::Activation { backup: Some(path), .. }) => {
                assert_eq!(std::fs::read_to_string(path).unwrap(), "original\n");
            }
            other => panic!("expected activation error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reload_settles_before_verification() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let toy = Toy::new(Some("maxretry=9"));
        toy.lag.store(3, Ordering::SeqCst);

        let result = converge(&toy, &ctx).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(toy.activations.load(Ordering::SeqCst), 1);
        // one read before the change, four while settling
        assert_eq!(toy.reads.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_window_is_bounded() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).with_settle(Settle {
            attempts: 3,
            interval: std::time::Duration::from_millis(200),
        });
        let toy = Toy::new(Some("maxretry=9"));
        toy.lag.store(10, Ordering::SeqCst);

        let result = converge(&toy, &ctx).await;
        assert!(matches!(result.error, Some(StepError::Verification { .. })));
        assert_eq!(toy.reads.load(Ordering::SeqCst), 4);
        assert_eq!(toy.activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_activation_is_verification_mismatch() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut toy = Toy::new(None);
        toy.ignore_activation = true;

        let result = converge(&toy, &ctx).await;
        assert!(matches!(result.error, Some(StepError::Verification { .. })));
        // original artifact did not exist, so there is nothing to point at
        assert!(result.backup.is_none());
    }

    #[tokio::test]
    async fn test_matching_artifact_is_activated_without_rewrite() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/toy.conf"), "maxretry=5\n").unwrap();
        let ctx = context(&dir);
        let toy = Toy::new(Some("stale"));

        let result = converge(&toy, &ctx).await;
        assert!(result.is_success());
        assert_eq!(toy.activations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_staged_path_is_sibling() {
        assert_eq!(
            staged_path(Path::new("/etc/sudoers.d/hostguard-sudo")),
            PathBuf::from("/etc/sudoers.d/hostguard-sudo.hostguard-staged")
        );
    }
}
