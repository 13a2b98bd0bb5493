//! Desired-state reconciliation
//!
//! A [`Domain`] supplies the parts that vary per configuration surface:
//! how to resolve desired state, probe actual state, diff them, render the
//! artifact, validate a staged render and activate it. The surrounding
//! protocol (diff, backup once, render, validate, swap, activate, verify)
//! lives once in [`converge`] and is shared by every domain.

mod diff;
mod protocol;

pub use diff::{Diff, FieldChange};
pub use protocol::{converge, staged_path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backup::BackupStore;
use crate::config::HardeningConfig;
use crate::error::StepError;
use crate::host::Host;
use crate::service::{ServiceManager, Systemd};
use crate::types::ConfigurationDomain;

/// How long verification keeps re-reading a service that was just
/// reloaded before calling a difference a mismatch.
///
/// Reloads are often asynchronous (`kill -HUP` and a re-exec), so the first
/// read can still see the old listener. Only the read repeats; the change
/// itself is never applied twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settle {
    /// Reads in total, at least one
    pub attempts: u32,
    /// Pause between reads
    pub interval: Duration,
}

impl Settle {
    /// A single read with no wait
    pub fn immediate() -> Self {
        Self {
            attempts: 1,
            interval: Duration::ZERO,
        }
    }
}

impl Default for Settle {
    fn default() -> Self {
        Self {
            attempts: 6,
            interval: Duration::from_millis(500),
        }
    }
}

/// Everything a step may touch during one run
#[derive(Clone)]
pub struct Context {
    pub host: Host,
    pub services: Arc<dyn ServiceManager>,
    pub backups: BackupStore,
    pub config: Arc<HardeningConfig>,
    pub settle: Settle,
}

impl Context {
    /// Context using systemd and the configured state directory
    pub fn new(host: Host, config: Arc<HardeningConfig>) -> Self {
        let backups = BackupStore::for_host(&host, &config.pipeline.state_dir);
        Self {
            host,
            services: Arc::new(Systemd),
            backups,
            config,
            settle: Settle::default(),
        }
    }

    pub fn with_services(mut self, services: Arc<dyn ServiceManager>) -> Self {
        self.services = services;
        self
    }

    pub fn with_settle(mut self, settle: Settle) -> Self {
        self.settle = settle;
        self
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("host", &self.host)
            .field("backups", &self.backups)
            .field("settle", &self.settle)
            .finish()
    }
}

/// One configuration surface and the domain-specific half of the protocol
#[async_trait]
pub trait Domain: Send + Sync {
    type Desired: fmt::Debug + Clone + PartialEq + Serialize + Send + Sync;
    type Actual: fmt::Debug + Clone + PartialEq + Serialize + Send + Sync;

    fn domain(&self) -> ConfigurationDomain;

    /// The single artifact this domain owns
    fn artifact(&self, config: &HardeningConfig) -> PathBuf;

    /// Permission bits the artifact is written with
    fn mode(&self) -> u32 {
        0o644
    }

    /// Target state from declared configuration alone; no I/O
    fn resolve(&self, config: &HardeningConfig) -> Self::Desired;

    /// Read live state without side effects.
    ///
    /// An absent tool or service yields an "absent" state; only a read
    /// that is impossible (e.g. permission denied) is an error.
    async fn probe(&self, ctx: &Context) -> Result<Self::Actual, StepError>;

    fn diff(&self, actual: &Self::Actual, desired: &Self::Desired) -> Diff;

    /// Full artifact content, a pure function of `desired`
    fn render(&self, desired: &Self::Desired) -> String;

    /// Check a staged render; `Err` carries the validation detail
    async fn validate(
        &self,
        ctx: &Context,
        staged: &Path,
        rendered: &str,
        desired: &Self::Desired,
    ) -> Result<(), String>;

    /// Make the swapped-in artifact take effect on the live system
    async fn activate(
        &self,
        ctx: &Context,
        desired: &Self::Desired,
        actual: &Self::Actual,
    ) -> Result<(), String>;

    /// Fields still wrong after activation; empty means verified
    fn verify(&self, actual: &Self::Actual, desired: &Self::Desired) -> Diff {
        self.diff(actual, desired)
    }

    fn probe_error(&self, detail: impl fmt::Display) -> StepError
    where
        Self: Sized,
    {
        StepError::Probe {
            domain: self.domain(),
            detail: detail.to_string(),
        }
    }
}

/// Outcome of one reconciler step; never mutated once returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub domain: ConfigurationDomain,
    pub changed: bool,
    pub validated: bool,
    pub diff: Diff,
    /// Saved original content, when the artifact existed before
    pub backup: Option<PathBuf>,
    pub error: Option<StepError>,
}

impl ApplyResult {
    pub fn unchanged(domain: ConfigurationDomain) -> Self {
        Self {
            domain,
            changed: false,
            validated: true,
            diff: Diff::new(),
            backup: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Dry-run view of one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub domain: ConfigurationDomain,
    pub artifact: PathBuf,
    pub diff: Diff,
    pub backup_recorded: bool,
}

/// Object-safe view of a domain, as stored in a pipeline
#[async_trait]
pub trait Reconcile: Send + Sync {
    fn domain(&self) -> ConfigurationDomain;

    fn artifact(&self, config: &HardeningConfig) -> PathBuf;

    /// Probe, resolve and diff; performs no writes
    async fn plan(&self, ctx: &Context) -> Result<Plan, StepError>;

    /// Live state as JSON, for display
    async fn status(&self, ctx: &Context) -> Result<serde_json::Value, StepError>;

    async fn apply(&self, ctx: &Context) -> ApplyResult;
}

#[async_trait]
impl<D> Reconcile for D
where
    D: Domain + 'static,
{
    fn domain(&self) -> ConfigurationDomain {
        Domain::domain(self)
    }

    fn artifact(&self, config: &HardeningConfig) -> PathBuf {
        Domain::artifact(self, config)
    }

    async fn plan(&self, ctx: &Context) -> Result<Plan, StepError> {
        let desired = self.resolve(&ctx.config);
        let actual = self.probe(ctx).await?;
        let artifact = Domain::artifact(self, &ctx.config);
        let backup_recorded = ctx
            .backups
            .get(&artifact)
            .map(|entry| entry.is_some())
            .unwrap_or(false);
        Ok(Plan {
            domain: Domain::domain(self),
            diff: self.diff(&actual, &desired),
            artifact,
            backup_recorded,
        })
    }

    async fn status(&self, ctx: &Context) -> Result<serde_json::Value, StepError> {
        let actual = self.probe(ctx).await?;
        serde_json::to_value(&actual).map_err(|e| self.probe_error(e))
    }

    async fn apply(&self, ctx: &Context) -> ApplyResult {
        converge(self, ctx).await
    }
}
