//! Ordered execution of reconcilers and checkpoints
//!
//! Steps run strictly one after another. The first failure or refused
//! checkpoint ends the run; later steps are never started.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::HardeningConfig;
use crate::domains;
use crate::error::ErrorKind;
use crate::gate::{CheckpointGate, Confirmation};
use crate::reconcile::{ApplyResult, Context, Reconcile};
use crate::types::{unix_now, ConfigurationDomain};

/// Shown before the firewall step
pub const SSH_CHECKPOINT: &str = "SSH policy applied. From a NEW terminal, confirm you can still log \
     in on the configured port before the firewall is changed. Keep this session open.";

/// Shown before the jail step
pub const FIREWALL_CHECKPOINT: &str = "Firewall applied. From a NEW terminal, confirm you can still \
     log in before brute-force protection is enabled. Keep this session open.";

/// One entry of a pipeline
pub enum Step {
    Reconcile(Box<dyn Reconcile>),
    Gate { message: String },
}

impl Step {
    pub fn gate(message: impl Into<String>) -> Self {
        Step::Gate {
            message: message.into(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Step::Reconcile(r) => r.domain().to_string(),
            Step::Gate { .. } => "checkpoint".to_string(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Reconcile(r) => f.debug_tuple("Reconcile").field(&r.domain()).finish(),
            Step::Gate { message } => f.debug_struct("Gate").field("message", message).finish(),
        }
    }
}

/// Recorded outcome of one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepRecord {
    Reconcile {
        index: usize,
        result: ApplyResult,
    },
    Gate {
        index: usize,
        message: String,
        confirmation: Confirmation,
    },
}

impl StepRecord {
    pub fn index(&self) -> usize {
        match self {
            StepRecord::Reconcile { index, .. } | StepRecord::Gate { index, .. } => *index,
        }
    }
}

/// Where a run is, or how it ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Running,
    Completed {
        changes: usize,
    },
    /// A checkpoint was refused; not an error
    Aborted {
        step: usize,
        reason: String,
    },
    Failed {
        step: usize,
        domain: ConfigurationDomain,
        kind: ErrorKind,
        message: String,
        remediation: String,
    },
}

impl PipelineState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed { .. }
                | PipelineState::Aborted { .. }
                | PipelineState::Failed { .. }
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::NotStarted => f.write_str("not started"),
            PipelineState::Running => f.write_str("running"),
            PipelineState::Completed { changes } => write!(f, "Completed with {} change(s)", changes),
            PipelineState::Aborted { step, reason } => {
                write!(f, "Aborted at step {}: {}", step + 1, reason)
            }
            PipelineState::Failed {
                step,
                domain,
                kind,
                message,
                ..
            } => write!(f, "Failed at step {} ({}): {}: {}", step + 1, domain, kind, message),
        }
    }
}

/// The record of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    id: Uuid,
    host: String,
    started_at: u64,
    finished_at: Option<u64>,
    steps: Vec<String>,
    records: Vec<StepRecord>,
    state: PipelineState,
}

impl PipelineRun {
    fn new(steps: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            started_at: unix_now(),
            finished_at: None,
            steps,
            records: Vec::new(),
            state: PipelineState::NotStarted,
        }
    }

    fn finish(&mut self, state: PipelineState) {
        tracing::info!("Pipeline {}", state);
        self.state = state;
        self.finished_at = Some(unix_now());
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<u64> {
        self.finished_at
    }

    /// Labels of every planned step, executed or not
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Reconcile results in execution order
    pub fn results(&self) -> impl Iterator<Item = &ApplyResult> {
        self.records.iter().filter_map(|r| match r {
            StepRecord::Reconcile { result, .. } => Some(result),
            StepRecord::Gate { .. } => None,
        })
    }

    pub fn changes(&self) -> usize {
        self.results().filter(|r| r.changed).count()
    }

    /// Write to `<state_dir>/runs/<id>.json` and `<state_dir>/last-run.json`
    pub fn save(&self, state_dir: &Path) -> io::Result<PathBuf> {
        let runs = state_dir.join("runs");
        fs::create_dir_all(&runs)?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let path = runs.join(format!("{}.json", self.id));
        fs::write(&path, &json)?;
        fs::write(state_dir.join(LAST_RUN_FILE), &json)?;
        Ok(path)
    }

    /// The most recently saved run, if any
    pub fn load_last(state_dir: &Path) -> io::Result<Option<Self>> {
        match fs::read(state_dir.join(LAST_RUN_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

const LAST_RUN_FILE: &str = "last-run.json";

/// An ordered list of steps
#[derive(Debug, Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// The standard order for the enabled domains.
    ///
    /// The emergency credential and group come first so a way in exists
    /// before access is tightened. Each reachability change is followed by
    /// a checkpoint before the next one.
    pub fn standard(config: &HardeningConfig) -> Self {
        let enabled = config.enabled_domains();
        let on = |d: ConfigurationDomain| enabled.contains(&d);
        let mut steps = Vec::new();

        for domain in [
            ConfigurationDomain::EmergencyCredential,
            ConfigurationDomain::PrivilegedGroup,
        ] {
            if on(domain) {
                steps.push(Step::Reconcile(domains::reconciler(domain)));
            }
        }
        if on(ConfigurationDomain::SshPolicy) {
            steps.push(Step::Reconcile(domains::reconciler(ConfigurationDomain::SshPolicy)));
            steps.push(Step::gate(SSH_CHECKPOINT));
        }
        if on(ConfigurationDomain::FirewallExposure) {
            steps.push(Step::Reconcile(domains::reconciler(
                ConfigurationDomain::FirewallExposure,
            )));
            steps.push(Step::gate(FIREWALL_CHECKPOINT));
        }
        if on(ConfigurationDomain::IntrusionJail) {
            steps.push(Step::Reconcile(domains::reconciler(ConfigurationDomain::IntrusionJail)));
        }

        // a checkpoint only guards a step that follows it
        while matches!(steps.last(), Some(Step::Gate { .. })) {
            steps.pop();
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Domains in execution order
    pub fn domains(&self) -> Vec<ConfigurationDomain> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::Reconcile(r) => Some(r.domain()),
                Step::Gate { .. } => None,
            })
            .collect()
    }

    /// Run every step in order, stopping at the first failure or refusal
    pub async fn run(&self, ctx: &Context, gate: &mut CheckpointGate) -> PipelineRun {
        let mut run = PipelineRun::new(self.steps.iter().map(Step::label).collect());
        run.state = PipelineState::Running;
        tracing::info!("Pipeline {} started with {} step(s)", run.id, self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::Reconcile(reconciler) => {
                    let domain = reconciler.domain();
                    tracing::info!("Step {}: {}", index + 1, domain);
                    let result = reconciler.apply(ctx).await;
                    let failure = result.error.clone();
                    run.records.push(StepRecord::Reconcile { index, result });

                    if let Some(error) = failure {
                        run.finish(PipelineState::Failed {
                            step: index,
                            domain,
                            kind: error.kind(),
                            message: error.to_string(),
                            remediation: error.remediation(),
                        });
                        return run;
                    }
                }
                Step::Gate { message } => {
                    tracing::info!("Step {}: checkpoint", index + 1);
                    let confirmation = gate.confirm(message).await;
                    let granted = confirmation.granted();
                    let reason = confirmation.reason();
                    run.records.push(StepRecord::Gate {
                        index,
                        message: message.clone(),
                        confirmation,
                    });

                    if !granted {
                        run.finish(PipelineState::Aborted {
                            step: index,
                            reason,
                        });
                        return run;
                    }
                }
            }
        }

        let changes = run.changes();
        run.finish(PipelineState::Completed { changes });
        run
    }
}
