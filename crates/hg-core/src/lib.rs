//! hg-core: convergence and safety-gate engine for hostguard
//!
//! Each configuration domain is reconciled from probed actual state to a
//! desired state resolved from declared configuration. Reconcilers run in
//! a fixed order with operator checkpoints between the steps that can cut
//! off remote access.

pub mod backup;
pub mod config;
pub mod domains;
pub mod error;
pub mod gate;
pub mod host;
pub mod lock;
pub mod pipeline;
pub mod preflight;
pub mod reconcile;
pub mod service;
pub mod types;

pub use config::HardeningConfig;
pub use error::{ErrorKind, HgError, StepError};
pub use gate::{CheckpointGate, Confirmation};
pub use host::Host;
pub use pipeline::{Pipeline, PipelineRun, PipelineState, Step};
pub use reconcile::{ApplyResult, Context, Reconcile};
pub use types::ConfigurationDomain;
