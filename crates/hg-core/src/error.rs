//! Core error types for hostguard

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::ConfigurationDomain;

/// Top-level error type for everything that can stop a run before it starts
#[derive(Error, Debug)]
pub enum HgError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Precondition error
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    /// Backup store error
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HgError {
    /// Discriminant for reporting; config and precondition failures both
    /// mean nothing was attempted
    pub fn kind(&self) -> ErrorKind {
        match self {
            HgError::Config(_) | HgError::Precondition(_) => ErrorKind::Precondition,
            HgError::Backup(_) | HgError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Override does not name a known option
    #[error("Unknown option: {0}")]
    UnknownKey(String),
}

/// Conditions under which the pipeline must never start
#[derive(Error, Debug)]
pub enum PreconditionError {
    /// Not running with administrative privilege
    #[error("must run as root (effective uid is {euid})")]
    NotPrivileged { euid: u32 },

    /// A tool an enabled domain depends on is not installed
    #[error("required tool '{tool}' for {domain} not found on search path")]
    MissingTool {
        tool: String,
        domain: ConfigurationDomain,
    },

    /// Another run holds the host lock
    #[error("another run (pid {pid}) holds the lock at {path:?}")]
    Locked { pid: u32, path: PathBuf },

    /// The lock file could not be created or read
    #[error("cannot take run lock at {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Backup store errors
#[derive(Error, Debug)]
pub enum BackupError {
    /// No backup recorded for the artifact
    #[error("no backup recorded for {0:?}")]
    NotFound(PathBuf),

    /// Stored bytes no longer match the recorded checksum
    #[error("backup of {artifact:?} is corrupt: expected sha256 {expected}, found {actual}")]
    Corrupt {
        artifact: PathBuf,
        expected: String,
        actual: String,
    },

    /// Manifest could not be parsed or written
    #[error("backup manifest {path:?}: {message}")]
    Manifest { path: PathBuf, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discriminant of a fatal step failure, used for reporting and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Precondition,
    Probe,
    Validation,
    Activation,
    VerificationMismatch,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Precondition => "PreconditionError",
            ErrorKind::Probe => "ProbeError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Activation => "ActivationError",
            ErrorKind::VerificationMismatch => "VerificationMismatch",
            ErrorKind::Io => "ArtifactIoError",
        };
        f.write_str(name)
    }
}

/// A fatal failure inside one reconciler step.
///
/// Every variant halts the pipeline; none is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// Live state could not be read at all
    #[error("{domain}: cannot read current state: {detail}")]
    Probe {
        domain: ConfigurationDomain,
        detail: String,
    },

    /// Rendered artifact rejected; the live artifact was not touched
    #[error("{domain}: rendered configuration failed validation: {detail}")]
    Validation {
        domain: ConfigurationDomain,
        detail: String,
    },

    /// Artifact is in place and valid but the service did not pick it up
    #[error("{domain}: configuration written but activation failed: {detail}")]
    Activation {
        domain: ConfigurationDomain,
        detail: String,
        backup: Option<PathBuf>,
    },

    /// Activation reported success but the live state disagrees
    #[error("{domain}: live state does not match desired state after activation: {detail}")]
    Verification {
        domain: ConfigurationDomain,
        detail: String,
        backup: Option<PathBuf>,
    },

    /// Backup, staging or swap of the artifact failed
    #[error("{domain}: artifact I/O failed: {detail}")]
    Io {
        domain: ConfigurationDomain,
        detail: String,
    },
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Probe { .. } => ErrorKind::Probe,
            StepError::Validation { .. } => ErrorKind::Validation,
            StepError::Activation { .. } => ErrorKind::Activation,
            StepError::Verification { .. } => ErrorKind::VerificationMismatch,
            StepError::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn domain(&self) -> ConfigurationDomain {
        match self {
            StepError::Probe { domain, .. }
            | StepError::Validation { domain, .. }
            | StepError::Activation { domain, .. }
            | StepError::Verification { domain, .. }
            | StepError::Io { domain, .. } => *domain,
        }
    }

    /// Operator guidance printed with the run summary
    pub fn remediation(&self) -> String {
        let reach = self.domain().affects_reachability();
        match self {
            StepError::Probe { .. } => {
                "Nothing was changed. Fix read access to the domain's state and re-run.".to_string()
            }
            StepError::Validation { .. } => {
                let mut msg = "The rendered configuration was discarded; the previous \
                               configuration is still the one in effect."
                    .to_string();
                if reach {
                    msg.push_str(" Remote access is unaffected.");
                }
                msg
            }
            StepError::Activation { backup, .. } => {
                let mut msg = "The new configuration is on disk and valid but NOT live. \
                               Inspect the service manually"
                    .to_string();
                if let Some(path) = backup {
                    msg.push_str(&format!("; the original configuration is saved at {}", path.display()));
                }
                msg.push('.');
                if reach {
                    msg.push_str(" Keep your current session open until remote access is confirmed.");
                }
                msg
            }
            StepError::Verification { backup, .. } => {
                let mut msg = "The service accepted the change but the live state differs. \
                               Manual reconciliation is required"
                    .to_string();
                if let Some(path) = backup {
                    msg.push_str(&format!("; the original configuration is saved at {}", path.display()));
                }
                msg.push('.');
                if reach {
                    msg.push_str(" Do not close your current session before testing access from a new one.");
                }
                msg
            }
            StepError::Io { .. } => {
                "The artifact could not be backed up or staged; the live configuration is unchanged."
                    .to_string()
            }
        }
    }
}
