//! Service-control surface
//!
//! The reconcilers only need to reload, restart, enable and query the
//! service that owns an artifact. `Systemd` is the implementation used on
//! real hosts.

use async_trait::async_trait;
use thiserror::Error;

use crate::host::{is_missing_program, Host, Invocation};

/// Failure to drive a service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The manager ran and reported failure
    #[error("`{command}` failed: {detail}")]
    Failed { command: String, detail: String },

    /// The manager could not be executed at all
    #[error("cannot run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Process-management operations on one named service
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Re-read configuration without dropping the process
    async fn reload(&self, host: &Host, unit: &str) -> Result<(), ServiceError>;

    async fn restart(&self, host: &Host, unit: &str) -> Result<(), ServiceError>;

    /// Enable at boot and start now
    async fn enable_now(&self, host: &Host, unit: &str) -> Result<(), ServiceError>;

    /// `Ok(None)` when the service manager itself is unavailable
    async fn is_active(&self, host: &Host, unit: &str) -> Result<Option<bool>, ServiceError>;
}

/// `systemctl`-backed service control
#[derive(Debug, Default, Clone, Copy)]
pub struct Systemd;

impl Systemd {
    async fn systemctl(&self, host: &Host, args: &[&str]) -> Result<(), ServiceError> {
        let command = Invocation::new("systemctl", args.iter().copied()).to_string();
        let output = host
            .run("systemctl", args)
            .await
            .map_err(|source| ServiceError::Spawn {
                command: command.clone(),
                source,
            })?;
        if output.success() {
            Ok(())
        } else {
            Err(ServiceError::Failed {
                command,
                detail: output.detail(),
            })
        }
    }
}

#[async_trait]
impl ServiceManager for Systemd {
    async fn reload(&self, host: &Host, unit: &str) -> Result<(), ServiceError> {
        tracing::info!("Reloading {}", unit);
        self.systemctl(host, &["reload", unit]).await
    }

    async fn restart(&self, host: &Host, unit: &str) -> Result<(), ServiceError> {
        tracing::info!("Restarting {}", unit);
        self.systemctl(host, &["restart", unit]).await
    }

    async fn enable_now(&self, host: &Host, unit: &str) -> Result<(), ServiceError> {
        self.systemctl(host, &["enable", "--now", unit]).await
    }

    async fn is_active(&self, host: &Host, unit: &str) -> Result<Option<bool>, ServiceError> {
        match host.run("systemctl", &["is-active", "--quiet", unit]).await {
            Ok(output) => Ok(Some(output.success())),
            Err(e) if is_missing_program(&e) => Ok(None),
            Err(source) => Err(ServiceError::Spawn {
                command: format!("systemctl is-active --quiet {}", unit),
                source,
            }),
        }
    }
}
