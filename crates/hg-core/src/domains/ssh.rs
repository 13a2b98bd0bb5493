//! SSH daemon policy
//!
//! hostguard owns one `sshd_config.d` drop-in. Effective state is read back
//! from `sshd -T` (what the daemon would actually use) and from the
//! listening sockets, never from the drop-in itself.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{run_checked, MANAGED_HEADER};
use crate::config::{HardeningConfig, RootLoginMode};
use crate::error::StepError;
use crate::host::is_missing_program;
use crate::reconcile::{Context, Diff, Domain};
use crate::types::ConfigurationDomain;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshDesired {
    pub port: u16,
    pub permit_root_login: RootLoginMode,
    pub password_authentication: bool,
    pub pubkey_authentication: bool,
    pub max_auth_tries: u32,
    /// Seconds
    pub login_grace_time: u64,
    pub x11_forwarding: bool,
    pub allow_groups: Vec<String>,
}

/// Effective daemon settings; `None` where sshd could not report them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SshActual {
    pub ports: Option<BTreeSet<u16>>,
    pub permit_root_login: Option<RootLoginMode>,
    pub password_authentication: Option<bool>,
    pub pubkey_authentication: Option<bool>,
    pub max_auth_tries: Option<u32>,
    pub login_grace_time: Option<u64>,
    pub x11_forwarding: Option<bool>,
    pub allow_groups: Option<Vec<String>>,
    /// Ports sshd is listening on right now
    pub listening: Option<BTreeSet<u16>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SshPolicy;

#[async_trait]
impl Domain for SshPolicy {
    type Desired = SshDesired;
    type Actual = SshActual;

    fn domain(&self) -> ConfigurationDomain {
        ConfigurationDomain::SshPolicy
    }

    fn artifact(&self, config: &HardeningConfig) -> PathBuf {
        config.ssh.drop_in_path.clone()
    }

    fn resolve(&self, config: &HardeningConfig) -> SshDesired {
        let ssh = &config.ssh;
        SshDesired {
            port: ssh.port,
            permit_root_login: ssh.permit_root_login,
            password_authentication: ssh.password_authentication,
            pubkey_authentication: ssh.pubkey_authentication,
            max_auth_tries: ssh.max_auth_tries,
            login_grace_time: ssh.login_grace_time.as_secs(),
            x11_forwarding: ssh.x11_forwarding,
            allow_groups: ssh.allow_groups.clone(),
        }
    }

    async fn probe(&self, ctx: &Context) -> Result<SshActual, StepError> {
        let mut actual = match ctx.host.run("sshd", &["-T"]).await {
            Ok(output) if output.success() => parse_effective(&output.stdout),
            Ok(output) => {
                return Err(self.probe_error(format!("sshd -T failed: {}", output.detail())));
            }
            Err(e) if is_missing_program(&e) => {
                tracing::warn!("sshd not installed; treating SSH policy as absent");
                SshActual::default()
            }
            Err(e) => return Err(self.probe_error(format!("cannot run sshd -T: {}", e))),
        };

        actual.listening = match ctx.host.run("ss", &["-Hltnp"]).await {
            Ok(output) if output.success() => Some(parse_listening(&output.stdout)),
            Ok(output) => {
                tracing::warn!("ss failed, listening ports unknown: {}", output.detail());
                None
            }
            Err(e) if is_missing_program(&e) => None,
            Err(e) => return Err(self.probe_error(format!("cannot run ss: {}", e))),
        };

        Ok(actual)
    }

    fn diff(&self, actual: &SshActual, desired: &SshDesired) -> Diff {
        let ports = BTreeSet::from([desired.port]);
        let listening = actual.listening.as_ref().map(|l| l.contains(&desired.port));
        Diff::new()
            .set("port", actual.ports.as_ref(), &ports)
            .field(
                "permit_root_login",
                actual.permit_root_login.as_ref(),
                &desired.permit_root_login,
            )
            .field(
                "password_authentication",
                actual.password_authentication.as_ref(),
                &desired.password_authentication,
            )
            .field(
                "pubkey_authentication",
                actual.pubkey_authentication.as_ref(),
                &desired.pubkey_authentication,
            )
            .field("max_auth_tries", actual.max_auth_tries.as_ref(), &desired.max_auth_tries)
            .field(
                "login_grace_time",
                actual.login_grace_time.as_ref(),
                &desired.login_grace_time,
            )
            .field("x11_forwarding", actual.x11_forwarding.as_ref(), &desired.x11_forwarding)
            .list(
                "allow_groups",
                actual.allow_groups.as_deref(),
                &desired.allow_groups,
            )
            .field("listening", listening.as_ref(), &true)
    }

    fn render(&self, desired: &SshDesired) -> String {
        let mut out = String::from(MANAGED_HEADER);
        out.push_str(&format!("Port {}\n", desired.port));
        out.push_str(&format!("PermitRootLogin {}\n", desired.permit_root_login.as_sshd()));
        out.push_str(&format!(
            "PasswordAuthentication {}\n",
            yes_no(desired.password_authentication)
        ));
        out.push_str(&format!(
            "PubkeyAuthentication {}\n",
            yes_no(desired.pubkey_authentication)
        ));
        out.push_str(&format!("MaxAuthTries {}\n", desired.max_auth_tries));
        out.push_str(&format!("LoginGraceTime {}\n", desired.login_grace_time));
        out.push_str(&format!("X11Forwarding {}\n", yes_no(desired.x11_forwarding)));
        if !desired.allow_groups.is_empty() {
            out.push_str(&format!("AllowGroups {}\n", desired.allow_groups.join(" ")));
        }
        out
    }

    async fn validate(
        &self,
        ctx: &Context,
        staged: &Path,
        _rendered: &str,
        _desired: &SshDesired,
    ) -> Result<(), String> {
        let staged = staged.to_string_lossy().into_owned();
        run_checked(&ctx.host, "sshd", &["-t", "-f", staged.as_str()]).await?;
        Ok(())
    }

    async fn activate(
        &self,
        ctx: &Context,
        _desired: &SshDesired,
        _actual: &SshActual,
    ) -> Result<(), String> {
        let unit = &ctx.config.ssh.service;
        let active = ctx
            .services
            .is_active(&ctx.host, unit)
            .await
            .map_err(|e| e.to_string())?;
        if active == Some(false) {
            ctx.services
                .enable_now(&ctx.host, unit)
                .await
                .map_err(|e| e.to_string())
        } else {
            ctx.services
                .reload(&ctx.host, unit)
                .await
                .map_err(|e| e.to_string())
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn parse_yes_no(value: &str) -> Option<bool> {
    match value {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// Parse `sshd -T` output: lowercase `keyword value` lines
pub fn parse_effective(output: &str) -> SshActual {
    let mut actual = SshActual {
        ports: Some(BTreeSet::new()),
        allow_groups: Some(Vec::new()),
        ..SshActual::default()
    };

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim();
        match key {
            "port" => {
                if let (Some(ports), Ok(port)) = (actual.ports.as_mut(), value.parse()) {
                    ports.insert(port);
                }
            }
            "permitrootlogin" => actual.permit_root_login = value.parse().ok(),
            "passwordauthentication" => actual.password_authentication = parse_yes_no(value),
            "pubkeyauthentication" => actual.pubkey_authentication = parse_yes_no(value),
            "maxauthtries" => actual.max_auth_tries = value.parse().ok(),
            "logingracetime" => actual.login_grace_time = value.parse().ok(),
            "x11forwarding" => actual.x11_forwarding = parse_yes_no(value),
            "allowgroups" => {
                if let Some(groups) = actual.allow_groups.as_mut() {
                    groups.extend(value.split_whitespace().map(str::to_string));
                }
            }
            _ => {}
        }
    }

    if actual.ports.as_ref().is_some_and(BTreeSet::is_empty) {
        actual.ports = None;
    }
    actual
}

/// Ports of `sshd` listeners in `ss -Hltnp` output
pub fn parse_listening(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter(|line| line.contains("\"sshd\""))
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| local.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CommandOutput, Host, ScriptedRunner};
    use std::sync::Arc;
    use tempfile::TempDir;

    const SSHD_T: &str = "port 22\n\
                          permitrootlogin yes\n\
                          passwordauthentication yes\n\
                          pubkeyauthentication yes\n\
                          maxauthtries 6\n\
                          logingracetime 120\n\
                          x11forwarding no\n\
                          usepam yes\n";

    const SS: &str = "LISTEN 0 128 0.0.0.0:22 0.0.0.0:* users:((\"sshd\",pid=812,fd=3))\n\
                      LISTEN 0 128 [::]:22 [::]:* users:((\"sshd\",pid=812,fd=4))\n\
                      LISTEN 0 4096 127.0.0.53%lo:53 0.0.0.0:* users:((\"systemd-resolve\",pid=600,fd=14))\n";

    #[test]
    fn test_parse_effective() {
        let actual = parse_effective(SSHD_T);
        assert_eq!(actual.ports, Some(BTreeSet::from([22])));
        assert_eq!(actual.permit_root_login, Some(RootLoginMode::Yes));
        assert_eq!(actual.password_authentication, Some(true));
        assert_eq!(actual.login_grace_time, Some(120));
        assert_eq!(actual.allow_groups, Some(vec![]));
    }

    #[test]
    fn test_parse_listening_only_sshd() {
        assert_eq!(parse_listening(SS), BTreeSet::from([22]));
    }

    #[test]
    fn test_scenario_diff_covers_port_root_login_and_password() {
        let mut config = HardeningConfig::default();
        config.ssh.port = 2222;
        let desired = SshPolicy.resolve(&config);
        let mut actual = parse_effective(SSHD_T);
        actual.listening = Some(parse_listening(SS));

        let diff = SshPolicy.diff(&actual, &desired);
        let fields = diff.fields();
        for field in ["port", "permit_root_login", "password_authentication", "listening"] {
            assert!(fields.contains(&field), "missing {}", field);
        }
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let config = HardeningConfig::default();
        assert_eq!(SshPolicy.resolve(&config), SshPolicy.resolve(&config));
        assert_eq!(
            SshPolicy.render(&SshPolicy.resolve(&config)),
            SshPolicy.render(&SshPolicy.resolve(&config))
        );
    }

    #[test]
    fn test_render_contains_all_directives() {
        let mut config = HardeningConfig::default();
        config.ssh.port = 2222;
        config.ssh.allow_groups = vec!["admins".into(), "ops".into()];
        let rendered = SshPolicy.render(&SshPolicy.resolve(&config));
        assert!(rendered.starts_with("# Managed by hostguard"));
        assert!(rendered.contains("Port 2222\n"));
        assert!(rendered.contains("PermitRootLogin no\n"));
        assert!(rendered.contains("PasswordAuthentication no\n"));
        assert!(rendered.contains("AllowGroups admins ops\n"));
    }

    #[tokio::test]
    async fn test_probe_without_sshd_is_absent_not_error() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
        }));
        let host = Host::with_root(dir.path(), runner);
        let ctx = Context::new(host, Arc::new(HardeningConfig::default()));

        let actual = SshPolicy.probe(&ctx).await.unwrap();
        assert_eq!(actual, SshActual::default());
    }

    #[tokio::test]
    async fn test_probe_permission_denied_is_error() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|inv| {
            if inv.program == "sshd" {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }));
        let host = Host::with_root(dir.path(), runner);
        let ctx = Context::new(host, Arc::new(HardeningConfig::default()));

        let err = SshPolicy.probe(&ctx).await.unwrap_err();
        assert!(matches!(err, StepError::Probe { .. }));
    }
}
