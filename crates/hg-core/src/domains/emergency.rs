//! Emergency administrator credential
//!
//! A dedicated account whose `authorized_keys` holds exactly the declared
//! keys. It runs first so that a working way in exists before SSH and the
//! firewall are tightened.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{run_checked, MANAGED_HEADER};
use crate::config::HardeningConfig;
use crate::error::StepError;
use crate::host::is_missing_program;
use crate::reconcile::{Context, Diff, Domain};
use crate::types::ConfigurationDomain;

/// Permission bits sshd's StrictModes accepts for `authorized_keys`
const KEYS_MODE: u32 = 0o600;
const SSH_DIR_MODE: u32 = 0o700;

/// Public key algorithms accepted in the file
const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmergencyDesired {
    pub user: String,
    pub home: PathBuf,
    pub shell: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmergencyActual {
    pub user_exists: Option<bool>,
    /// Key lines currently authorized; empty when the file is absent
    pub keys: Vec<String>,
    /// `None` when the file does not exist
    pub mode: Option<u32>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EmergencyCredential;

fn key_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Split off a leading options field such as `from="10.0.0.0/8",no-pty`.
/// Spaces inside double quotes belong to the options.
fn split_options(line: &str) -> Result<(Option<&str>, &str), String> {
    let first = line.split_whitespace().next().unwrap_or_default();
    if KEY_TYPES.contains(&first) {
        return Ok((None, line));
    }
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                return Ok((Some(&line[..i]), line[i..].trim_start()));
            }
            _ => {}
        }
    }
    if quoted {
        Err(format!("unterminated quote in options of '{}'", line))
    } else {
        Err(format!("unsupported or missing key type in '{}'", line))
    }
}

/// Reject a line that is not `[options] <type> <base64> [comment]`
fn check_key_line(line: &str) -> Result<(), String> {
    let (_, key) = split_options(line)?;
    let mut fields = key.split_whitespace();
    let key_type = fields.next().unwrap_or_default();
    if !KEY_TYPES.contains(&key_type) {
        return Err(format!("unsupported or missing key type in '{}'", line));
    }
    let blob = fields.next().unwrap_or_default();
    let is_base64 = !blob.is_empty()
        && blob
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));
    if !is_base64 {
        return Err(format!("key data of '{}' is not base64", key_type));
    }
    Ok(())
}

fn octal(mode: u32) -> String {
    format!("{:04o}", mode)
}

#[async_trait]
impl Domain for EmergencyCredential {
    type Desired = EmergencyDesired;
    type Actual = EmergencyActual;

    fn domain(&self) -> ConfigurationDomain {
        ConfigurationDomain::EmergencyCredential
    }

    fn artifact(&self, config: &HardeningConfig) -> PathBuf {
        config.emergency.authorized_keys_path()
    }

    fn mode(&self) -> u32 {
        KEYS_MODE
    }

    fn resolve(&self, config: &HardeningConfig) -> EmergencyDesired {
        let emergency = &config.emergency;
        let mut keys: Vec<String> = Vec::new();
        for key in &emergency.authorized_keys {
            let key = key.trim().to_string();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        EmergencyDesired {
            user: emergency.user.clone(),
            home: emergency.home_dir(),
            shell: emergency.shell.clone(),
            keys,
        }
    }

    async fn probe(&self, ctx: &Context) -> Result<EmergencyActual, StepError> {
        let emergency = &ctx.config.emergency;
        let path = emergency.authorized_keys_path();

        let user_exists = match ctx.host.run("getent", &["passwd", emergency.user.as_str()]).await {
            Ok(output) if output.success() => Some(true),
            Ok(output) if output.status == Some(2) => Some(false),
            Ok(output) => {
                return Err(self.probe_error(format!("getent passwd failed: {}", output.detail())));
            }
            Err(e) if is_missing_program(&e) => None,
            Err(e) => return Err(self.probe_error(format!("cannot run getent: {}", e))),
        };

        let content = ctx
            .host
            .read_string_optional(&path)
            .map_err(|e| self.probe_error(format!("cannot read {}: {}", path.display(), e)))?;
        let mode = ctx
            .host
            .file_mode(&path)
            .map_err(|e| self.probe_error(format!("cannot stat {}: {}", path.display(), e)))?;

        Ok(EmergencyActual {
            user_exists,
            keys: content.as_deref().map(key_lines).unwrap_or_default(),
            mode,
        })
    }

    fn diff(&self, actual: &EmergencyActual, desired: &EmergencyDesired) -> Diff {
        let mode = actual.mode.map(octal);
        Diff::new()
            .field("user", actual.user_exists.as_ref(), &true)
            .list("authorized_keys", Some(actual.keys.as_slice()), &desired.keys)
            .field("mode", mode.as_ref(), &octal(KEYS_MODE))
    }

    fn render(&self, desired: &EmergencyDesired) -> String {
        let mut out = String::from(MANAGED_HEADER);
        for key in &desired.keys {
            out.push_str(key);
            out.push('\n');
        }
        out
    }

    async fn validate(
        &self,
        ctx: &Context,
        staged: &Path,
        rendered: &str,
        _desired: &EmergencyDesired,
    ) -> Result<(), String> {
        let lines = key_lines(rendered);
        if lines.is_empty() {
            return Err("no keys to authorize".to_string());
        }
        for line in &lines {
            check_key_line(line)?;
        }
        let staged = staged.to_string_lossy().into_owned();
        run_checked(&ctx.host, "ssh-keygen", &["-l", "-f", staged.as_str()]).await?;
        Ok(())
    }

    async fn activate(
        &self,
        ctx: &Context,
        desired: &EmergencyDesired,
        actual: &EmergencyActual,
    ) -> Result<(), String> {
        let user = desired.user.as_str();
        let owner = format!("{}:", user);
        let home = desired.home.to_string_lossy().into_owned();
        if actual.user_exists != Some(true) {
            // the home directory may already exist, created by the staging step
            run_checked(
                &ctx.host,
                "useradd",
                &["-m", "-d", home.as_str(), "-s", desired.shell.as_str(), user],
            )
            .await?;
            run_checked(&ctx.host, "chown", &[owner.as_str(), home.as_str()]).await?;
            tracing::info!("Created emergency user {}", user);
        }

        let ssh_dir = desired.home.join(".ssh");
        ctx.host
            .set_mode(&ssh_dir, SSH_DIR_MODE)
            .map_err(|e| format!("cannot set mode on {}: {}", ssh_dir.display(), e))?;
        let ssh_dir = ssh_dir.to_string_lossy().into_owned();
        run_checked(&ctx.host, "chown", &["-R", owner.as_str(), ssh_dir.as_str()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHhvc3RndWFyZC10ZXN0LWtleS1ub3QtcmVhbA ops@laptop";

    fn config() -> HardeningConfig {
        let mut config = HardeningConfig::default();
        config.emergency.enabled = true;
        config.emergency.authorized_keys = vec![KEY.into(), format!("  {}  ", KEY)];
        config
    }

    #[test]
    fn test_resolve_trims_and_dedups_keys() {
        let desired = EmergencyCredential.resolve(&config());
        assert_eq!(desired.keys, vec![KEY.to_string()]);
        assert_eq!(desired.home, PathBuf::from("/home/rescue"));
    }

    #[test]
    fn test_key_line_checks() {
        assert!(check_key_line(KEY).is_ok());
        assert!(check_key_line("ssh-dss AAAAB3 old").is_err());
        assert!(check_key_line("ssh-ed25519 not*base64").is_err());
        assert!(check_key_line("ssh-ed25519").is_err());
    }

    #[test]
    fn test_key_line_with_options() {
        assert!(check_key_line(&format!("from=\"10.0.0.0/8\" {}", KEY)).is_ok());
        assert!(check_key_line(&format!("no-pty,command=\"echo hi there\" {}", KEY)).is_ok());
        assert!(check_key_line(&format!("restrict,from=\"a b\\\" c\" {}", KEY)).is_ok());

        let line = format!("no-pty {}", KEY);
        let (options, rest) = split_options(&line).unwrap();
        assert_eq!(options, Some("no-pty"));
        assert_eq!(rest, KEY);

        // options still need a real key after them
        assert!(check_key_line("no-pty ssh-dss AAAAB3").is_err());
        assert!(check_key_line("from=\"10.0.0.0/8 ssh-ed25519 AAAA").is_err());
        assert!(check_key_line("no-pty").is_err());
    }

    #[test]
    fn test_wrong_mode_is_a_diff() {
        let desired = EmergencyCredential.resolve(&config());
        let actual = EmergencyActual {
            user_exists: Some(true),
            keys: desired.keys.clone(),
            mode: Some(0o644),
        };
        let diff = EmergencyCredential.diff(&actual, &desired);
        assert_eq!(diff.fields(), vec!["mode"]);
        assert_eq!(diff.changes()[0].actual.as_deref(), Some("0644"));
    }

    #[test]
    fn test_render_lists_keys_after_header() {
        let desired = EmergencyCredential.resolve(&config());
        let rendered = EmergencyCredential.render(&desired);
        assert_eq!(key_lines(&rendered), desired.keys);
    }
}
