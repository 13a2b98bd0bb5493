//! Brute-force protection jail
//!
//! One fail2ban jail guarding the SSH port. Thresholds are read back from
//! the running server; the port and ignore list only exist in the jail
//! file, so those are read from disk.

use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use super::MANAGED_HEADER;
use crate::config::HardeningConfig;
use crate::error::StepError;
use crate::host::is_missing_program;
use crate::reconcile::{Context, Diff, Domain};
use crate::types::ConfigurationDomain;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JailDesired {
    pub name: String,
    pub port: u16,
    pub max_retry: u32,
    /// Seconds
    pub find_time: u64,
    /// Seconds
    pub ban_time: u64,
    pub ignore_ip: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JailActual {
    /// From the jail file
    pub enabled: Option<bool>,
    pub port: Option<u16>,
    pub ignore_ip: Option<Vec<String>>,
    /// From the running server; `active` is `None` without fail2ban
    pub active: Option<bool>,
    pub max_retry: Option<u32>,
    pub find_time: Option<u64>,
    pub ban_time: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IntrusionJail;

/// Keys of one `[section]` of a fail2ban ini file
#[derive(Debug, Default, PartialEq, Eq)]
struct JailSection {
    enabled: Option<bool>,
    port: Option<String>,
    maxretry: Option<String>,
    findtime: Option<String>,
    bantime: Option<String>,
    ignoreip: Option<String>,
}

fn parse_section(content: &str, name: &str) -> Option<JailSection> {
    let mut section = None;
    let mut in_target = false;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_target = header.trim() == name;
            if in_target {
                section.get_or_insert_with(JailSection::default);
            }
            continue;
        }
        if !in_target {
            continue;
        }
        let (Some(current), Some((key, value))) = (section.as_mut(), line.split_once('=')) else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "enabled" => current.enabled = parse_bool(&value),
            "port" => current.port = Some(value),
            "maxretry" => current.maxretry = Some(value),
            "findtime" => current.findtime = Some(value),
            "bantime" => current.bantime = Some(value),
            "ignoreip" => current.ignoreip = Some(value),
            _ => {}
        }
    }
    section
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// An `ignoreip` entry: address, CIDR block or host name
fn valid_ignore_entry(entry: &str) -> bool {
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    match addr.parse::<IpAddr>() {
        Ok(ip) => {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            prefix.map_or(true, |p| p.parse::<u8>().is_ok_and(|p| p <= max))
        }
        Err(_) => {
            // all-numeric strings that failed to parse are broken addresses
            prefix.is_none()
                && addr.chars().any(|c| c.is_ascii_alphabetic())
                && addr
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        }
    }
}

/// Result of one `fail2ban-client get`
enum Lookup {
    /// fail2ban is not installed
    NoClient,
    /// Server down or jail not loaded
    Unavailable,
    Value(String),
}

impl IntrusionJail {
    async fn get(&self, ctx: &Context, key: &str) -> Result<Lookup, StepError> {
        let jail = ctx.config.jail.name.as_str();
        match ctx.host.run("fail2ban-client", &["get", jail, key]).await {
            Ok(output) if output.success() => Ok(Lookup::Value(output.stdout.trim().to_string())),
            Ok(_) => Ok(Lookup::Unavailable),
            Err(e) if is_missing_program(&e) => Ok(Lookup::NoClient),
            Err(e) => Err(self.probe_error(format!("cannot run fail2ban-client: {}", e))),
        }
    }

    async fn get_number<T: std::str::FromStr>(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<Option<T>, StepError> {
        Ok(match self.get(ctx, key).await? {
            Lookup::Value(v) => v.parse().ok(),
            Lookup::NoClient | Lookup::Unavailable => None,
        })
    }
}

#[async_trait]
impl Domain for IntrusionJail {
    type Desired = JailDesired;
    type Actual = JailActual;

    fn domain(&self) -> ConfigurationDomain {
        ConfigurationDomain::IntrusionJail
    }

    fn artifact(&self, config: &HardeningConfig) -> PathBuf {
        config.jail.path.clone()
    }

    fn resolve(&self, config: &HardeningConfig) -> JailDesired {
        let jail = &config.jail;
        JailDesired {
            name: jail.name.clone(),
            port: config.ssh.port,
            max_retry: jail.max_retry,
            find_time: jail.find_time.as_secs(),
            ban_time: jail.ban_time.as_secs(),
            ignore_ip: jail.ignore_ip.clone(),
        }
    }

    async fn probe(&self, ctx: &Context) -> Result<JailActual, StepError> {
        let config = &ctx.config.jail;
        let file = ctx
            .host
            .read_string_optional(&config.path)
            .map_err(|e| self.probe_error(format!("cannot read {}: {}", config.path.display(), e)))?;

        let mut actual = JailActual::default();
        if let Some(section) = file.as_deref().and_then(|c| parse_section(c, &config.name)) {
            actual.enabled = section.enabled;
            actual.port = section.port.and_then(|p| p.parse().ok());
            actual.ignore_ip = Some(section.ignoreip.as_deref().map(split_list).unwrap_or_default());
        }

        // the first query tells whether the server and jail are up
        match self.get(ctx, "maxretry").await? {
            Lookup::NoClient => {
                tracing::warn!("fail2ban not installed; treating jail as absent");
            }
            Lookup::Unavailable => actual.active = Some(false),
            Lookup::Value(max_retry) => {
                actual.active = Some(true);
                actual.max_retry = max_retry.parse().ok();
                actual.find_time = self.get_number(ctx, "findtime").await?;
                actual.ban_time = self.get_number(ctx, "bantime").await?;
            }
        }
        Ok(actual)
    }

    fn diff(&self, actual: &JailActual, desired: &JailDesired) -> Diff {
        Diff::new()
            .field("enabled", actual.enabled.as_ref(), &true)
            .field("port", actual.port.as_ref(), &desired.port)
            .list("ignore_ip", actual.ignore_ip.as_deref(), &desired.ignore_ip)
            .field("active", actual.active.as_ref(), &true)
            .field("max_retry", actual.max_retry.as_ref(), &desired.max_retry)
            .field("find_time", actual.find_time.as_ref(), &desired.find_time)
            .field("ban_time", actual.ban_time.as_ref(), &desired.ban_time)
    }

    fn render(&self, desired: &JailDesired) -> String {
        let mut out = String::from(MANAGED_HEADER);
        out.push_str(&format!("[{}]\n", desired.name));
        out.push_str("enabled = true\n");
        out.push_str(&format!("port = {}\n", desired.port));
        out.push_str(&format!("maxretry = {}\n", desired.max_retry));
        out.push_str(&format!("findtime = {}\n", desired.find_time));
        out.push_str(&format!("bantime = {}\n", desired.ban_time));
        if !desired.ignore_ip.is_empty() {
            out.push_str(&format!("ignoreip = {}\n", desired.ignore_ip.join(" ")));
        }
        out
    }

    /// Semantic check: the render must define the jail, enabled, with the
    /// desired thresholds, and every ignore entry must be an address
    async fn validate(
        &self,
        _ctx: &Context,
        _staged: &Path,
        rendered: &str,
        desired: &JailDesired,
    ) -> Result<(), String> {
        let section = parse_section(rendered, &desired.name)
            .ok_or_else(|| format!("no [{}] section", desired.name))?;
        if section.enabled != Some(true) {
            return Err(format!("jail [{}] is not enabled", desired.name));
        }

        let number = |key: &str, value: Option<&String>| -> Result<u64, String> {
            let value = value.ok_or_else(|| format!("{} is missing", key))?;
            match value.parse::<u64>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(format!("{} = {} is not a positive integer", key, value)),
            }
        };
        let port = number("port", section.port.as_ref())?;
        if port > u64::from(u16::MAX) {
            return Err(format!("port {} is out of range", port));
        }
        number("maxretry", section.maxretry.as_ref())?;
        number("findtime", section.findtime.as_ref())?;
        number("bantime", section.bantime.as_ref())?;

        if let Some(bad) = section
            .ignoreip
            .as_deref()
            .map(split_list)
            .unwrap_or_default()
            .into_iter()
            .find(|entry| !valid_ignore_entry(entry))
        {
            return Err(format!("ignoreip entry '{}' is not an address or host name", bad));
        }
        Ok(())
    }

    async fn activate(
        &self,
        ctx: &Context,
        _desired: &JailDesired,
        _actual: &JailActual,
    ) -> Result<(), String> {
        let unit = &ctx.config.jail.service;
        ctx.services
            .enable_now(&ctx.host, unit)
            .await
            .map_err(|e| e.to_string())?;
        ctx.services
            .restart(&ctx.host, unit)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CommandOutput, Host, ScriptedRunner};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_render_and_validate_round() {
        let desired = IntrusionJail.resolve(&HardeningConfig::default());
        let rendered = IntrusionJail.render(&desired);
        let section = parse_section(&rendered, "sshd").unwrap();
        assert_eq!(section.enabled, Some(true));
        assert_eq!(section.port.as_deref(), Some("22"));
        assert_eq!(section.bantime.as_deref(), Some("3600"));
    }

    #[test]
    fn test_jail_port_follows_ssh_port() {
        let mut config = HardeningConfig::default();
        config.ssh.port = 2222;
        assert_eq!(IntrusionJail.resolve(&config).port, 2222);
    }

    #[test]
    fn test_ignore_entries() {
        assert!(valid_ignore_entry("127.0.0.1/8"));
        assert!(valid_ignore_entry("::1"));
        assert!(valid_ignore_entry("bastion.example.com"));
        assert!(!valid_ignore_entry("10.0.0.0/33"));
        assert!(!valid_ignore_entry("bad host"));
    }

    #[test]
    fn test_parse_section_only_reads_named_jail() {
        let content = "[DEFAULT]\nbantime = 1\n[sshd]\nenabled = yes\nport = ssh\n[nginx]\nport = 80\n";
        let section = parse_section(content, "sshd").unwrap();
        assert_eq!(section.enabled, Some(true));
        assert_eq!(section.port.as_deref(), Some("ssh"));
        assert_eq!(section.bantime, None);
        assert!(parse_section(content, "postfix").is_none());
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_ignore_entry() {
        let dir = TempDir::new().unwrap();
        let mut config = HardeningConfig::default();
        config.jail.ignore_ip = vec!["300.1.1.1".into()];
        let ctx = Context::new(
            Host::with_root(dir.path(), Arc::new(ScriptedRunner::succeeding())),
            Arc::new(config),
        );
        let desired = IntrusionJail.resolve(&ctx.config);
        let rendered = IntrusionJail.render(&desired);
        let err = IntrusionJail
            .validate(&ctx, Path::new("/x"), &rendered, &desired)
            .await
            .unwrap_err();
        assert!(err.contains("300.1.1.1"));
    }

    #[tokio::test]
    async fn test_probe_reads_runtime_thresholds() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|inv| {
            match inv.args.last().map(String::as_str) {
                Some("maxretry") => Ok(CommandOutput::ok("5\n")),
                Some("findtime") => Ok(CommandOutput::ok("600\n")),
                Some("bantime") => Ok(CommandOutput::ok("3600\n")),
                _ => Ok(CommandOutput::failed(1, "")),
            }
        }));
        let ctx = Context::new(
            Host::with_root(dir.path(), runner),
            Arc::new(HardeningConfig::default()),
        );
        let actual = IntrusionJail.probe(&ctx).await.unwrap();
        assert_eq!(actual.active, Some(true));
        assert_eq!(actual.max_retry, Some(5));
        assert_eq!(actual.ban_time, Some(3600));
        // no jail file yet
        assert_eq!(actual.enabled, None);
    }

    #[tokio::test]
    async fn test_probe_without_fail2ban_is_absent() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
        }));
        let ctx = Context::new(
            Host::with_root(dir.path(), runner),
            Arc::new(HardeningConfig::default()),
        );
        let actual = IntrusionJail.probe(&ctx).await.unwrap();
        assert_eq!(actual, JailActual::default());
    }
}
