//! Declared hardening options
//!
//! Every option has a documented secure default; an empty config file
//! yields a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Port used when `ssh.port` is not declared
pub const DEFAULT_SSH_PORT: u16 = 22;

/// The complete declared configuration for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HardeningConfig {
    pub ssh: SshConfig,
    pub firewall: FirewallConfig,
    pub jail: JailConfig,
    pub privileged_group: PrivilegedGroupConfig,
    pub emergency: EmergencyConfig,
    pub pipeline: PipelineConfig,
}

/// `PermitRootLogin` modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootLoginMode {
    Yes,
    No,
    ProhibitPassword,
    ForcedCommandsOnly,
}

impl RootLoginMode {
    /// Keyword as written in sshd_config and printed by `sshd -T`
    pub fn as_sshd(&self) -> &'static str {
        match self {
            RootLoginMode::Yes => "yes",
            RootLoginMode::No => "no",
            RootLoginMode::ProhibitPassword => "prohibit-password",
            RootLoginMode::ForcedCommandsOnly => "forced-commands-only",
        }
    }
}

impl fmt::Display for RootLoginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sshd())
    }
}

impl FromStr for RootLoginMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(RootLoginMode::Yes),
            "no" => Ok(RootLoginMode::No),
            // older OpenSSH prints the deprecated alias
            "prohibit-password" | "without-password" => Ok(RootLoginMode::ProhibitPassword),
            "forced-commands-only" => Ok(RootLoginMode::ForcedCommandsOnly),
            other => Err(format!("unknown PermitRootLogin mode '{}'", other)),
        }
    }
}

/// SSH daemon policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    /// Listening port
    pub port: u16,

    pub permit_root_login: RootLoginMode,

    pub password_authentication: bool,

    pub pubkey_authentication: bool,

    pub max_auth_tries: u32,

    /// Seconds allowed to complete authentication
    #[serde(with = "duration_secs")]
    pub login_grace_time: Duration,

    pub x11_forwarding: bool,

    /// Restrict logins to members of these groups (empty = no restriction)
    pub allow_groups: Vec<String>,

    /// Service unit that owns the daemon
    pub service: String,

    /// Drop-in file owned by hostguard
    pub drop_in_path: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            permit_root_login: RootLoginMode::No,
            password_authentication: false,
            pubkey_authentication: true,
            max_auth_tries: 3,
            login_grace_time: Duration::from_secs(30),
            x11_forwarding: false,
            allow_groups: Vec::new(),
            service: "sshd".to_string(),
            drop_in_path: PathBuf::from("/etc/ssh/sshd_config.d/10-hostguard.conf"),
        }
    }
}

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Dccp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::Dccp => "dccp",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            "dccp" => Ok(Protocol::Dccp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// An exposed port, written `443/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("port '{}' must be written as <port>/<protocol>", s))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port number in '{}'", s))?;
        if port == 0 {
            return Err(format!("port 0 is not allowed in '{}'", s));
        }
        Ok(Self {
            port,
            protocol: proto.parse()?,
        })
    }
}

impl TryFrom<String> for PortSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

/// Firewall zone exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallConfig {
    pub enabled: bool,

    pub zone: String,

    /// Allowed named services; everything else is removed from the zone
    pub services: Vec<String>,

    /// Allowed ports; the SSH port is always added
    pub ports: Vec<PortSpec>,

    pub service: String,

    pub zone_dir: PathBuf,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            zone: "public".to_string(),
            services: Vec::new(),
            ports: Vec::new(),
            service: "firewalld".to_string(),
            zone_dir: PathBuf::from("/etc/firewalld/zones"),
        }
    }
}

impl FirewallConfig {
    /// Path of the zone definition owned by hostguard
    pub fn zone_path(&self) -> PathBuf {
        self.zone_dir.join(format!("{}.xml", self.zone))
    }
}

/// Brute-force protection jail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JailConfig {
    pub enabled: bool,

    /// Jail section name
    pub name: String,

    /// Failures within `find_time` that trigger a ban
    pub max_retry: u32,

    #[serde(with = "duration_secs")]
    pub find_time: Duration,

    #[serde(with = "duration_secs")]
    pub ban_time: Duration,

    pub ignore_ip: Vec<String>,

    pub service: String,

    pub path: PathBuf,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "sshd".to_string(),
            max_retry: 5,
            find_time: Duration::from_secs(600),
            ban_time: Duration::from_secs(3600),
            ignore_ip: vec!["127.0.0.1/8".to_string(), "::1".to_string()],
            service: "fail2ban".to_string(),
            path: PathBuf::from("/etc/fail2ban/jail.d/hostguard.local"),
        }
    }
}

/// Privileged (sudo) group membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrivilegedGroupConfig {
    pub enabled: bool,

    pub group: String,

    pub members: Vec<String>,

    /// Grant sudo without a password
    pub nopasswd: bool,

    /// Remove members that are not declared
    pub exclusive: bool,

    pub sudoers_dir: PathBuf,
}

impl Default for PrivilegedGroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: "sudo".to_string(),
            members: Vec::new(),
            nopasswd: false,
            exclusive: false,
            sudoers_dir: PathBuf::from("/etc/sudoers.d"),
        }
    }
}

impl PrivilegedGroupConfig {
    /// Path of the sudoers drop-in owned by hostguard
    pub fn sudoers_path(&self) -> PathBuf {
        self.sudoers_dir.join(format!("hostguard-{}", self.group))
    }
}

/// Emergency administrator credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmergencyConfig {
    pub enabled: bool,

    pub user: String,

    /// Public keys, one OpenSSH `authorized_keys` line each
    pub authorized_keys: Vec<String>,

    /// Home directory (defaults to `/home/<user>`, or `/root` for root)
    pub home: Option<PathBuf>,

    pub shell: String,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user: "rescue".to_string(),
            authorized_keys: Vec::new(),
            home: None,
            shell: "/bin/bash".to_string(),
        }
    }
}

impl EmergencyConfig {
    pub fn home_dir(&self) -> PathBuf {
        match &self.home {
            Some(home) => home.clone(),
            None if self.user == "root" => PathBuf::from("/root"),
            None => Path::new("/home").join(&self.user),
        }
    }

    pub fn authorized_keys_path(&self) -> PathBuf {
        self.home_dir().join(".ssh").join("authorized_keys")
    }
}

/// Pipeline behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Treat every checkpoint as confirmed when no terminal is attached
    pub non_interactive_confirm: bool,

    /// Backups, run reports and the lock file live here
    pub state_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            non_interactive_confirm: false,
            state_dir: PathBuf::from("/var/lib/hostguard"),
        }
    }
}

impl HardeningConfig {
    /// Reject values no domain could ever converge to
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh.port == 0 {
            return Err(ConfigError::Invalid("ssh.port must be between 1 and 65535".into()));
        }
        if self.ssh.max_auth_tries == 0 {
            return Err(ConfigError::Invalid("ssh.max_auth_tries must be at least 1".into()));
        }
        if self.ssh.login_grace_time.is_zero() {
            return Err(ConfigError::Invalid(
                "ssh.login_grace_time of 0 disables the limit; declare a positive value".into(),
            ));
        }
        for group in &self.ssh.allow_groups {
            check_name("ssh.allow_groups", group)?;
        }

        if self.firewall.enabled {
            check_name("firewall.zone", &self.firewall.zone)?;
            for service in &self.firewall.services {
                check_name("firewall.services", service)?;
            }
        }

        if self.jail.enabled {
            if self.jail.max_retry == 0 {
                return Err(ConfigError::Invalid("jail.max_retry must be at least 1".into()));
            }
            if self.jail.find_time.is_zero() || self.jail.ban_time.is_zero() {
                return Err(ConfigError::Invalid(
                    "jail.find_time and jail.ban_time must be positive".into(),
                ));
            }
            check_name("jail.name", &self.jail.name)?;
        }

        if self.privileged_group.enabled {
            check_name("privileged_group.group", &self.privileged_group.group)?;
            let mut seen = BTreeSet::new();
            for member in &self.privileged_group.members {
                check_name("privileged_group.members", member)?;
                if !seen.insert(member) {
                    return Err(ConfigError::Invalid(format!(
                        "privileged_group.members lists '{}' twice",
                        member
                    )));
                }
            }
        }

        if self.emergency.enabled {
            check_name("emergency.user", &self.emergency.user)?;
            if self.emergency.authorized_keys.is_empty() {
                return Err(ConfigError::Invalid(
                    "emergency.authorized_keys must list at least one key when enabled".into(),
                ));
            }
            if let Some(bad) = self
                .emergency
                .authorized_keys
                .iter()
                .find(|k| k.trim().is_empty() || k.contains('\n'))
            {
                return Err(ConfigError::Invalid(format!(
                    "emergency.authorized_keys entry {:?} must be a single non-empty line",
                    bad
                )));
            }
        }

        Ok(())
    }

    /// Domains the declared configuration turns on
    pub fn enabled_domains(&self) -> Vec<crate::types::ConfigurationDomain> {
        use crate::types::ConfigurationDomain as D;
        let mut domains = vec![D::SshPolicy];
        if self.firewall.enabled {
            domains.push(D::FirewallExposure);
        }
        if self.jail.enabled {
            domains.push(D::IntrusionJail);
        }
        if self.privileged_group.enabled {
            domains.push(D::PrivilegedGroup);
        }
        if self.emergency.enabled {
            domains.push(D::EmergencyCredential);
        }
        domains
    }
}

/// User, group, zone and service names: `[a-z_][a-z0-9_.-]*`
fn check_name(option: &str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.')
    });
    if valid_first && valid_rest && value.len() <= 32 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{}: '{}' is not a valid name",
            option, value
        )))
    }
}
