//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// One independently-owned configuration surface of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigurationDomain {
    /// SSH daemon policy (port, root login, password auth)
    SshPolicy,
    /// Firewall zone exposure (allowed services and ports)
    FirewallExposure,
    /// Brute-force protection jail
    IntrusionJail,
    /// Privileged (sudo) group membership
    PrivilegedGroup,
    /// Emergency administrator credential
    EmergencyCredential,
}

impl ConfigurationDomain {
    /// Every domain, in declaration order
    pub const ALL: [ConfigurationDomain; 5] = [
        ConfigurationDomain::SshPolicy,
        ConfigurationDomain::FirewallExposure,
        ConfigurationDomain::IntrusionJail,
        ConfigurationDomain::PrivilegedGroup,
        ConfigurationDomain::EmergencyCredential,
    ];

    /// Stable identifier used on the command line and in reports
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationDomain::SshPolicy => "ssh-policy",
            ConfigurationDomain::FirewallExposure => "firewall-exposure",
            ConfigurationDomain::IntrusionJail => "intrusion-jail",
            ConfigurationDomain::PrivilegedGroup => "privileged-group",
            ConfigurationDomain::EmergencyCredential => "emergency-credential",
        }
    }

    /// Whether a change in this domain can cut off remote administrative access
    pub fn affects_reachability(&self) -> bool {
        matches!(
            self,
            ConfigurationDomain::SshPolicy | ConfigurationDomain::FirewallExposure
        )
    }
}

impl fmt::Display for ConfigurationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigurationDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ConfigurationDomain::ALL
            .into_iter()
            .find(|d| d.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = ConfigurationDomain::ALL.iter().map(|d| d.as_str()).collect();
                format!("unknown domain '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Current Unix timestamp in seconds.
///
/// A clock set before 1970 reads as 0 rather than failing a run.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
