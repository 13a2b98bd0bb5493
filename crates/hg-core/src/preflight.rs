//! Checks that must pass before any step runs

use crate::config::HardeningConfig;
use crate::error::PreconditionError;
use crate::host::Host;
use crate::types::ConfigurationDomain;

/// Programs a domain shells out to
pub fn required_tools(domain: ConfigurationDomain) -> &'static [&'static str] {
    match domain {
        ConfigurationDomain::SshPolicy => &["sshd", "systemctl", "ss"],
        ConfigurationDomain::FirewallExposure => &["firewall-cmd", "firewall-offline-cmd", "systemctl"],
        ConfigurationDomain::IntrusionJail => &["fail2ban-client", "systemctl"],
        ConfigurationDomain::PrivilegedGroup => &["visudo", "gpasswd", "getent", "groupadd"],
        ConfigurationDomain::EmergencyCredential => &["ssh-keygen", "useradd", "chown", "getent"],
    }
}

/// Tools needed by the enabled domains that are not on the search path
pub fn missing_tools(config: &HardeningConfig, host: &Host) -> Vec<(ConfigurationDomain, &'static str)> {
    config
        .enabled_domains()
        .into_iter()
        .flat_map(|domain| required_tools(domain).iter().map(move |tool| (domain, *tool)))
        .filter(|(_, tool)| host.find_program(tool).is_none())
        .collect()
}

/// Refuse to start without root or without the tools the run needs
pub fn preflight(config: &HardeningConfig, host: &Host) -> Result<(), PreconditionError> {
    let euid = host.effective_uid();
    if euid != 0 {
        return Err(PreconditionError::NotPrivileged { euid });
    }

    let missing = missing_tools(config, host);
    for (domain, tool) in &missing {
        tracing::error!("{} needs '{}', which is not installed", domain, tool);
    }
    if let Some((domain, tool)) = missing.into_iter().next() {
        return Err(PreconditionError::MissingTool {
            tool: tool.to_string(),
            domain,
        });
    }

    tracing::debug!("Preflight passed for {:?}", config.enabled_domains());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ScriptedRunner;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn host_with(dir: &TempDir, tools: &[&str]) -> Host {
        let bin = dir.path().join("usr/bin");
        std::fs::create_dir_all(&bin).unwrap();
        for tool in tools {
            std::fs::write(bin.join(tool), "").unwrap();
            crate::host::set_permission_bits(&bin.join(tool), 0o755).unwrap();
        }
        Host::with_root(dir.path(), Arc::new(ScriptedRunner::succeeding()))
            .with_search_path(vec![PathBuf::from("/usr/bin")])
    }

    fn all_tools() -> Vec<&'static str> {
        ConfigurationDomain::ALL
            .iter()
            .flat_map(|d| required_tools(*d).iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_unprivileged_is_rejected_first() {
        let dir = TempDir::new().unwrap();
        let host = host_with(&dir, &[]).with_effective_uid(1000);
        let err = preflight(&HardeningConfig::default(), &host).unwrap_err();
        assert!(matches!(err, PreconditionError::NotPrivileged { euid: 1000 }));
    }

    #[test]
    fn test_missing_tool_names_domain() {
        let dir = TempDir::new().unwrap();
        let tools: Vec<&str> = all_tools().into_iter().filter(|t| *t != "fail2ban-client").collect();
        let host = host_with(&dir, &tools);
        match preflight(&HardeningConfig::default(), &host) {
            Err(PreconditionError::MissingTool { tool, domain }) => {
                assert_eq!(tool, "fail2ban-client");
                assert_eq!(domain, ConfigurationDomain::IntrusionJail);
            }
            other => panic!("expected MissingTool, got {:?}", other),
        }
    }

    #[test]
    fn test_disabled_domain_tools_not_required() {
        let dir = TempDir::new().unwrap();
        let tools: Vec<&str> = all_tools().into_iter().filter(|t| *t != "fail2ban-client").collect();
        let host = host_with(&dir, &tools);
        let mut config = HardeningConfig::default();
        config.jail.enabled = false;
        preflight(&config, &host).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_tool_is_missing() {
        let dir = TempDir::new().unwrap();
        let host = host_with(&dir, &all_tools());
        crate::host::set_permission_bits(&dir.path().join("usr/bin/sshd"), 0o644).unwrap();
        match preflight(&HardeningConfig::default(), &host) {
            Err(PreconditionError::MissingTool { tool, domain }) => {
                assert_eq!(tool, "sshd");
                assert_eq!(domain, ConfigurationDomain::SshPolicy);
            }
            other => panic!("expected MissingTool, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_tools_lists_every_gap() {
        let dir = TempDir::new().unwrap();
        let host = host_with(&dir, &["sshd", "systemctl", "ss"]);
        let mut config = HardeningConfig::default();
        config.jail.enabled = false;
        config.privileged_group.enabled = false;
        assert_eq!(
            missing_tools(&config, &host),
            vec![
                (ConfigurationDomain::FirewallExposure, "firewall-cmd"),
                (ConfigurationDomain::FirewallExposure, "firewall-offline-cmd"),
            ]
        );
    }
}
