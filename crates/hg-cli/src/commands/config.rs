//! Config command implementations

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use hg_core::config::{self, overrides, HardeningConfig, Override};
use hg_core::error::HgError;

fn resolve_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path.cloned().unwrap_or_else(config::default_config_path)
}

fn read_table(path: &PathBuf) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
}

/// Print the config file location in effect
pub fn config_path(config_path: Option<&PathBuf>) -> Result<()> {
    println!("{}", resolve_path(config_path).display());
    Ok(())
}

/// Get a config value by key.
///
/// Keys not written in the file fall back to their built-in default.
pub fn config_get(config_path: Option<&PathBuf>, key: &str) -> Result<()> {
    let path = resolve_path(config_path);

    let effective = if path.exists() {
        let table = read_table(&path)?;
        let config: HardeningConfig = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        config
    } else {
        HardeningConfig::default()
    };

    let mut current = toml::Value::try_from(&effective)?;
    for part in key.split('.') {
        current = match current {
            toml::Value::Table(mut t) => match t.remove(part) {
                Some(v) => v,
                None => bail!("Key not found: {}", key),
            },
            _ => bail!("Key not found: {}", key),
        };
    }

    match &current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Integer(i) => println!("{}", i),
        toml::Value::Float(f) => println!("{}", f),
        toml::Value::Boolean(b) => println!("{}", b),
        toml::Value::Array(a) => {
            for item in a {
                match item {
                    toml::Value::String(s) => println!("{}", s),
                    other => println!("{}", other),
                }
            }
        }
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(&current)?),
        toml::Value::Datetime(d) => println!("{}", d),
    }

    Ok(())
}

/// Set a config value by key, refusing values the config would reject
pub fn config_set(config_path: Option<&PathBuf>, key: &str, value: &str) -> Result<()> {
    let path = resolve_path(config_path);

    if !path.exists() {
        print_info("Creating default configuration...");
        config_init(config_path, false)?;
    }

    let mut table = read_table(&path)?;
    overrides::apply(&mut table, &[Override::new(key, value)]).map_err(HgError::from)?;

    let updated: HardeningConfig = toml::Value::Table(table.clone())
        .try_into()
        .with_context(|| format!("Cannot set {} = {}", key, value))?;
    updated.validate().map_err(HgError::from)?;

    let new_content = toml::to_string_pretty(&table)?;
    std::fs::write(&path, new_content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Show current configuration
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = resolve_path(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Built-in defaults apply. Run 'hostguard config init' to write them out.");
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    println!();

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);

    Ok(())
}

/// Write the commented default configuration
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let config_file = resolve_path(config_path);
    let config_dir = config_file
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_dir);

    if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
        print_success(&format!("Created config directory: {:?}", config_dir));
    }

    if config_file.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", config_file));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    std::fs::write(&config_file, generate_default_config())
        .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

    print_success(&format!("Created configuration file: {:?}", config_file));
    print_info("Declare privileged_group.members and emergency keys before the first apply.");

    Ok(())
}

/// Generate default configuration content
fn generate_default_config() -> String {
    r#"# hostguard configuration
# Every option shown here is the built-in default.

[ssh]
port = 22
# yes, no, prohibit-password or forced-commands-only
permit_root_login = "no"
password_authentication = false
pubkey_authentication = true
max_auth_tries = 3
# seconds, or a string such as "1m"
login_grace_time = 30
x11_forwarding = false
# empty means any group may log in
allow_groups = []
service = "sshd"
drop_in_path = "/etc/ssh/sshd_config.d/10-hostguard.conf"

[firewall]
enabled = true
zone = "public"
# named services left open; everything else is closed
services = []
# extra ports as "<port>/<protocol>"; the SSH port is always open
ports = []
service = "firewalld"
zone_dir = "/etc/firewalld/zones"

[jail]
enabled = true
name = "sshd"
max_retry = 5
find_time = "10m"
ban_time = "1h"
ignore_ip = ["127.0.0.1/8", "::1"]
service = "fail2ban"
path = "/etc/fail2ban/jail.d/hostguard.local"

[privileged_group]
enabled = true
group = "sudo"
members = []
nopasswd = false
# remove members that are not listed above
exclusive = false
sudoers_dir = "/etc/sudoers.d"

[emergency]
enabled = false
user = "rescue"
# one OpenSSH public key per entry
authorized_keys = []
shell = "/bin/bash"

[pipeline]
# confirm checkpoints automatically when no terminal is attached
non_interactive_confirm = false
state_dir = "/var/lib/hostguard"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_template_matches_builtin_defaults() {
        let config: HardeningConfig = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config, HardeningConfig::default());
    }

    #[test]
    fn test_set_rejects_invalid_value_without_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        config_init(Some(&path), false).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(config_set(Some(&path), "ssh.port", "0").is_err());
        assert!(config_set(Some(&path), "ssh.colour", "blue").is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

        config_set(Some(&path), "ssh.port", "2222").unwrap();
        let config: HardeningConfig = config::load_config(&path).unwrap();
        assert_eq!(config.ssh.port, 2222);
    }

    #[test]
    fn test_init_does_not_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ssh]\nport = 2200\n").unwrap();

        config_init(Some(&path), false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[ssh]\nport = 2200\n");

        config_init(Some(&path), true).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("port = 22\n"));
    }
}
