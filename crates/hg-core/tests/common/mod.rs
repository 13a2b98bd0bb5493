//! Simulated host for integration tests
//!
//! Every tool the reconcilers call is answered from a small in-memory
//! model whose live state is loaded from the files under the temp root
//! when the matching service reloads, the same way the real daemons do.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use hg_core::config::HardeningConfig;
use hg_core::domains::firewall::{parse_zone, ZoneExposure};
use hg_core::host::{set_permission_bits, CommandOutput, Host, Invocation, ScriptedRunner};
use hg_core::preflight::required_tools;
use hg_core::reconcile::Context;
use hg_core::types::ConfigurationDomain;
use tempfile::TempDir;

pub const SSH_DROP_IN: &str = "/etc/ssh/sshd_config.d/10-hostguard.conf";
pub const ZONE_FILE: &str = "/etc/firewalld/zones/public.xml";
pub const JAIL_FILE: &str = "/etc/fail2ban/jail.d/hostguard.local";
pub const SUDOERS_FILE: &str = "/etc/sudoers.d/hostguard-sudo";
pub const AUTHORIZED_KEYS: &str = "/home/rescue/.ssh/authorized_keys";

pub const ORIGINAL_DROP_IN: &str = "PermitRootLogin yes\nPasswordAuthentication yes\n";

pub const KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHhvc3RndWFyZC10ZXN0LWtleS1ub3QtcmVhbA ops@laptop";

const ORIGINAL_ZONE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<zone>
  <short>Public</short>
  <service name="ssh"/>
  <service name="dhcpv6-client"/>
  <service name="cockpit"/>
</zone>
"#;

/// sshd defaults as `sshd -T` prints them with an empty config
const SSHD_DEFAULTS: &[(&str, &str)] = &[
    ("port", "22"),
    ("permitrootlogin", "prohibit-password"),
    ("passwordauthentication", "yes"),
    ("pubkeyauthentication", "yes"),
    ("maxauthtries", "6"),
    ("logingracetime", "120"),
    ("x11forwarding", "no"),
];

const KNOWN_SSHD_KEYWORDS: &[&str] = &[
    "port",
    "permitrootlogin",
    "passwordauthentication",
    "pubkeyauthentication",
    "maxauthtries",
    "logingracetime",
    "x11forwarding",
    "allowgroups",
];

/// Knobs and live state of the simulated services
#[derive(Debug)]
pub struct SimState {
    root: PathBuf,
    /// Drop-in content sshd last loaded
    pub sshd_loaded: String,
    pub sshd_active: bool,
    /// `sshd -t` rejects everything
    pub sshd_rejects: bool,
    /// `systemctl reload` fails for every unit
    pub reload_fails: bool,
    /// `systemctl reload sshd` succeeds but sshd keeps its old settings
    pub sshd_ignores_reload: bool,
    /// `sshd -T` calls after a reload that still report the old settings
    pub sshd_reload_lag: usize,
    sshd_pending: Option<String>,
    pub firewall_running: bool,
    pub zone_loaded: ZoneExposure,
    /// Jail file content fail2ban last loaded; `None` while stopped
    pub jail_loaded: Option<String>,
    pub groups: BTreeMap<String, BTreeSet<String>>,
    pub users: BTreeSet<String>,
}

impl SimState {
    fn read(&self, absolute: &str) -> Option<String> {
        fs::read_to_string(self.local(absolute)).ok()
    }

    fn local(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }

    fn effective_sshd(&self) -> BTreeMap<String, Vec<String>> {
        let mut settings: BTreeMap<String, Vec<String>> = SSHD_DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
            .collect();
        let mut drop_in: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in self.sshd_loaded.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(char::is_whitespace) {
                drop_in
                    .entry(key.to_ascii_lowercase())
                    .or_default()
                    .push(value.trim().to_string());
            }
        }
        settings.extend(drop_in);
        settings
    }

    fn handle(&mut self, inv: &Invocation) -> io::Result<CommandOutput> {
        let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();
        match (inv.program.as_str(), args.as_slice()) {
            ("sshd", ["-T"]) => {
                if self.sshd_pending.is_some() {
                    if self.sshd_reload_lag == 0 {
                        self.sshd_loaded = self.sshd_pending.take().unwrap_or_default();
                    } else {
                        self.sshd_reload_lag -= 1;
                    }
                }
                let mut out = String::new();
                for (key, values) in self.effective_sshd() {
                    if key == "port" {
                        for port in values {
                            out.push_str(&format!("port {}\n", port));
                        }
                    } else {
                        out.push_str(&format!("{} {}\n", key, values.join(" ")));
                    }
                }
                Ok(CommandOutput::ok(out))
            }
            ("sshd", ["-t", "-f", path]) => {
                if self.sshd_rejects {
                    return Ok(CommandOutput::failed(
                        255,
                        format!("{} line 2: Bad configuration option: PermitRootLogn", path),
                    ));
                }
                let content = self.read(path).unwrap_or_default();
                for line in content.lines().map(str::trim) {
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let keyword = line.split_whitespace().next().unwrap_or_default();
                    if !KNOWN_SSHD_KEYWORDS.contains(&keyword.to_ascii_lowercase().as_str()) {
                        return Ok(CommandOutput::failed(
                            255,
                            format!("Bad configuration option: {}", keyword),
                        ));
                    }
                }
                Ok(CommandOutput::ok(""))
            }
            ("ss", ["-Hltnp"]) => {
                let mut out = String::new();
                if self.sshd_active {
                    for port in &self.effective_sshd()["port"] {
                        out.push_str(&format!(
                            "LISTEN 0      128          0.0.0.0:{}        0.0.0.0:*    users:((\"sshd\",pid=812,fd=3))\n",
                            port
                        ));
                    }
                }
                out.push_str(
                    "LISTEN 0      4096       127.0.0.53%lo:53          0.0.0.0:*    users:((\"systemd-resolve\",pid=501,fd=14))\n",
                );
                Ok(CommandOutput::ok(out))
            }
            ("systemctl", ["is-active", "--quiet", unit]) => {
                let active = match *unit {
                    "sshd" => self.sshd_active,
                    "firewalld" => self.firewall_running,
                    "fail2ban" => self.jail_loaded.is_some(),
                    _ => false,
                };
                Ok(if active {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(3, "")
                })
            }
            ("systemctl", ["reload", unit]) => {
                if self.reload_fails {
                    return Ok(CommandOutput::failed(
                        1,
                        format!("Job for {}.service failed because the control process exited with error code.", unit),
                    ));
                }
                if *unit == "sshd" && !self.sshd_ignores_reload {
                    let content = self.read(SSH_DROP_IN).unwrap_or_default();
                    if self.sshd_reload_lag > 0 {
                        self.sshd_pending = Some(content);
                    } else {
                        self.sshd_loaded = content;
                    }
                }
                Ok(CommandOutput::ok(""))
            }
            ("systemctl", ["restart", "fail2ban"]) | ("systemctl", ["enable", "--now", "fail2ban"]) => {
                self.jail_loaded = Some(self.read(JAIL_FILE).unwrap_or_default());
                Ok(CommandOutput::ok(""))
            }
            ("systemctl", ["enable", "--now", "firewalld"]) => {
                if !self.firewall_running {
                    self.firewall_running = true;
                    self.load_zone();
                }
                Ok(CommandOutput::ok(""))
            }
            ("systemctl", ["enable", "--now", "sshd"]) => {
                self.sshd_active = true;
                self.sshd_loaded = self.read(SSH_DROP_IN).unwrap_or_default();
                Ok(CommandOutput::ok(""))
            }
            ("firewall-cmd", ["--state"]) => Ok(if self.firewall_running {
                CommandOutput::ok("running\n")
            } else {
                CommandOutput::failed(252, "not running")
            }),
            ("firewall-cmd", ["--zone=public", "--list-services"]) => {
                Ok(CommandOutput::ok(join(&self.zone_loaded.services)))
            }
            ("firewall-cmd", ["--zone=public", "--list-ports"]) => {
                Ok(CommandOutput::ok(join(&self.zone_loaded.ports)))
            }
            ("firewall-offline-cmd", ["--get-services"]) => Ok(CommandOutput::ok(
                "cockpit dhcpv6-client http https ssh wireguard\n",
            )),
            ("firewall-cmd", ["--reload"]) => {
                self.load_zone();
                Ok(CommandOutput::ok("success\n"))
            }
            ("fail2ban-client", ["get", jail, key]) => {
                let Some(loaded) = &self.jail_loaded else {
                    return Ok(CommandOutput::failed(
                        255,
                        "Failed to access socket path: /var/run/fail2ban/fail2ban.sock",
                    ));
                };
                if !loaded.contains(&format!("[{}]", jail)) {
                    return Ok(CommandOutput::failed(
                        255,
                        format!("Sorry but the jail '{}' does not exist", jail),
                    ));
                }
                let value = loaded
                    .lines()
                    .filter_map(|l| l.split_once('='))
                    .find(|(k, _)| k.trim() == *key)
                    .map(|(_, v)| v.trim().to_string())
                    .unwrap_or_default();
                Ok(CommandOutput::ok(format!("{}\n", value)))
            }
            ("visudo", ["-c", "-f", path]) => {
                let content = self.read(path).unwrap_or_default();
                Ok(if content.contains("ALL=(ALL:ALL)") {
                    CommandOutput::ok(format!("{}: parsed OK\n", path))
                } else {
                    CommandOutput::failed(1, format!("{}: syntax error near line 2", path))
                })
            }
            ("getent", ["group", group]) => Ok(match self.groups.get(*group) {
                Some(members) => CommandOutput::ok(format!(
                    "{}:x:27:{}\n",
                    group,
                    members.iter().cloned().collect::<Vec<_>>().join(",")
                )),
                None => CommandOutput::failed(2, ""),
            }),
            ("getent", ["passwd", user]) => Ok(if self.users.contains(*user) {
                CommandOutput::ok(format!("{}:x:1001:1001::/home/{}:/bin/bash\n", user, user))
            } else {
                CommandOutput::failed(2, "")
            }),
            ("groupadd", [group]) => Ok(if self.groups.contains_key(*group) {
                CommandOutput::failed(9, format!("groupadd: group '{}' already exists", group))
            } else {
                self.groups.insert(group.to_string(), BTreeSet::new());
                CommandOutput::ok("")
            }),
            ("gpasswd", ["-a", user, group]) => {
                self.groups
                    .entry(group.to_string())
                    .or_default()
                    .insert(user.to_string());
                Ok(CommandOutput::ok(format!("Adding user {} to group {}\n", user, group)))
            }
            ("gpasswd", ["-d", user, group]) => {
                if let Some(members) = self.groups.get_mut(*group) {
                    members.remove(*user);
                }
                Ok(CommandOutput::ok(""))
            }
            ("useradd", [.., "-d", home, "-s", _shell, user]) => {
                fs::create_dir_all(self.local(home))?;
                self.users.insert(user.to_string());
                Ok(CommandOutput::ok(""))
            }
            ("chown", _) => Ok(CommandOutput::ok("")),
            ("ssh-keygen", ["-l", "-f", _]) => Ok(CommandOutput::ok(
                "256 SHA256:Zm9yIHRlc3RzIG9ubHkgbm90IGEgcmVhbCBrZXk ops@laptop (ED25519)\n",
            )),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not simulated", inv),
            )),
        }
    }

    fn load_zone(&mut self) {
        if let Some(xml) = self.read(ZONE_FILE) {
            if let Ok(zone) = parse_zone(&xml) {
                self.zone_loaded = zone;
            }
        }
    }
}

fn join(set: &BTreeSet<String>) -> String {
    let mut out = set.iter().cloned().collect::<Vec<_>>().join(" ");
    out.push('\n');
    out
}

/// A fresh host under a temp dir with all services installed and running
pub struct SimHost {
    pub dir: TempDir,
    pub runner: Arc<ScriptedRunner>,
    state: Arc<Mutex<SimState>>,
}

impl SimHost {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        let write = |absolute: &str, content: &str| {
            let path = root.join(absolute.trim_start_matches('/'));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        };
        write(SSH_DROP_IN, ORIGINAL_DROP_IN);
        write(ZONE_FILE, ORIGINAL_ZONE);
        for domain in ConfigurationDomain::ALL {
            for tool in required_tools(domain) {
                let stub = format!("/usr/sbin/{}", tool);
                write(&stub, "");
                set_permission_bits(&root.join(stub.trim_start_matches('/')), 0o755).unwrap();
            }
        }

        let state = Arc::new(Mutex::new(SimState {
            root,
            sshd_loaded: ORIGINAL_DROP_IN.to_string(),
            sshd_active: true,
            sshd_rejects: false,
            reload_fails: false,
            sshd_ignores_reload: false,
            sshd_reload_lag: 0,
            sshd_pending: None,
            firewall_running: true,
            zone_loaded: parse_zone(ORIGINAL_ZONE).unwrap(),
            jail_loaded: None,
            groups: BTreeMap::from([(
                "sudo".to_string(),
                BTreeSet::from(["ubuntu".to_string()]),
            )]),
            users: BTreeSet::from(["ubuntu".to_string(), "ops".to_string()]),
        }));

        let shared = state.clone();
        let runner = Arc::new(ScriptedRunner::new(move |inv| match shared.lock() {
            Ok(mut state) => state.handle(inv),
            Err(poisoned) => poisoned.into_inner().handle(inv),
        }));

        Self { dir, runner, state }
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn host(&self) -> Host {
        Host::with_root(self.dir.path(), self.runner.clone())
            .with_search_path(vec![PathBuf::from("/usr/sbin")])
    }

    pub fn context(&self, config: HardeningConfig) -> Context {
        Context::new(self.host(), Arc::new(config))
    }

    pub fn local(&self, absolute: &str) -> PathBuf {
        self.dir.path().join(absolute.trim_start_matches('/'))
    }

    pub fn read(&self, absolute: &str) -> Option<String> {
        fs::read_to_string(self.local(absolute)).ok()
    }

    /// Commands run so far whose command line starts with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.runner.count_matching(prefix)
    }

    /// Commands that change live state
    pub fn mutating_commands(&self) -> usize {
        [
            "systemctl reload",
            "systemctl restart",
            "systemctl enable",
            "firewall-cmd --reload",
            "gpasswd",
            "groupadd",
            "useradd",
            "chown",
        ]
        .iter()
        .map(|prefix| self.count(prefix))
        .sum()
    }

    /// Every file under the root with its bytes
    pub fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        collect(self.dir.path(), &mut files);
        files
    }
}

fn collect(dir: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(&path, files);
        } else {
            files.insert(path.clone(), fs::read(&path).unwrap());
        }
    }
}

/// The configuration the scenario tests harden towards
pub fn hardened_config() -> HardeningConfig {
    let mut config = HardeningConfig::default();
    config.ssh.port = 2222;
    config.firewall.services = vec!["http".into()];
    config.privileged_group.members = vec!["ops".into()];
    config.emergency.enabled = true;
    config.emergency.authorized_keys = vec![KEY.into()];
    config
}
