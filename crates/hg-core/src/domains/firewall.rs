//! Firewall zone exposure
//!
//! The zone definition is rendered from the declared allow-list. Anything
//! not on the list (services or ports added by hand or by packages) is
//! removed. The SSH port is always on the list.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::run_checked;
use crate::config::{HardeningConfig, PortSpec};
use crate::error::StepError;
use crate::host::is_missing_program;
use crate::reconcile::{Context, Diff, Domain};
use crate::types::ConfigurationDomain;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallDesired {
    pub zone: String,
    pub services: BTreeSet<String>,
    /// `port/protocol` strings, as firewall-cmd lists them
    pub ports: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirewallActual {
    /// `None` when firewalld is not installed
    pub running: Option<bool>,
    pub services: Option<BTreeSet<String>>,
    pub ports: Option<BTreeSet<String>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FirewallExposure;

impl FirewallExposure {
    async fn list(&self, ctx: &Context, zone: &str, what: &str) -> Result<BTreeSet<String>, StepError> {
        let zone_arg = format!("--zone={}", zone);
        let output = ctx
            .host
            .run("firewall-cmd", &[zone_arg.as_str(), what])
            .await
            .map_err(|e| self.probe_error(format!("cannot run firewall-cmd: {}", e)))?;
        if output.success() {
            return Ok(output.stdout.split_whitespace().map(str::to_string).collect());
        }
        if output.detail().contains("INVALID_ZONE") {
            // the zone comes into existence when we write it
            return Ok(BTreeSet::new());
        }
        Err(self.probe_error(format!("firewall-cmd {} failed: {}", what, output.detail())))
    }
}

#[async_trait]
impl Domain for FirewallExposure {
    type Desired = FirewallDesired;
    type Actual = FirewallActual;

    fn domain(&self) -> ConfigurationDomain {
        ConfigurationDomain::FirewallExposure
    }

    fn artifact(&self, config: &HardeningConfig) -> PathBuf {
        config.firewall.zone_path()
    }

    fn resolve(&self, config: &HardeningConfig) -> FirewallDesired {
        let mut ports: BTreeSet<String> =
            config.firewall.ports.iter().map(ToString::to_string).collect();
        ports.insert(PortSpec::tcp(config.ssh.port).to_string());
        FirewallDesired {
            zone: config.firewall.zone.clone(),
            services: config.firewall.services.iter().cloned().collect(),
            ports,
        }
    }

    async fn probe(&self, ctx: &Context) -> Result<FirewallActual, StepError> {
        let state = match ctx.host.run("firewall-cmd", &["--state"]).await {
            Ok(output) => output,
            Err(e) if is_missing_program(&e) => {
                tracing::warn!("firewalld not installed; treating zone as absent");
                return Ok(FirewallActual::default());
            }
            Err(e) => return Err(self.probe_error(format!("cannot run firewall-cmd: {}", e))),
        };

        if !state.success() {
            // installed but not running: the runtime lists are unavailable
            return Ok(FirewallActual {
                running: Some(false),
                ..FirewallActual::default()
            });
        }

        let zone = &ctx.config.firewall.zone;
        Ok(FirewallActual {
            running: Some(true),
            services: Some(self.list(ctx, zone, "--list-services").await?),
            ports: Some(self.list(ctx, zone, "--list-ports").await?),
        })
    }

    fn diff(&self, actual: &FirewallActual, desired: &FirewallDesired) -> Diff {
        Diff::new()
            .field("running", actual.running.as_ref(), &true)
            .set("services", actual.services.as_ref(), &desired.services)
            .set("ports", actual.ports.as_ref(), &desired.ports)
    }

    fn render(&self, desired: &FirewallDesired) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str("<!-- Managed by hostguard. Local edits are overwritten. -->\n");
        out.push_str("<zone>\n");
        out.push_str(&format!("  <short>{}</short>\n", desired.zone));
        out.push_str(
            "  <description>Only the declared services and ports are exposed.</description>\n",
        );
        for service in &desired.services {
            out.push_str(&format!("  <service name=\"{}\"/>\n", service));
        }
        for port in &desired.ports {
            if let Some((number, protocol)) = port.split_once('/') {
                out.push_str(&format!(
                    "  <port protocol=\"{}\" port=\"{}\"/>\n",
                    protocol, number
                ));
            }
        }
        out.push_str("</zone>\n");
        out
    }

    /// Dry run: re-read the rendered zone the way firewalld would and
    /// check it exposes exactly the allow-list
    async fn validate(
        &self,
        ctx: &Context,
        _staged: &Path,
        rendered: &str,
        desired: &FirewallDesired,
    ) -> Result<(), String> {
        let zone = parse_zone(rendered)?;
        if zone.services != desired.services {
            return Err(format!(
                "zone would expose services {:?}, expected {:?}",
                zone.services, desired.services
            ));
        }
        if zone.ports != desired.ports {
            return Err(format!(
                "zone would expose ports {:?}, expected {:?}",
                zone.ports, desired.ports
            ));
        }
        for port in &zone.ports {
            port.parse::<PortSpec>()?;
        }

        // firewalld refuses to load a zone naming a service it does not know;
        // the offline tool answers whether or not the daemon is running
        let output = run_checked(&ctx.host, "firewall-offline-cmd", &["--get-services"]).await?;
        let known: BTreeSet<&str> = output.stdout.split_whitespace().collect();
        if let Some(unknown) = zone.services.iter().find(|s| !known.contains(s.as_str())) {
            return Err(format!("firewalld does not define a service named '{}'", unknown));
        }
        Ok(())
    }

    async fn activate(
        &self,
        ctx: &Context,
        _desired: &FirewallDesired,
        _actual: &FirewallActual,
    ) -> Result<(), String> {
        let unit = &ctx.config.firewall.service;
        ctx.services
            .enable_now(&ctx.host, unit)
            .await
            .map_err(|e| e.to_string())?;
        run_checked(&ctx.host, "firewall-cmd", &["--reload"]).await?;
        Ok(())
    }
}

/// Services and ports declared by a zone document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneExposure {
    pub services: BTreeSet<String>,
    pub ports: BTreeSet<String>,
}

/// Read the `<service>` and `<port>` elements of a firewalld zone file
pub fn parse_zone(xml: &str) -> Result<ZoneExposure, String> {
    if !xml.contains("<zone") || !xml.contains("</zone>") {
        return Err("document has no <zone> element".to_string());
    }

    let mut zone = ZoneExposure::default();
    let mut rest = xml;
    while let Some(start) = rest.find('<') {
        let after = &rest[start + 1..];
        let end = after
            .find('>')
            .ok_or_else(|| "unterminated element".to_string())?;
        let tag = after[..end].trim_end_matches('/').trim();
        rest = &after[end + 1..];

        let mut parts = tag.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        if name != "service" && name != "port" {
            continue;
        }
        let attrs = parse_attributes(parts.next().unwrap_or_default())?;
        let attr = |key: &str| -> Result<&str, String> {
            attrs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
                .ok_or_else(|| format!("<{}> is missing the '{}' attribute", name, key))
        };

        match name {
            "service" => {
                zone.services.insert(attr("name")?.to_string());
            }
            "port" => {
                zone.ports
                    .insert(format!("{}/{}", attr("port")?, attr("protocol")?));
            }
            _ => {}
        }
    }
    Ok(zone)
}

fn parse_attributes(mut input: &str) -> Result<Vec<(&str, &str)>, String> {
    let mut attrs = Vec::new();
    loop {
        input = input.trim_start();
        if input.is_empty() {
            return Ok(attrs);
        }
        let (key, rest) = input
            .split_once('=')
            .ok_or_else(|| format!("malformed attribute list '{}'", input))?;
        let rest = rest.trim_start();
        let quote = rest
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| format!("attribute '{}' is not quoted", key.trim()))?;
        let value_and_rest = &rest[1..];
        let close = value_and_rest
            .find(quote)
            .ok_or_else(|| format!("attribute '{}' is not terminated", key.trim()))?;
        attrs.push((key.trim(), &value_and_rest[..close]));
        input = &value_and_rest[close + 1..];
    }
}
