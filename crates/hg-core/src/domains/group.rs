//! Privileged group membership
//!
//! The sudoers rule for the group is a drop-in owned by hostguard; the
//! membership itself lives in the system group database and is changed
//! with `gpasswd`. Declared members are added; undeclared members are only
//! removed when the group is declared `exclusive`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{run_checked, MANAGED_HEADER};
use crate::config::HardeningConfig;
use crate::error::StepError;
use crate::host::is_missing_program;
use crate::reconcile::{Context, Diff, Domain};
use crate::types::ConfigurationDomain;

/// `groupadd` exit status for "group already exists"
const GROUPADD_EXISTS: i32 = 9;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupDesired {
    pub group: String,
    pub members: BTreeSet<String>,
    pub exclusive: bool,
    pub rule: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupActual {
    pub exists: Option<bool>,
    pub members: Option<BTreeSet<String>>,
    /// Rule lines of the drop-in; `None` when it does not exist
    pub rule: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrivilegedGroup;

impl PrivilegedGroup {
    /// Membership the group should end up with, given what is there now
    fn target_members(actual: &GroupActual, desired: &GroupDesired) -> BTreeSet<String> {
        let mut target = desired.members.clone();
        if !desired.exclusive {
            if let Some(current) = &actual.members {
                target.extend(current.iter().cloned());
            }
        }
        target
    }
}

/// Members listed in a `getent group` line (`sudo:x:27:alice,bob`)
pub fn parse_group_line(line: &str) -> Option<BTreeSet<String>> {
    let members = line.trim().splitn(4, ':').nth(3)?;
    Some(
        members
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Non-comment lines of a sudoers file
fn rule_lines(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Domain for PrivilegedGroup {
    type Desired = GroupDesired;
    type Actual = GroupActual;

    fn domain(&self) -> ConfigurationDomain {
        ConfigurationDomain::PrivilegedGroup
    }

    fn artifact(&self, config: &HardeningConfig) -> PathBuf {
        config.privileged_group.sudoers_path()
    }

    /// sudo refuses to load a group rule file that others can write to
    fn mode(&self) -> u32 {
        0o440
    }

    fn resolve(&self, config: &HardeningConfig) -> GroupDesired {
        let group = &config.privileged_group;
        let tag = if group.nopasswd { "NOPASSWD: " } else { "" };
        GroupDesired {
            group: group.group.clone(),
            members: group.members.iter().cloned().collect(),
            exclusive: group.exclusive,
            rule: format!("%{} ALL=(ALL:ALL) {}ALL", group.group, tag),
        }
    }

    async fn probe(&self, ctx: &Context) -> Result<GroupActual, StepError> {
        let group = &ctx.config.privileged_group;
        let sudoers = group.sudoers_path();
        let rule = ctx
            .host
            .read_string_optional(&sudoers)
            .map_err(|e| self.probe_error(format!("cannot read {}: {}", sudoers.display(), e)))?
            .map(|content| rule_lines(&content));

        let (exists, members) = match ctx.host.run("getent", &["group", group.group.as_str()]).await {
            Ok(output) if output.success() => {
                let members = parse_group_line(&output.stdout).ok_or_else(|| {
                    self.probe_error(format!("unexpected getent output '{}'", output.stdout.trim()))
                })?;
                (Some(true), Some(members))
            }
            // exit 2: no such group
            Ok(output) if output.status == Some(2) => (Some(false), Some(BTreeSet::new())),
            Ok(output) => {
                return Err(self.probe_error(format!("getent group failed: {}", output.detail())));
            }
            Err(e) if is_missing_program(&e) => (None, None),
            Err(e) => return Err(self.probe_error(format!("cannot run getent: {}", e))),
        };

        Ok(GroupActual {
            exists,
            members,
            rule,
        })
    }

    fn diff(&self, actual: &GroupActual, desired: &GroupDesired) -> Diff {
        Diff::new()
            .field("exists", actual.exists.as_ref(), &true)
            .set(
                "members",
                actual.members.as_ref(),
                &Self::target_members(actual, desired),
            )
            .field("rule", actual.rule.as_ref(), &desired.rule)
    }

    fn render(&self, desired: &GroupDesired) -> String {
        format!("{}{}\n", MANAGED_HEADER, desired.rule)
    }

    async fn validate(
        &self,
        ctx: &Context,
        staged: &Path,
        _rendered: &str,
        _desired: &GroupDesired,
    ) -> Result<(), String> {
        let staged = staged.to_string_lossy().into_owned();
        run_checked(&ctx.host, "visudo", &["-c", "-f", staged.as_str()]).await?;
        Ok(())
    }

    async fn activate(
        &self,
        ctx: &Context,
        desired: &GroupDesired,
        actual: &GroupActual,
    ) -> Result<(), String> {
        let group = desired.group.as_str();
        if actual.exists != Some(true) {
            match ctx.host.run("groupadd", &[group]).await {
                Ok(output) if output.success() || output.status == Some(GROUPADD_EXISTS) => {
                    tracing::info!("Created group {}", group);
                }
                Ok(output) => return Err(format!("groupadd {} failed: {}", group, output.detail())),
                Err(e) => return Err(format!("cannot run groupadd: {}", e)),
            }
        }

        let current = actual.members.clone().unwrap_or_default();
        for user in desired.members.difference(&current) {
            run_checked(&ctx.host, "gpasswd", &["-a", user.as_str(), group]).await?;
            tracing::info!("Added {} to {}", user, group);
        }
        if desired.exclusive {
            for user in current.difference(&desired.members) {
                run_checked(&ctx.host, "gpasswd", &["-d", user.as_str(), group]).await?;
                tracing::info!("Removed {} from {}", user, group);
            }
        }
        Ok(())
    }
}
