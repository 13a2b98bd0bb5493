//! Explicit option overrides layered on top of the config file
//!
//! Overrides come from `--set section.key=value` flags and from
//! `HOSTGUARD_<SECTION>__<KEY>` variables. The binary collects both once
//! at startup; nothing in the core reads the environment itself.

use std::str::FromStr;

use crate::error::ConfigError;

/// Prefix for environment-provided overrides
pub const ENV_PREFIX: &str = "HOSTGUARD_";

/// One `section.key = value` assignment
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub key: String,
    pub value: toml::Value,
}

impl Override {
    pub fn new(key: impl Into<String>, raw: &str) -> Self {
        Self {
            key: key.into(),
            value: parse_value(raw),
        }
    }
}

impl FromStr for Override {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, raw) = s.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!("override '{}' must be written key=value", s))
        })?;
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(ConfigError::Invalid(format!("override '{}' has an empty key", s)));
        }
        Ok(Override::new(key, raw.trim()))
    }
}

/// Interpret a raw override value.
///
/// TOML literals (`2222`, `true`, `["a", "b"]`, `"quoted"`) keep their type,
/// an unbracketed comma list becomes an array, anything else is a string.
pub fn parse_value(raw: &str) -> toml::Value {
    let raw = raw.trim();
    if let Some(value) = parse_literal(raw) {
        return value;
    }
    if raw.contains(',') {
        let items = raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse_literal(item).unwrap_or_else(|| toml::Value::String(item.to_string())))
            .collect();
        return toml::Value::Array(items);
    }
    toml::Value::String(raw.to_string())
}

fn parse_literal(raw: &str) -> Option<toml::Value> {
    let doc = format!("v = {}", raw);
    let mut table: toml::Table = toml::from_str(&doc).ok()?;
    table.remove("v")
}

/// Collect overrides from `(name, value)` pairs such as `std::env::vars()`.
///
/// `HOSTGUARD_SSH__PORT=2222` becomes `ssh.port = 2222`; names without a
/// `__` section separator are not options and are skipped.
pub fn from_env_pairs<I>(vars: I) -> Vec<Override>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut overrides: Vec<Override> = vars
        .into_iter()
        .filter_map(|(name, raw)| {
            let rest = name.strip_prefix(ENV_PREFIX)?;
            let (section, key) = rest.split_once("__")?;
            if section.is_empty() || key.is_empty() {
                return None;
            }
            let key = format!("{}.{}", section.to_ascii_lowercase(), key.to_ascii_lowercase());
            Some(Override::new(key, &raw))
        })
        .collect();
    // environment iteration order is unspecified
    overrides.sort_by(|a, b| a.key.cmp(&b.key));
    overrides
}

/// Apply overrides in order onto a parsed config table
pub fn apply(table: &mut toml::Table, overrides: &[Override]) -> Result<(), ConfigError> {
    for ov in overrides {
        let parts: Vec<&str> = ov.key.split('.').collect();
        let (last, parents) = parts
            .split_last()
            .ok_or_else(|| ConfigError::UnknownKey(ov.key.clone()))?;

        let mut current = &mut *table;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            current = match entry {
                toml::Value::Table(t) => t,
                _ => return Err(ConfigError::UnknownKey(ov.key.clone())),
            };
        }
        tracing::debug!("override {} = {}", ov.key, ov.value);
        current.insert(last.to_string(), ov.value.clone());
    }
    Ok(())
}
