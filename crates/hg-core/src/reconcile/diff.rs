//! Field-level difference between actual and desired state

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Placeholder for a field the probe could not determine
const UNKNOWN: &str = "<unknown>";

/// One field whose live value differs from the desired value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    /// `None` when the probe could not determine the value
    pub actual: Option<String>,
    pub desired: String,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {}",
            self.field,
            self.actual.as_deref().unwrap_or(UNKNOWN),
            self.desired
        )
    }
}

/// The set of fields where desired and actual state disagree.
///
/// Built field by field; an actual value of `None` (unknown or absent)
/// always differs from the desired value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    changes: Vec<FieldChange>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare one scalar field
    pub fn field<T>(mut self, name: &str, actual: Option<&T>, desired: &T) -> Self
    where
        T: PartialEq + fmt::Display + ?Sized,
    {
        if actual != Some(desired) {
            self.changes.push(FieldChange {
                field: name.to_string(),
                actual: actual.map(ToString::to_string),
                desired: desired.to_string(),
            });
        }
        self
    }

    /// Compare one set-valued field
    pub fn set<T>(mut self, name: &str, actual: Option<&BTreeSet<T>>, desired: &BTreeSet<T>) -> Self
    where
        T: Ord + fmt::Display,
    {
        if actual != Some(desired) {
            self.changes.push(FieldChange {
                field: name.to_string(),
                actual: actual.map(|set| join(set.iter())),
                desired: join(desired.iter()),
            });
        }
        self
    }

    /// Compare one ordered list field
    pub fn list<T>(mut self, name: &str, actual: Option<&[T]>, desired: &[T]) -> Self
    where
        T: PartialEq + fmt::Display,
    {
        if actual != Some(desired) {
            self.changes.push(FieldChange {
                field: name.to_string(),
                actual: actual.map(|items| join(items.iter())),
                desired: join(desired.iter()),
            });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    /// Names of the differing fields, in comparison order
    pub fn fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changes.is_empty() {
            return f.write_str("no changes");
        }
        for (i, change) in self.changes.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", change)?;
        }
        Ok(())
    }
}

fn join<'a, T: fmt::Display + 'a>(items: impl Iterator<Item = &'a T>) -> String {
    let parts: Vec<String> = items.map(ToString::to_string).collect();
    if parts.is_empty() {
        "(none)".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_fields_produce_empty_diff() {
        let diff = Diff::new()
            .field("port", Some(&22u16), &22u16)
            .field("mode", Some("no"), "no");
        assert!(diff.is_empty());
        assert_eq!(diff.to_string(), "no changes");
    }

    #[test]
    fn test_unknown_actual_always_differs() {
        let diff = Diff::new().field::<bool>("password_authentication", None, &false);
        assert_eq!(diff.fields(), vec!["password_authentication"]);
        assert_eq!(diff.to_string(), "password_authentication: <unknown> -> false");
    }

    #[test]
    fn test_set_comparison_ignores_order() {
        let actual: BTreeSet<String> = ["ssh", "http"].iter().map(|s| s.to_string()).collect();
        let desired: BTreeSet<String> = ["http", "ssh"].iter().map(|s| s.to_string()).collect();
        assert!(Diff::new().set("services", Some(&actual), &desired).is_empty());

        let empty = BTreeSet::new();
        let diff = Diff::new().set("services", Some(&empty), &desired);
        assert_eq!(diff.changes()[0].actual.as_deref(), Some("(none)"));
        assert_eq!(diff.changes()[0].desired, "http, ssh");
    }

    #[test]
    fn test_list_comparison_is_ordered() {
        let actual = vec!["b".to_string(), "a".to_string()];
        let desired = vec!["a".to_string(), "b".to_string()];
        let diff = Diff::new().list("keys", Some(actual.as_slice()), &desired);
        assert_eq!(diff.len(), 1);
    }
}
