//! Output formatting utilities for the CLI
//!
//! Tables for run summaries, plans and backups, plus colored one-line
//! status messages.

use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use hg_core::backup::BackupEntry;
use hg_core::pipeline::{PipelineRun, PipelineState, StepRecord};
use hg_core::reconcile::Plan;

/// Format a finished run as a table of executed steps followed by the
/// outcome line and, on failure, the remediation text
pub fn format_run(run: &PipelineRun) -> String {
    #[derive(Tabled)]
    struct StepRow {
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "STEP")]
        step: String,
        #[tabled(rename = "RESULT")]
        result: String,
        #[tabled(rename = "DETAIL")]
        detail: String,
    }

    let rows: Vec<StepRow> = run
        .records()
        .iter()
        .map(|record| match record {
            StepRecord::Reconcile { index, result } => StepRow {
                index: index + 1,
                step: result.domain.to_string(),
                result: match (&result.error, result.changed) {
                    (Some(error), _) => error.kind().to_string(),
                    (None, true) => "changed".to_string(),
                    (None, false) => "unchanged".to_string(),
                },
                detail: if result.diff.is_empty() {
                    "-".to_string()
                } else {
                    result.diff.fields().join(", ")
                },
            },
            StepRecord::Gate {
                index,
                confirmation,
                ..
            } => StepRow {
                index: index + 1,
                step: "checkpoint".to_string(),
                result: if confirmation.granted() {
                    "confirmed".to_string()
                } else {
                    "refused".to_string()
                },
                detail: confirmation.reason(),
            },
        })
        .collect();

    let mut output = String::new();
    if !rows.is_empty() {
        output.push_str(
            &Table::new(rows)
                .with(Style::rounded())
                .with(Width::wrap(100))
                .to_string(),
        );
        output.push('\n');
    }

    let skipped = run.steps().len().saturating_sub(run.records().len());
    if skipped > 0 {
        output.push_str(&format!("{} step(s) not run\n", skipped));
    }
    output.push_str(&format!("Run {} on {}: {}\n", run.id(), run.host(), run.state()));
    if let PipelineState::Failed { remediation, .. } = run.state() {
        output.push_str(remediation);
        output.push('\n');
    }
    output
}

/// Format dry-run plans, one row per domain and one line per changed field
pub fn format_plans(plans: &[Plan]) -> String {
    if plans.is_empty() {
        return "No domains enabled".to_string();
    }

    #[derive(Tabled)]
    struct PlanRow {
        #[tabled(rename = "DOMAIN")]
        domain: String,
        #[tabled(rename = "ARTIFACT")]
        artifact: String,
        #[tabled(rename = "CHANGES")]
        changes: usize,
        #[tabled(rename = "BACKUP")]
        backup: &'static str,
    }

    let rows: Vec<PlanRow> = plans
        .iter()
        .map(|p| PlanRow {
            domain: p.domain.to_string(),
            artifact: p.artifact.display().to_string(),
            changes: p.diff.len(),
            backup: if p.backup_recorded { "recorded" } else { "on first change" },
        })
        .collect();

    let mut output = Table::new(rows).with(Style::rounded()).to_string();
    output.push('\n');
    for plan in plans.iter().filter(|p| !p.diff.is_empty()) {
        output.push_str(&format!("\n{}:\n", plan.domain));
        for change in plan.diff.changes() {
            output.push_str(&format!("  {}\n", change));
        }
    }
    output
}

/// Format recorded backups with their checksum verification result
pub fn format_backups(entries: &[(BackupEntry, Result<(), String>)]) -> String {
    if entries.is_empty() {
        return "No backups recorded".to_string();
    }

    #[derive(Tabled)]
    struct BackupRow {
        #[tabled(rename = "ARTIFACT")]
        artifact: String,
        #[tabled(rename = "ORIGINAL")]
        original: String,
        #[tabled(rename = "SHA256")]
        sha256: String,
        #[tabled(rename = "CREATED")]
        created: String,
        #[tabled(rename = "CHECK")]
        check: String,
    }

    let rows: Vec<BackupRow> = entries
        .iter()
        .map(|(entry, check)| BackupRow {
            artifact: entry.artifact.display().to_string(),
            original: if entry.existed {
                format!("{} bytes", entry.size)
            } else {
                "absent".to_string()
            },
            sha256: entry
                .sha256
                .as_deref()
                .map(|s| truncate(s, 16))
                .unwrap_or_else(|| "-".to_string()),
            created: format_age(hg_core::types::unix_now().saturating_sub(entry.created_at)),
            check: match check {
                Ok(()) => "ok".to_string(),
                Err(e) => e.clone(),
            },
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(120))
        .to_string()
}

/// Format elapsed seconds as a coarse age
fn format_age(secs: u64) -> String {
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix, to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow, to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
