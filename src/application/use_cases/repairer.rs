//! Turns validation findings into a corrective directive for the next generation call.

use crate::domain::query::{DebugEntry, Finding, FindingKind};
use std::fmt::Write;

/// How many earlier repair attempts are summarised in a directive.
const HISTORY_WINDOW: usize = 3;

/// Builds a self-contained directive from the failing `sql`, its blocking findings and the
/// most recent attempts in `history`. Warnings never appear in it.
pub fn build_repair_directive(sql: &str, findings: &[Finding], history: &[DebugEntry]) -> String {
    let mut directive = String::new();

    let _ = writeln!(directive, "The previous SQL failed validation:");
    let _ = writeln!(directive, "```sql\n{}\n```", sql.trim());
    let _ = writeln!(directive, "Fix these problems:");

    for (i, finding) in findings.iter().filter(|f| f.is_blocking()).enumerate() {
        let _ = writeln!(directive, "{}. {}", i + 1, describe(finding));
    }

    let recent = &history[history.len().saturating_sub(HISTORY_WINDOW)..];
    if !recent.is_empty() {
        let _ = writeln!(directive, "\nEarlier attempts that also failed (do not repeat them):");
        for entry in recent {
            let problems: Vec<&str> = entry
                .findings
                .iter()
                .filter(|f| f.is_blocking())
                .map(|f| f.message.as_str())
                .collect();
            let mut outcome = problems.join("; ");
            if entry.repaired_sql.is_none() {
                if !outcome.is_empty() {
                    outcome.push_str("; ");
                }
                outcome.push_str("no replacement produced");
            }
            let _ = writeln!(
                directive,
                "- Attempt {}: {} -> {}",
                entry.iteration,
                entry.sql.trim(),
                outcome
            );
        }
    }

    directive.trim_end().to_string()
}

fn describe(finding: &Finding) -> String {
    match (&finding.kind, finding.location_hint.as_deref()) {
        (FindingKind::UnknownTable | FindingKind::UnknownColumn, Some(hint)) => {
            format!("{} (did you mean `{}`?)", finding.message, hint)
        }
        (_, Some(hint)) => format!("{} ({}: {})", finding.message, finding.kind, hint),
        (_, None) => finding.message.clone(),
    }
}
