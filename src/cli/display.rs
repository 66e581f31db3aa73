//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::backend::ExecOutput;
use crate::fleet::{BatchReport, Collection, ReconcileAction, ReconcileError, ReconcileOutcome};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No records found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    output.push_str(&format_row(
        headers.iter().map(|h| h.to_uppercase()).collect(),
        &widths,
    ));
    for row in rows {
        output.push_str(&format_row(row, &widths));
    }
    output
}

fn format_row(cells: Vec<String>, widths: &[usize]) -> String {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push_str("   ");
        }
        match widths.get(i) {
            Some(width) => line.push_str(&format!("{:width$}", cell, width = width)),
            None => line.push_str(cell),
        }
    }
    line.truncate(line.trim_end().len());
    line.push('\n');
    line
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

fn format_expiry(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// ============================================================================
// Inventory display
// ============================================================================

/// Format records as a table, ordered by cluster then node number
pub fn format_record_list(records: &Collection) -> String {
    let headers = &[
        "CLUSTER", "NODE", "STATE", "ROLE", "PRIVATE IP", "PUBLIC IP", "ID", "EXPIRES",
    ];
    let rows: Vec<Vec<String>> = records
        .sorted()
        .iter()
        .map(|r| {
            vec![
                r.cluster_name().to_string(),
                r.node_no().map(|n| n.to_string()).unwrap_or_else(|| "-".to_string()),
                r.state.to_string(),
                or_dash(r.role.tag_value()),
                or_dash(r.network.private.as_deref()),
                or_dash(r.network.public.as_deref()),
                r.backend_id().to_string(),
                format_expiry(r.expires_at),
            ]
        })
        .collect();

    format_table(headers, rows)
}

// ============================================================================
// Batch display
// ============================================================================

/// One line per record: `ok` with an optional detail, or the error
pub fn format_batch<T, F>(report: &BatchReport<T>, detail: F) -> String
where
    F: Fn(&T) -> Option<String>,
{
    let rows: Vec<Vec<String>> = report
        .outcomes()
        .iter()
        .map(|outcome| {
            let status = match &outcome.result {
                Ok(value) => match detail(value) {
                    Some(d) => format!("ok ({})", d),
                    None => "ok".to_string(),
                },
                Err(e) => format!("FAILED: {}", e),
            };
            vec![outcome.record.label(), status]
        })
        .collect();

    format_table(&["NODE", "RESULT"], rows)
}

/// Per-record command output under a `=== <node> ===` header
pub fn format_exec_report(report: &BatchReport<ExecOutput>) -> String {
    let mut output = String::new();
    for outcome in report.outcomes() {
        output.push_str(&format!("=== {} ===\n", outcome.record.label()));
        match &outcome.result {
            Ok(out) => {
                output.push_str(&out.stdout);
                if !out.stdout.is_empty() && !out.stdout.ends_with('\n') {
                    output.push('\n');
                }
            }
            Err(e) => output.push_str(&format!("FAILED: {}\n", e)),
        }
    }
    output
}

/// Transfer results naming the local file of each record
pub fn format_transfer_report(report: &BatchReport<PathBuf>) -> String {
    format_batch(report, |path| Some(path.display().to_string()))
}

// ============================================================================
// Reconcile display
// ============================================================================

/// Action per cluster plus the created/destroyed node numbers
pub fn format_reconcile_outcomes(outcomes: &[ReconcileOutcome]) -> String {
    let mut output = String::new();
    for outcome in outcomes {
        let prefix = if outcome.dry_run { "[dry-run] " } else { "" };
        output.push_str(&format!("{}{}: {}\n", prefix, outcome.cluster, outcome.action));
        if let Some(line) = outcome.summary_line() {
            output.push_str(&line);
            output.push('\n');
        }
    }
    output
}

/// What a failed reconciliation changed before it stopped
///
/// Empty when nothing was applied.
pub fn format_reconcile_failure(error: &ReconcileError) -> String {
    match error {
        ReconcileError::Cluster {
            completed, source, ..
        } => {
            let mut output = format_reconcile_outcomes(completed);
            output.push_str(&format_reconcile_failure(source));
            output
        }
        ReconcileError::Partial {
            cluster,
            action,
            applied,
            ..
        } if !applied.is_empty() => {
            let label = match action {
                ReconcileAction::Shrink { .. } => "destroyed",
                _ => "created",
            };
            let mut nodes: Vec<_> = applied.iter().collect();
            nodes.sort_by_key(|r| r.node_no());
            let labels: Vec<String> = nodes.iter().map(|r| r.label()).collect();
            format!(
                "{}: {} (incomplete)\n{}: {}\n",
                cluster,
                action,
                label,
                labels.join(", ")
            )
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::record::{BackendType, LifecycleState, ResourceRecord, Role};

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["A"], vec![]), "No records found.\n");
    }

    #[test]
    fn test_format_table_aligns_columns() {
        let out = format_table(
            &["name", "state"],
            vec![
                vec!["mydc-1".to_string(), "running".to_string()],
                vec!["x".to_string(), "stopped".to_string()],
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "NAME     STATE");
        assert_eq!(lines[1], "mydc-1   running");
        assert_eq!(lines[2], "x        stopped");
    }

    #[test]
    fn test_record_list_sorted_by_node() {
        let records: Collection = vec![
            ResourceRecord::instance(BackendType::Memory, "mydc", 2, "i-2")
                .with_state(LifecycleState::Running)
                .with_role(Role::Server),
            ResourceRecord::instance(BackendType::Memory, "mydc", 1, "i-1")
                .with_state(LifecycleState::Stopped),
        ]
        .into_iter()
        .collect();

        let out = format_record_list(&records);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("i-1"));
        assert!(lines[2].contains("server"));
    }

    #[test]
    fn test_reconcile_failure_lists_applied_records() {
        use crate::backend::BackendError;
        use crate::fleet::reconcile::ApplyFailure;

        let completed = ReconcileOutcome {
            cluster: "a".to_string(),
            action: ReconcileAction::Create { count: 2 },
            dry_run: false,
            created: vec![1, 2],
            destroyed: vec![],
            affected: vec![],
        };
        let error = ReconcileError::Cluster {
            cluster: "b".to_string(),
            completed: vec![completed],
            source: Box::new(ReconcileError::Partial {
                cluster: "b".to_string(),
                action: ReconcileAction::Create { count: 2 },
                applied: vec![ResourceRecord::instance(BackendType::Memory, "b", 1, "i-9")],
                source: ApplyFailure::Provision(BackendError::CallFailed("quota".into())),
            }),
        };
        assert_eq!(
            format_reconcile_failure(&error),
            "a: create 2\ncreated-node-numbers:1,2\nb: create 2 (incomplete)\ncreated: b-1\n"
        );
        assert_eq!(
            format_reconcile_failure(&ReconcileError::InvalidDesiredCount(-1)),
            ""
        );
    }

    #[test]
    fn test_reconcile_outcome_lines() {
        let outcome = ReconcileOutcome {
            cluster: "mydc".to_string(),
            action: ReconcileAction::Grow { delta: 2 },
            dry_run: true,
            created: vec![4, 5],
            destroyed: vec![],
            affected: vec![],
        };
        assert_eq!(
            format_reconcile_outcomes(&[outcome]),
            "[dry-run] mydc: grow 2\ncreated-node-numbers:4,5\n"
        );
    }
}
