//! Human and machine readable renderings of plans, run reports and state.

use std::fmt::Write as _;

use serde_json::json;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use termtree::Tree;

use crate::executor::{OutcomeStatus, RunReport};
use crate::graph::ResourceGraph;
use crate::planner::{Action, Plan, PlanEntry};
use crate::render::Rendered;
use crate::state::StateRecord;

const UNKNOWN: &str = "(known after apply)";

fn show(value: &Rendered) -> String {
    match value {
        Rendered::Known(value) => value.to_string(),
        Rendered::Unknown => UNKNOWN.to_string(),
    }
}

fn heading(entry: &PlanEntry) -> String {
    let mut line = format!("  {} {}", entry.action.symbol(), entry.id);
    if let Some(old) = &entry.moved_from {
        let _ = write!(line, " (moved from {})", old);
    }
    if entry.action == Action::Update
        && let Some(provider_id) = entry.provider_id()
    {
        let _ = write!(line, " [{}]", provider_id);
    }
    line
}

/// The plan as a reviewer reads it, ending with a totals line.
pub fn plan_text(plan: &Plan) -> String {
    let mut out = String::new();

    for entry in plan.entries() {
        let _ = writeln!(out, "{}", heading(entry));
        match entry.action {
            Action::Create => {
                for (name, value) in &entry.rendered {
                    let _ = writeln!(out, "      {}: {}", name, show(value));
                }
            }
            Action::Update => {
                for change in &entry.changes {
                    let before = change
                        .before
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "null".to_string());
                    let after = change
                        .after
                        .as_ref()
                        .map(show)
                        .unwrap_or_else(|| "null".to_string());
                    let _ = writeln!(out, "      {}: {} -> {}", change.name, before, after);
                }
            }
            Action::Delete | Action::NoOp => {}
        }
    }

    let summary = plan.summary();
    if !plan.entries().is_empty() {
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "Plan: {} to create, {} to update, {} to delete, {} unchanged.",
        summary.create, summary.update, summary.delete, summary.unchanged
    );
    out
}

pub fn plan_json(plan: &Plan) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = plan
        .entries()
        .iter()
        .map(|entry| {
            let attributes: serde_json::Map<String, serde_json::Value> = entry
                .rendered
                .iter()
                .map(|(name, value)| {
                    let value = match value {
                        Rendered::Known(value) => json!({ "known": true, "value": value }),
                        Rendered::Unknown => json!({ "known": false }),
                    };
                    (name.clone(), value)
                })
                .collect();
            let changes: Vec<serde_json::Value> = entry
                .changes
                .iter()
                .map(|change| {
                    json!({
                        "attribute": change.name,
                        "before": change.before,
                        "after": change.after.as_ref().map(|r| match r {
                            Rendered::Known(value) => value.clone(),
                            Rendered::Unknown => json!(UNKNOWN),
                        }),
                    })
                })
                .collect();
            json!({
                "resource": entry.id.to_string(),
                "action": entry.action,
                "provider_id": entry.provider_id(),
                "moved_from": entry.moved_from.as_ref().map(ToString::to_string),
                "attributes": attributes,
                "changes": changes,
                "wait_for": entry.wait_for.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
        })
        .collect();

    json!({
        "summary": plan.summary(),
        "entries": entries,
    })
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    elapsed: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

pub fn report_table(report: &RunReport) -> String {
    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .filter(|o| o.action.is_change() || o.status != OutcomeStatus::Unchanged)
        .map(|o| OutcomeRow {
            resource: o.id.to_string(),
            action: o.action.to_string(),
            result: o.status.label().to_string(),
            attempts: o.attempts,
            elapsed: format!("{:.1}s", o.elapsed.as_secs_f64()),
            detail: match &o.status {
                OutcomeStatus::Failed { error } => error.clone(),
                OutcomeStatus::Skipped { blocked_by } => format!("blocked by {}", blocked_by),
                _ => o.provider_id.clone().unwrap_or_default(),
            },
        })
        .collect();

    let summary = report.summary;
    let totals = format!(
        "Apply {}: {} applied, {} unchanged, {} failed, {} skipped, {} cancelled.",
        match report.status {
            crate::executor::RunStatus::Success => "complete",
            crate::executor::RunStatus::PartialFailure => "partially failed",
            crate::executor::RunStatus::Cancelled => "cancelled",
        },
        summary.applied,
        summary.unchanged,
        summary.failed,
        summary.skipped,
        summary.cancelled
    );

    if rows.is_empty() {
        return format!("{}\n", totals);
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    format!("{}\n{}\n", table, totals)
}

pub fn report_json(report: &RunReport) -> serde_json::Value {
    serde_json::to_value(report).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

pub fn graph_tree(graph: &ResourceGraph) -> String {
    let root = Tree::new(format!(
        "{} resources, {} edges",
        graph.len(),
        graph.edge_count()
    ))
    .with_leaves(graph.dependency_trees());
    root.to_string()
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Depends On")]
    dependencies: String,
}

pub fn state_table(records: &[StateRecord]) -> String {
    if records.is_empty() {
        return "No resources recorded.\n".to_string();
    }
    let rows = records.iter().map(|record| RecordRow {
        resource: record.id.to_string(),
        provider_id: record.provider_id.clone(),
        dependencies: record
            .dependencies
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    });
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    format!("{}\n", table)
}
