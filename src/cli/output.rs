//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ConfigHasher;
use crate::graph::ResourceGraph;
use crate::planner::{OperationKind, Plan, PlannedOperation};
use crate::refresh::{DriftReport, DriftStatus};
use crate::report::{ApplyReport, OperationStatus};
use crate::state::StateSnapshot;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Wave")]
    wave: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "ID")]
    id: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. {} resources up to date.\n",
                "✓".green(),
                plan.operations.len()
            );
        }

        let mut output = String::new();
        output.push_str("\nExecution Plan\n");
        let _ = write!(
            output,
            "   Config hash: {}   State serial: {}\n\n",
            ConfigHasher::short_hash(&plan.config_hash),
            plan.state_serial
        );

        let rows: Vec<PlanRow> = plan
            .actionable()
            .map(|op| PlanRow {
                wave: op.wave.to_string(),
                action: Self::format_kind(op.kind),
                resource: format!("{}.{}", op.resource_type, op.resource),
                reason: Self::truncate(&op.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for op in plan.actionable().filter(|op| op.replaced_by.is_none()) {
                Self::write_changes(&mut output, op);
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy.\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.destroy.to_string().red()
        );
        let stale = plan.stale_records().count();
        if stale > 0 {
            let _ = writeln!(output, "{stale} unchanged resource(s) with outdated dependencies in state.");
        }

        if !plan.passes_guardrails {
            let _ = write!(output, "\n{} Guardrail violations:\n", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    fn write_changes(output: &mut String, op: &PlannedOperation) {
        let _ = writeln!(
            output,
            "\n  {} {}.{}",
            op.kind.symbol(),
            op.resource_type,
            op.resource
        );
        for change in &op.changes {
            let old = change.old.as_ref().map_or_else(String::new, ToString::to_string);
            let new = change.new.as_ref().map_or_else(String::new, ToString::to_string);
            let line = match (&change.old, &change.new) {
                (None, Some(_)) => format!("      + {} = {new}", change.attribute).green().to_string(),
                (Some(_), None) => format!("      - {} = {old}", change.attribute).red().to_string(),
                _ => format!("      ~ {}: {old} -> {new}", change.attribute).yellow().to_string(),
            };
            output.push_str(&line);
            if change.requires_replacement {
                let _ = write!(output, " {}", "# forces replacement".magenta());
            }
            output.push('\n');
        }
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ApplyReport) -> String {
        let mut output = String::new();

        let rows: Vec<ResultRow> = report
            .operations
            .iter()
            .filter(|r| r.status != OperationStatus::Unchanged)
            .map(|r| ResultRow {
                resource: format!("{}.{}", r.resource_type, r.resource),
                action: r.kind.to_string(),
                status: Self::format_status(r.status),
                attempts: r.attempts,
                time: format!("{}ms", r.duration_ms),
                id: r.provider_id.clone().unwrap_or_default(),
            })
            .collect();
        if !rows.is_empty() {
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let headline = if report.is_success() {
            format!("{} Apply complete", "✓".green())
        } else if report.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply finished with errors", "✗".red())
        };
        let _ = write!(
            output,
            "\n{headline}: {} succeeded, {} failed, {} skipped, {} cancelled, {} unchanged ({}ms)\n",
            report.count(OperationStatus::Succeeded),
            report.count(OperationStatus::Failed),
            report.count(OperationStatus::Skipped),
            report.count(OperationStatus::Cancelled),
            report.count(OperationStatus::Unchanged),
            report.duration_ms
        );

        for branch in report.failed_branches() {
            let _ = write!(
                output,
                "\n{} {}: {}\n",
                "Error".red().bold(),
                branch.root.resource,
                branch.root.error
            );
            if !branch.skipped.is_empty() {
                let _ = writeln!(output, "   skipped: {}", branch.skipped.join(", "));
            }
        }

        output
    }

    /// Formats the full state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                for record in state.resources.values() {
                    let _ = writeln!(output, "\n   {} ({})", record.address().bold(), record.provider_id);
                    for (key, value) in &record.attributes {
                        let _ = writeln!(output, "     {key} = {value}");
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the recorded resources as a list.
    #[must_use]
    pub fn format_state_list(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&state.names()).unwrap_or_default()
            }
            OutputFormat::Text => {
                if state.is_empty() {
                    return String::from("No resources in state.\n");
                }
                let rows: Vec<RecordRow> = state
                    .resources
                    .values()
                    .map(|r| RecordRow {
                        resource: r.address(),
                        id: r.provider_id.clone(),
                        dependencies: r.dependencies.join(", "),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats the dependency graph.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph, dot: bool) -> String {
        if dot {
            return graph.to_dot();
        }
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(graph).unwrap_or_default(),
            OutputFormat::Text => {
                let nodes = graph.nodes();
                let mut output = String::new();
                for (level, members) in graph.levels().iter().enumerate() {
                    let _ = writeln!(output, "Level {}:", level + 1);
                    for &i in members {
                        let node = &nodes[i];
                        let deps: Vec<&str> = node
                            .dependencies
                            .iter()
                            .map(|&d| nodes[d].name.as_str())
                            .collect();
                        if deps.is_empty() {
                            let _ = writeln!(output, "   {}.{}", node.resource_type, node.name);
                        } else {
                            let _ = writeln!(
                                output,
                                "   {}.{} <- {}",
                                node.resource_type,
                                node.name,
                                deps.join(", ")
                            );
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if !report.has_drift() {
                    return format!(
                        "{} No drift detected - {} resources in sync.\n",
                        "✓".green(),
                        report.resources.len()
                    );
                }
                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for drift in report.resources.iter().filter(|d| d.status != DriftStatus::InSync) {
                    let _ = writeln!(
                        output,
                        "   {}.{} ({})",
                        drift.resource_type,
                        drift.resource,
                        drift.status.to_string().yellow()
                    );
                    for change in &drift.changes {
                        let recorded = change.old.as_ref().map_or_else(String::new, ToString::to_string);
                        let observed = change.new.as_ref().map_or_else(String::new, ToString::to_string);
                        let _ = writeln!(output, "     ~ {}: {recorded} -> {observed}", change.attribute);
                    }
                }
                if report.written {
                    let _ = write!(output, "\nObservations written to state (serial {}).\n", report.serial);
                } else {
                    output.push_str("\nRun `topoform refresh --write` to record these observations.\n");
                }
                output
            }
        }
    }

    /// Formats an operation kind with color.
    fn format_kind(kind: OperationKind) -> String {
        let label = format!("{}{kind}", kind.symbol());
        match kind {
            OperationKind::Create => label.green().to_string(),
            OperationKind::Update => label.yellow().to_string(),
            OperationKind::Replace => label.magenta().to_string(),
            OperationKind::Destroy => label.red().to_string(),
            OperationKind::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats an operation status with color.
    fn format_status(status: OperationStatus) -> String {
        let label = status.to_string();
        match status {
            OperationStatus::Succeeded => label.green().to_string(),
            OperationStatus::Unchanged => label.dimmed().to_string(),
            OperationStatus::Failed => label.red().to_string(),
            OperationStatus::Skipped | OperationStatus::Cancelled => label.yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ResourceSpec, TopologyConfig};
    use crate::planner::Planner;
    use crate::value::Value;

    fn plan() -> Plan {
        let config = TopologyConfig {
            project: ProjectConfig {
                name: String::from("edge"),
                environment: String::from("dev"),
            },
            state: Default::default(),
            engine: Default::default(),
            simulator: Default::default(),
            guardrails: None,
            types: Default::default(),
            resources: vec![
                ResourceSpec::new("main", "vpc").with_attribute("cidr_block", "10.0.0.0/16"),
                ResourceSpec::new("public_a", "subnet")
                    .with_attribute("vpc_id", Value::reference("main", "id")),
            ],
        };
        Planner::new(&config).plan(None).unwrap()
    }

    #[test]
    fn test_plan_text_lists_operations_and_summary() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), true);
        assert!(text.contains("vpc.main"));
        assert!(text.contains("subnet.public_a"));
        assert!(text.contains("(known after apply)"));
        assert!(text.contains("Plan: 2 to create, 0 to update, 0 to replace, 0 to destroy."));
    }

    #[test]
    fn test_plan_text_reports_outdated_records() {
        colored::control::set_override(false);
        let mut plan = plan();
        for op in &mut plan.operations {
            op.kind = OperationKind::NoOp;
            op.wave = 0;
        }
        plan.operations[1].stale_record = true;

        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false);
        assert!(text.contains("Plan: 0 to create"));
        assert!(text.contains("1 unchanged resource(s) with outdated dependencies"));
    }

    #[test]
    fn test_plan_json_is_machine_readable() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["operations"][1]["kind"], "create");
        assert_eq!(value["operations"][1]["wave"], 2);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
