//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::Value as JsonValue;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::deployer::{ApplyOutcome, DriftReport, DriftStatus, ResolvedOutputs};
use crate::planner::{ActionType, DeploymentPlan, Orphan, ResourceStatus, RunReport};
use crate::state::StackSnapshot;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Run outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Stack output row for table display.
#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "Output")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a deployment plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &DeploymentPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &DeploymentPlan, detailed: bool) -> String {
        let mut output = String::new();

        if !plan.has_changes() && plan.orphans.is_empty() {
            let _ = writeln!(
                output,
                "{} No changes required - {} resources are up to date.",
                "✓".green(),
                plan.actions.len()
            );
            return output;
        }

        let _ = writeln!(output, "\nDeployment Plan");
        let _ = writeln!(output, "   Config hash: {}", short(&plan.config_hash));
        let _ = writeln!(output, "   Plan fingerprint: {}\n", short(&plan.fingerprint));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .filter(|a| detailed || a.action_type != ActionType::NoOp)
            .map(|a| PlanActionRow {
                batch: a.batch,
                action: Self::format_action_type(a.action_type),
                resource: a.resource.clone(),
                kind: a.kind.to_string(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if detailed {
            let _ = writeln!(output, "\nBatches:");
            for (index, batch) in plan.batches.batches().iter().enumerate() {
                let _ = writeln!(output, "   {index}: {}", batch.join(", "));
            }
        }

        if !plan.orphans.is_empty() {
            output.push_str(&Self::format_orphans(&plan.orphans));
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} unchanged, {} orphaned",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::NoOp),
            plan.orphans.len().to_string().red()
        );

        output
    }

    /// Formats orphans with a hint on how to remove them.
    fn format_orphans(orphans: &[Orphan]) -> String {
        let mut output = format!("\n{} Orphaned resources (kept until pruned):\n", "⚠".yellow());
        for orphan in orphans {
            let _ = writeln!(
                output,
                "   - {} ({}, {}): {}",
                orphan.id, orphan.kind, orphan.physical_id, orphan.reason
            );
        }
        let _ = writeln!(output, "   Run 'thot apply --prune' to delete them.");
        output
    }

    /// Formats a run report as a per-resource table.
    #[must_use]
    pub fn format_run(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_run_text(report),
        }
    }

    fn format_run_text(report: &RunReport) -> String {
        if report.outcomes.is_empty() {
            return String::from("Nothing to do.\n");
        }

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .map(|o| OutcomeRow {
                resource: o.id.clone(),
                kind: o.kind.to_string(),
                status: Self::format_status(o.status, o.action.map(|a| a.to_string())),
                physical_id: o.physical_id.as_deref().map_or_else(String::new, |id| Self::truncate(id, 40)),
                error: o.error.as_deref().map_or_else(String::new, |e| Self::truncate(e, 60)),
            })
            .collect();

        let mut output = Table::new(rows).to_string();
        output.push('\n');

        let mark = if report.is_success() {
            "✓".green()
        } else {
            "✗".red()
        };
        let _ = writeln!(output, "\n{mark} {report}");
        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, outcome: &ApplyOutcome) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outcome).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = Self::format_run_text(&outcome.report);
                if !outcome.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    output.push_str(&Self::format_outputs_text(&outcome.outputs));
                }
                if !outcome.orphans.is_empty() {
                    output.push_str(&Self::format_orphans(&outcome.orphans));
                }
                output
            }
        }
    }

    /// Formats resolved stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &ResolvedOutputs) -> String {
        match self.format {
            OutputFormat::Json => {
                let map: serde_json::Map<String, JsonValue> = outputs
                    .iter()
                    .map(|(name, value)| {
                        let value = value.as_ref().map_or_else(
                            |err| serde_json::json!({ "unresolved": err.to_string() }),
                            Clone::clone,
                        );
                        (name.clone(), value)
                    })
                    .collect();
                serde_json::to_string_pretty(&map).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    fn format_outputs_text(outputs: &ResolvedOutputs) -> String {
        if outputs.is_empty() {
            return String::from("No stack outputs declared.\n");
        }

        let rows: Vec<OutputRow> = outputs
            .iter()
            .map(|(name, value)| OutputRow {
                name: name.clone(),
                value: match value {
                    Ok(JsonValue::String(s)) => s.clone(),
                    Ok(other) => other.to_string(),
                    Err(err) => format!("(unresolved) {err}").dimmed().to_string(),
                },
            })
            .collect();

        let mut output = Table::new(rows).to_string();
        output.push('\n');
        output
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
                        report.entries.len()
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                let mut drifted = 0usize;
                for entry in report.drifted() {
                    drifted += 1;
                    let status = match &entry.status {
                        DriftStatus::Missing => entry.status.to_string().red().to_string(),
                        other => other.to_string().yellow().to_string(),
                    };
                    let _ = writeln!(output, "   - {} ({}): {status}", entry.id, entry.kind);
                }
                let _ = write!(
                    output,
                    "\n{drifted}/{} resources have drifted.\n",
                    report.entries.len()
                );
                output
            }
        }
    }

    /// Formats a stack snapshot.
    #[must_use]
    pub fn format_state(&self, snapshot: &StackSnapshot, location: &str) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(snapshot).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    snapshot.stack, snapshot.environment
                );

                let _ = writeln!(output, "   Location: {location}");
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Config hash: {}", short(&snapshot.config_hash));
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                let _ = writeln!(output, "   Resources: {}", snapshot.resources.len());
                if !snapshot.retired.is_empty() {
                    let _ = writeln!(output, "   Retired: {}", snapshot.retired.len());
                }

                for record in snapshot.resources.values() {
                    let _ = writeln!(
                        output,
                        "     {} ({}) -> {}",
                        record.id, record.kind, record.physical_id
                    );
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
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

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats a resource status with color.
    fn format_status(status: ResourceStatus, action: Option<String>) -> String {
        let text = action.unwrap_or_else(|| status.to_string());
        match status {
            ResourceStatus::Provisioned | ResourceStatus::Deleted => text.green().to_string(),
            ResourceStatus::Failed => text.red().to_string(),
            ResourceStatus::NotStarted => text.dimmed().to_string(),
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

/// First 8 characters of a hash, or `-` when empty.
fn short(hash: &str) -> &str {
    if hash.is_empty() {
        "-"
    } else {
        &hash[..8.min(hash.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Scheduler;
    use crate::planner::{ResourceAction, ResourceOutcome};
    use crate::resource::ResourceKind;
    use crate::test_support::scenario_stack;

    fn plan() -> DeploymentPlan {
        let stack = scenario_stack();
        let batches = Scheduler::schedule(&stack).unwrap();
        DeploymentPlan::build(&stack, &batches, None)
    }

    fn failed_report() -> RunReport {
        RunReport {
            outcomes: vec![
                ResourceOutcome {
                    id: "b1".into(),
                    kind: ResourceKind::Bucket,
                    status: ResourceStatus::Provisioned,
                    action: Some(ResourceAction::Created),
                    physical_id: Some("thot-site.com".into()),
                    error: None,
                },
                ResourceOutcome {
                    id: "i1".into(),
                    kind: ResourceKind::OriginAccessIdentity,
                    status: ResourceStatus::Failed,
                    action: None,
                    physical_id: None,
                    error: Some("backend unavailable: 503".into()),
                },
                ResourceOutcome {
                    id: "p1".into(),
                    kind: ResourceKind::BucketPolicy,
                    status: ResourceStatus::NotStarted,
                    action: None,
                    physical_id: None,
                    error: None,
                },
            ],
            cancelled: false,
        }
    }

    #[test]
    fn test_plan_text() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), true);
        assert!(text.contains("+create"));
        assert!(text.contains("2: dep1"));
        assert!(text.contains("Plan: 5 to create, 0 to update, 0 unchanged, 0 orphaned"));
    }

    #[test]
    fn test_plan_json() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: JsonValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value["actions"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_run_table_shows_every_resource() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_run(&failed_report());
        assert!(text.contains("created"));
        assert!(text.contains("Failed"));
        assert!(text.contains("NotStarted"));
        assert!(text.contains("backend unavailable: 503"));
        assert!(text.contains("1 created, 0 updated, 0 unchanged, 0 deleted, 1 failed, 1 not started"));
    }

    #[test]
    fn test_outputs_json_marks_unresolved() {
        let outputs: ResolvedOutputs = vec![
            ("SiteUrl".into(), Ok(serde_json::json!("https://d1.cloudfront.net"))),
            (
                "BucketArn".into(),
                Err(crate::error::OutputError::UnresolvedOutput {
                    name: "BucketArn".into(),
                    resource: "b1".into(),
                    state: "Pending".into(),
                }),
            ),
        ];
        let json = OutputFormatter::new(OutputFormat::Json).format_outputs(&outputs);
        let value: JsonValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value["SiteUrl"], "https://d1.cloudfront.net");
        assert!(value["BucketArn"]["unresolved"].as_str().unwrap().contains("Pending"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghij", 6), "abc...");
    }
}
