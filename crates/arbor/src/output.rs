//! Output formatting helpers for the `arbor` CLI.
//!
//! Provides JSON output, table formatting, and human-readable renderings of
//! engine results.

use std::io::{self, Write};

use serde::Serialize;

use arbor_core::blueprint::Blueprint;
use arbor_core::enums::LinkField;
use arbor_engine::aggregate::TotalReport;
use arbor_engine::evaluate::format_number;
use arbor_engine::{
    EvalValue, Evaluation, LinkReport, NodeView, OccurrenceResult, OccurrenceSummary, RemovalResult,
    Unresolved,
};

/// Print a value as pretty-printed JSON to stdout.
///
/// Terminates the process with exit code 1 if serialization fails.
pub fn output_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            // Ignore broken pipe errors (e.g., piped to `head`)
            let _ = writeln!(handle, "{}", json);
        }
        Err(e) => {
            eprintln!("Error: failed to serialize JSON: {}", e);
            std::process::exit(1);
        }
    }
}

/// Print a simple table with headers and rows.
///
/// Column widths are computed from the data for alignment.
pub fn output_table(headers: &[&str], rows: &[Vec<String>]) {
    if rows.is_empty() {
        return;
    }
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let _ = write!(handle, "{}", render_table(headers, rows));
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let mut out = String::new();
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    push_row(&mut out, &header_cells, &widths);
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_row(&mut out, &separator, &widths);
    for row in rows {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        match widths.get(i) {
            Some(w) => line.push_str(&format!("{:<width$}", cell, width = *w)),
            None => line.push_str(cell),
        }
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

// ---------------------------------------------------------------------------
// Engine results
// ---------------------------------------------------------------------------

pub fn format_link_report(report: &LinkReport) -> String {
    if report.is_noop() {
        return format!(
            "Links up to date ({} capacities, {} variables scanned)",
            report.capacities_scanned, report.variables_scanned
        );
    }
    let mut lines = vec![format!(
        "Linked {} id(s) on {} node(s) ({} capacities, {} variables scanned)",
        report.ids_added, report.nodes_updated, report.capacities_scanned, report.variables_scanned
    )];
    if report.broken_references > 0 {
        lines.push(format!("  {} reference(s) to missing entities skipped", report.broken_references));
    }
    if report.unresolved_references > 0 {
        lines.push(format!("  {} reference(s) could not be resolved", report.unresolved_references));
    }
    if report.truncated_extractions > 0 {
        lines.push(format!("  {} extraction(s) hit the depth limit", report.truncated_extractions));
    }
    lines.join("\n")
}

pub fn format_occurrence(result: &OccurrenceResult) -> String {
    let mut lines = vec![format!(
        "Added occurrence {} of {} ({} node(s))",
        result.index,
        result.repeater_id,
        result.nodes.len()
    )];
    for (template, copy) in &result.nodes {
        lines.push(format!("  {template} -> {copy}"));
    }
    if !result.capacity_ids.is_empty() {
        lines.push(format!("Capacities: {}", result.capacity_ids.join(", ")));
    }
    if !result.variable_ids.is_empty() {
        lines.push(format!("Variables: {}", result.variable_ids.join(", ")));
    }
    for rename in &result.renamed_keys {
        lines.push(format!(
            "Key {} taken; {} uses {}",
            rename.requested, rename.variable_id, rename.assigned
        ));
    }
    if let Some(total) = &result.total {
        lines.push(format_total(total));
    }
    lines.join("\n")
}

pub fn format_removal(result: &RemovalResult) -> String {
    let mut lines = vec![format!(
        "Removed occurrence {} of {} ({} node(s), {} link(s) dropped)",
        result.index,
        result.repeater_id,
        result.deleted_node_ids.len(),
        result.unlinked
    )];
    if let Some(total) = &result.total {
        lines.push(format_total(total));
    }
    lines.join("\n")
}

fn format_total(total: &TotalReport) -> String {
    format!("Total {} now sums {}", total.capacity_id, total.sources.join(", "))
}

pub fn occurrence_rows(occurrences: &[OccurrenceSummary]) -> Vec<Vec<String>> {
    occurrences
        .iter()
        .map(|o| vec![o.index.to_string(), o.node_ids.join(", ")])
        .collect()
}

pub fn format_node_view(view: &NodeView) -> String {
    let node = &view.node;
    let mut lines = vec![format!("{} [{}] {}", node.id, node.node_type, node.display_label())];
    if let Some(parent) = &node.parent_id {
        lines.push(format!("Parent: {parent}"));
    }
    if !view.children.is_empty() {
        lines.push(format!("Children: {}", view.children.join(", ")));
    }
    if let Some(mark) = node.occurrence_mark() {
        lines.push(format!(
            "Occurrence {} of {} (from {})",
            mark.index, mark.repeater_id, mark.source_template_id
        ));
    }
    if let Some(config) = node.repeater_config() {
        lines.push(format!("Templates: {}", config.template_node_ids.join(", ")));
    }

    if !view.capacities.is_empty() {
        lines.push(String::new());
        lines.push("CAPACITIES".to_string());
        for capacity in &view.capacities {
            let default = if capacity.is_default { " (default)" } else { "" };
            lines.push(format!(
                "  {} {} {}{}",
                capacity.kind(),
                capacity.id,
                capacity.display_name(),
                default
            ));
        }
    }

    if let Some(variable) = &view.variable {
        lines.push(String::new());
        lines.push("VARIABLE".to_string());
        let source = variable.source_ref.as_deref().unwrap_or("-");
        lines.push(format!(
            "  {} key={} source={} ({})",
            variable.id, variable.exposed_key, source, variable.source_type
        ));
    }

    let linked: Vec<String> = LinkField::ALL
        .iter()
        .filter(|f| !node.linked.get(**f).is_empty())
        .map(|f| {
            let ids: Vec<&str> = node.linked.get(*f).iter().map(String::as_str).collect();
            format!("  {}: {}", f, ids.join(", "))
        })
        .collect();
    if !linked.is_empty() {
        lines.push(String::new());
        lines.push("LINKED".to_string());
        lines.extend(linked);
    }
    lines.join("\n")
}

pub fn format_blueprint(blueprint: &Blueprint) -> String {
    let mut lines = vec![format!(
        "Blueprint of {} ({} template node(s))",
        blueprint.repeater_node_id,
        blueprint.template_node_ids.len()
    )];
    lines.push(format!("Templates: {}", blueprint.template_node_ids.join(", ")));
    if !blueprint.missing_template_ids.is_empty() {
        lines.push(format!("Missing: {}", blueprint.missing_template_ids.join(", ")));
    }
    for capacity in &blueprint.capacities {
        lines.push(format!(
            "  {} {} on {}",
            capacity.capacity_type, capacity.capacity_id, capacity.owner_node_id
        ));
    }
    for variable in &blueprint.variables {
        lines.push(format!(
            "  variable {} on {} -> {}",
            variable.variable_id,
            variable.node_id,
            variable.source_ref.as_deref().unwrap_or("-")
        ));
    }
    if let Some(total) = &blueprint.total_field {
        lines.push(format!(
            "Total: {:?} of {} shown on {}",
            total.aggregation, total.source_node_id, total.target_node_id
        ));
    }
    lines.join("\n")
}

/// Trace line followed by the value; unresolved values show `empty` and why.
pub fn format_evaluation(evaluation: &Evaluation, empty: &str) -> String {
    let value = match &evaluation.value {
        EvalValue::Number(n) => format_number(*n),
        EvalValue::Text(s) => s.clone(),
        EvalValue::Bool(b) => b.to_string(),
        EvalValue::Unresolved(reason) => format!("{empty} ({})", unresolved_name(*reason)),
    };
    format!("{}\nValue: {}", evaluation.trace, value)
}

fn unresolved_name(reason: Unresolved) -> &'static str {
    match reason {
        Unresolved::Missing => "missing",
        Unresolved::DivisionByZero => "division by zero",
        Unresolved::Cycle => "cycle",
        Unresolved::DepthExceeded => "depth exceeded",
        Unresolved::NotFound => "not found",
        Unresolved::Malformed => "malformed",
        Unresolved::InvalidReference => "invalid reference",
    }
}
