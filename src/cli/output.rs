//! CLI output: text and json formatters plus error mapping.

use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde_json::json;

use crate::catalog::SectionCatalog;
use crate::error::CliError;
use crate::progress::TimeRemaining;
use crate::session::{OverallStatus, ResultMap, SectionStatus, SessionSnapshot};

pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

/// Map CLI errors to the string printed on failure.
pub fn map_error(e: &CliError) -> String {
    e.to_string()
}

fn status_label(status: SectionStatus) -> String {
    match status {
        SectionStatus::Pending => format!("{}", "pending".dimmed()),
        SectionStatus::InProgress => format!("{}", "in progress".yellow()),
        SectionStatus::Completed => format!("{}", "completed".green()),
        SectionStatus::Failed => format!("{}", "failed".red()),
    }
}

pub fn format_catalog_text(catalog: &SectionCatalog) -> String {
    let mut out = format!("{}\n\n", format_section_heading("Sections"));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["#", "Key", "Section", "Answers", "Timeout"]);
    for spec in catalog.iter() {
        table.add_row(vec![
            (spec.ordinal + 1).to_string(),
            spec.key.clone(),
            spec.display_name.clone(),
            spec.expected_unit_count.to_string(),
            spec.timeout
                .map(|t| format!("{}s", t.as_secs()))
                .unwrap_or_else(|| "default".to_string()),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out
}

pub fn format_catalog_json(catalog: &SectionCatalog) -> Result<String, CliError> {
    serde_json::to_string_pretty(catalog).map_err(|e| CliError::Render(e.to_string()))
}

/// One line per completed section, e.g. `[2/6] Relevance completed`.
pub fn format_section_completed(position: usize, total: usize, display_name: &str) -> String {
    format!(
        "{} {} {}",
        format!("[{}/{}]", position, total).dimmed(),
        display_name.bold(),
        "completed".green()
    )
}

pub fn format_section_failed(display_name: &str, message: &str) -> String {
    format!("{} {}: {}", "failed".red().bold(), display_name.bold(), message)
}

pub fn format_progress_line(percent: f64, remaining: Option<TimeRemaining>) -> String {
    match remaining {
        Some(remaining) => format!("{:>5.1}% complete, {} remaining", percent, remaining),
        None => format!("{:>5.1}% complete", percent),
    }
}

/// Final session report: status banner, per-section table, then generated answers.
pub fn format_session_text(snapshot: &SessionSnapshot, catalog: &SectionCatalog, percent: f64) -> String {
    let mut out = format!("{}\n\n", format_section_heading("Generation"));
    let status = match snapshot.overall_status {
        OverallStatus::Completed => format!("{}", "completed".green().bold()),
        OverallStatus::Failed => format!("{}", "failed".red().bold()),
        OverallStatus::Cancelled => format!("{}", "cancelled".yellow().bold()),
        other => other.as_str().to_string(),
    };
    out.push_str(&format!("  Session: {}\n", snapshot.id));
    out.push_str(&format!("  Status: {} ({:.0}%)\n", status, percent));
    if let Some(ref error) = snapshot.transport_error {
        out.push_str(&format!("  {} {}\n", "Connection lost:".red(), error));
    }
    if let Some(ref error) = snapshot.save_error {
        out.push_str(&format!("  {} {}\n", "Auto-save failed:".yellow(), error));
    }
    out.push('\n');

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Section", "Status", "Answers", "Error"]);
    for state in &snapshot.sections {
        let name = catalog
            .get(&state.key)
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| state.key.clone());
        table.add_row(vec![
            name,
            status_label(state.status),
            state
                .result
                .as_ref()
                .map(|r| r.len().to_string())
                .unwrap_or_else(|| "-".to_string()),
            state.error.clone().unwrap_or_default(),
        ]);
    }
    out.push_str(&format!("{}\n", table));

    for state in snapshot.sections.iter().filter(|s| s.status == SectionStatus::Completed) {
        let Some(ref answers) = state.result else {
            continue;
        };
        let name = catalog
            .get(&state.key)
            .map(|s| s.display_name.as_str())
            .unwrap_or(state.key.as_str());
        out.push_str(&format!("\n{}\n", format_section_heading(name)));
        for (question, answer) in answers {
            out.push_str(&format!("\n  {}\n  {}\n", question.bold(), answer));
        }
    }
    out
}

pub fn format_session_json(snapshot: &SessionSnapshot, results: &ResultMap, percent: f64) -> Result<String, CliError> {
    let out = json!({
        "session": snapshot,
        "overall_percent": percent,
        "results": results,
    });
    serde_json::to_string_pretty(&out).map_err(|e| CliError::Render(e.to_string()))
}
