//! Drawing set status command.

use console::style;
use serde::Serialize;

use crate::cli::helpers::{open_db, or_dash, percent};
use crate::config::Settings;
use crate::models::{DrawingSet, DrawingSetStatus, ExtractionStats, ExtractionStatus, Sheet};

#[derive(Serialize)]
struct StatusReport<'a> {
    drawing_set: &'a DrawingSet,
    stats: ExtractionStats,
    progress_percent: i64,
    sheets: &'a [Sheet],
}

fn status_style(status: DrawingSetStatus) -> String {
    let s = status.as_str();
    match status {
        DrawingSetStatus::Success => style(s).green().to_string(),
        DrawingSetStatus::Partial => style(s).yellow().to_string(),
        DrawingSetStatus::Failed => style(s).red().to_string(),
        _ => style(s).cyan().to_string(),
    }
}

fn extraction_style(status: ExtractionStatus) -> String {
    let s = status.as_str();
    match status {
        ExtractionStatus::Success => style(s).green().to_string(),
        ExtractionStatus::NeedsReview => style(s).yellow().to_string(),
        ExtractionStatus::Failed => style(s).red().to_string(),
        _ => style(s).dim().to_string(),
    }
}

/// Show set status, counts, and per-sheet results.
pub async fn cmd_status(settings: &Settings, set_id: i32, json: bool) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let Some(set) = ctx.drawing_sets().get(set_id).await? else {
        println!("{} Drawing set {} not found", style("✗").red(), set_id);
        return Ok(());
    };
    let stats = ctx.drawing_sets().extraction_stats(set_id).await?;
    let sheets = ctx.sheets().list_for_set(set_id).await?;

    if json {
        let report = StatusReport {
            drawing_set: &set,
            stats,
            progress_percent: stats.progress_percent(),
            sheets: &sheets,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n{}", style(format!("Drawing Set: {}", set.name)).bold());
    println!("{}", "-".repeat(60));
    println!("{:<14} {}", "Status:", status_style(set.status));
    println!("{:<14} {}", "Project:", set.project_id);
    println!("{:<14} {}", "Pages:", set.page_count);
    println!(
        "{:<14} {}% ({} of {})",
        "Progress:",
        stats.progress_percent(),
        stats.processed(),
        stats.total
    );
    println!(
        "{:<14} {} success, {} review, {} failed, {} queued, {} processing",
        "Sheets:",
        stats.success,
        stats.needs_review,
        stats.failed,
        stats.queued,
        stats.processing
    );
    if let Some(errors) = &set.processing_errors {
        if let Some(error) = errors.get("error").and_then(|e| e.as_str()) {
            println!("{:<14} {}", "Error:", style(error).red());
        }
    }

    if sheets.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "{:>5} {:>7}  {:<14} {:<16} {:<36} {:<6} {:>5}",
        "Page", "Sheet", "Status", "Number", "Title", "Rev", "Conf"
    );
    for sheet in &sheets {
        let title: String = sheet
            .drawing_title
            .as_deref()
            .unwrap_or("")
            .chars()
            .take(36)
            .collect();
        println!(
            "{:>5} {:>7}  {:<14} {:<16} {:<36} {:<6} {:>5}",
            sheet.page_number,
            sheet.id,
            extraction_style(sheet.extraction_status),
            or_dash(sheet.drawing_number.as_deref()),
            or_dash(Some(&title)),
            or_dash(sheet.revision.as_deref()),
            percent(sheet.confidence_number),
        );
    }

    Ok(())
}
