//! Commands that queue rendering and extraction work.

use console::style;

use crate::cli::helpers::open_db;
use crate::config::Settings;
use crate::jobs::{self, JobPayload};
use crate::models::{DrawingSetStatus, ExtractionStatus};

/// Queue a drawing set for rendering again.
pub async fn cmd_process(settings: &Settings, set_id: i32) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let Some(set) = ctx.drawing_sets().get(set_id).await? else {
        println!("{} Drawing set {} not found", style("✗").red(), set_id);
        return Ok(());
    };

    // Sheets are created at import; make sure none are missing
    ctx.sheets().create_for_set(&set).await?;
    ctx.drawing_sets()
        .update_status(set.id, DrawingSetStatus::Queued, None)
        .await?;

    jobs::dispatch(
        &ctx,
        JobPayload::ProcessDrawingSet {
            drawing_set_id: set.id,
        },
    )
    .await?;

    println!(
        "{} Queued '{}' ({} pages) for processing",
        style("✓").green(),
        set.name,
        set.page_count
    );
    Ok(())
}

/// Clear a sheet's extraction and queue it again.
pub async fn cmd_extract(
    settings: &Settings,
    sheet_id: i32,
    template_id: Option<i32>,
) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let Some(sheet) = ctx.sheets().get(sheet_id).await? else {
        println!("{} Sheet {} not found", style("✗").red(), sheet_id);
        return Ok(());
    };

    if let Some(id) = template_id {
        match ctx.templates().get(id).await? {
            Some(t) if t.project_id == sheet.project_id => {}
            Some(_) => println!(
                "{} Template {} belongs to another project and will be ignored",
                style("!").yellow(),
                id
            ),
            None => println!(
                "{} Template {} not found and will be ignored",
                style("!").yellow(),
                id
            ),
        }
    }

    ctx.sheets().reset_extraction(sheet.id).await?;
    jobs::dispatch(
        &ctx,
        JobPayload::ExtractSheetMetadata {
            sheet_id: sheet.id,
            preferred_template_id: template_id,
        },
    )
    .await?;

    let message = if template_id.is_some() {
        "Extraction queued with selected template"
    } else {
        "Extraction queued"
    };
    println!("{} {} for sheet {}", style("✓").green(), message, sheet.id);
    Ok(())
}

/// Queue extraction again for a set's failed and review sheets, or all
/// sheets with `force`.
pub async fn cmd_retry(settings: &Settings, set_id: i32, force: bool) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    if ctx.drawing_sets().get(set_id).await?.is_none() {
        println!("{} Drawing set {} not found", style("✗").red(), set_id);
        return Ok(());
    }

    let sheets: Vec<_> = ctx
        .sheets()
        .list_for_set(set_id)
        .await?
        .into_iter()
        .filter(|s| {
            force
                || matches!(
                    s.extraction_status,
                    ExtractionStatus::NeedsReview | ExtractionStatus::Failed
                )
        })
        .collect();

    for sheet in &sheets {
        ctx.sheets().reset_extraction(sheet.id).await?;
        jobs::dispatch(
            &ctx,
            JobPayload::ExtractSheetMetadata {
                sheet_id: sheet.id,
                preferred_template_id: None,
            },
        )
        .await?;
    }

    if !sheets.is_empty() {
        ctx.drawing_sets()
            .update_status(set_id, DrawingSetStatus::Processing, None)
            .await?;
    }

    println!(
        "{} Queued {} sheets for re-extraction",
        style("✓").green(),
        sheets.len()
    );
    Ok(())
}

/// Link sheets that have a drawing number but no drawing sheet.
pub async fn cmd_relink(settings: &Settings, set_id: i32) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let unlinked: Vec<_> = ctx
        .sheets()
        .list_for_set(set_id)
        .await?
        .into_iter()
        .filter(|s| s.drawing_sheet_id.is_none())
        .filter(|s| s.drawing_number.as_deref().is_some_and(|n| !n.is_empty()))
        .collect();

    if unlinked.is_empty() {
        println!("{} All sheets are already linked", style("✓").green());
        return Ok(());
    }

    let mut linked = 0;
    for sheet in &unlinked {
        let number = sheet.drawing_number.as_deref().unwrap_or_default();
        let result = async {
            let drawing_sheet = ctx
                .drawing_sheets()
                .find_or_create_by_drawing_number(
                    sheet.project_id,
                    number,
                    sheet.drawing_title.as_deref(),
                )
                .await?;
            ctx.drawing_sheets()
                .add_revision(drawing_sheet.id, sheet.id, sheet.revision.as_deref())
                .await
        }
        .await;

        match result {
            Ok(revision) => {
                linked += 1;
                println!(
                    "  {} Sheet {} -> {} rev {}",
                    style("✓").green(),
                    sheet.id,
                    number,
                    revision
                );
            }
            Err(e) => println!("  {} Sheet {}: {}", style("✗").red(), sheet.id, e),
        }
    }

    println!("Linked {} of {} sheets", linked, unlinked.len());
    Ok(())
}
