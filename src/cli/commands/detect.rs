//! Text detection command, for finding where title-block fields sit.

use console::style;

use crate::cli::helpers::{open_db, Pipeline};
use crate::config::Settings;
use crate::models::Rect;

/// Print the text lines OCR finds on a sheet, optionally inside a region.
pub async fn cmd_detect_text(
    settings: &Settings,
    sheet_id: i32,
    region: Option<Rect>,
) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let Some(sheet) = ctx.sheets().get(sheet_id).await? else {
        println!("{} Sheet {} not found", style("✗").red(), sheet_id);
        return Ok(());
    };
    let Some(preview_key) = sheet.page_preview_key.as_deref() else {
        println!(
            "{} Sheet {} has not been rendered yet",
            style("✗").red(),
            sheet_id
        );
        return Ok(());
    };

    let pipeline = Pipeline::from_settings(settings, &ctx).await;
    let image = match region {
        Some(rect) => pipeline
            .extractor
            .crop_service()
            .crop_image(preview_key, &rect)
            .await
            .ok_or_else(|| anyhow::anyhow!("Failed to crop sheet {}", sheet_id))?,
        None => pipeline.storage.get(preview_key).await?,
    };

    let lines = pipeline.extractor.textract().detect_all_text(&image).await?;
    if lines.is_empty() {
        println!("{} No text detected", style("!").yellow());
        return Ok(());
    }

    println!("{:>5}  {:<27}  {}", "Conf", "Box (x,y,w,h)", "Text");
    for line in &lines {
        // Boxes come back relative to the crop; report page coordinates
        let bbox = line
            .bounding_box
            .map(|b| region.map_or(b, |r| r.project(&b)))
            .map(|b| format!("{:.3},{:.3},{:.3},{:.3}", b.x, b.y, b.w, b.h))
            .unwrap_or_default();
        println!(
            "{:>4.0}%  {:<27}  {}",
            line.confidence * 100.0,
            bbox,
            line.text
        );
    }
    println!("\n{} lines", lines.len());
    Ok(())
}
