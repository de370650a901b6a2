//! Drawing set import command.

use std::path::Path;

use console::style;
use sha2::{Digest, Sha256};

use crate::cli::helpers::open_db;
use crate::config::Settings;
use crate::jobs::{self, JobPayload};
use crate::render::pdf_page_count;
use crate::storage;

/// Storage key for an imported PDF. Content-addressed, so the same file
/// imported twice into a project maps to the same key.
fn pdf_key(project_id: i32, content: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(content));
    format!("drawing-sets/{}/{}.pdf", project_id, &digest[..16])
}

/// Store a PDF, create its set and sheets, and queue rendering.
pub async fn cmd_import(
    settings: &Settings,
    pdf: &Path,
    project_id: i32,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;

    let content = tokio::fs::read(pdf).await?;
    if content.is_empty() {
        anyhow::bail!("Failed to read {}: file is empty", pdf.display());
    }
    if !content.starts_with(b"%PDF-") {
        anyhow::bail!("Invalid PDF file - does not have PDF header");
    }

    let key = pdf_key(project_id, &content);
    let existing = ctx
        .drawing_sets()
        .list_for_project(project_id)
        .await?
        .into_iter()
        .find(|s| s.original_pdf_key == key);
    if let Some(existing) = existing {
        println!(
            "{} This PDF has already been imported as drawing set {}",
            style("!").yellow(),
            existing.id
        );
        return Ok(());
    }

    let page_count = match pdf_page_count(pdf).await {
        Some(n) if n > 0 => n as i32,
        _ => {
            println!(
                "{} Could not read page count (is poppler-utils installed?), assuming 1",
                style("!").yellow()
            );
            1
        }
    };

    let store = storage::from_backend(&settings.storage).await;
    store.put(&key, &content, "application/pdf").await?;

    let name = name.map(str::to_string).unwrap_or_else(|| {
        pdf.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.clone())
    });

    let set_id = ctx
        .drawing_sets()
        .create(project_id, &name, &key, page_count)
        .await?;
    let set = ctx
        .drawing_sets()
        .get(set_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Drawing set {} vanished after insert", set_id))?;
    ctx.sheets().create_for_set(&set).await?;

    let job_id = jobs::dispatch(
        &ctx,
        JobPayload::ProcessDrawingSet {
            drawing_set_id: set_id,
        },
    )
    .await?;

    tracing::info!(set_id, %key, page_count, job_id = %job_id, "Imported drawing set");
    println!(
        "{} Imported '{}' as drawing set {} ({} pages)",
        style("✓").green(),
        name,
        set_id,
        page_count
    );
    println!("  Run 'drawmeta work' to process it");

    Ok(())
}
