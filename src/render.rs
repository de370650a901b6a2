//! Rendering drawing set PDFs into per-page previews and thumbnails.
//!
//! Pages are rendered at 300 DPI with pdftoppm (poppler-utils), falling back
//! to ImageMagick. Thumbnails are 300 px wide JPEGs.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageReader;
use serde_json::json;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::events::ProgressBroadcaster;
use crate::jobs::{self, JobPayload};
use crate::models::{DrawingSet, DrawingSetStatus, Orientation, Sheet, TitleBlockTemplate};
use crate::repository::{DbContext, RenderedPage};
use crate::storage::ObjectStorage;

const RENDER_DPI: &str = "300";
const RENDER_TIMEOUT: Duration = Duration::from_secs(120);
const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(60);
const THUMBNAIL_WIDTH: u32 = 300;
const THUMBNAIL_QUALITY: u8 = 80;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Failed to render page {0} to PNG")]
    RenderFailed(u32),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage key for a rendered page preview.
pub fn preview_key(project_id: i32, drawing_set_id: i32, page: i32) -> String {
    format!(
        "drawing-previews/{}/{}/page_{:04}.png",
        project_id, drawing_set_id, page
    )
}

/// Storage key for a page thumbnail.
pub fn thumbnail_key(project_id: i32, drawing_set_id: i32, page: i32) -> String {
    format!(
        "drawing-thumbnails/{}/{}/thumb_{:04}.jpg",
        project_id, drawing_set_id, page
    )
}

/// Run a command to completion, killing it after `limit`.
async fn run_with_timeout(
    cmd: &mut Command,
    limit: Duration,
    label: &str,
) -> Result<ExitStatus, RenderError> {
    let child = cmd
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(limit, child).await {
        Ok(Ok(output)) => {
            if !output.status.success() {
                debug!(
                    tool = label,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Command failed"
                );
            }
            Ok(output.status)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RenderError::ToolNotFound(label.to_string()))
        }
        Ok(Err(e)) => Err(RenderError::Io(e)),
        Err(_) => Err(RenderError::Timeout(label.to_string())),
    }
}

/// Number of pages in a PDF, read from `pdfinfo`.
pub async fn pdf_page_count(path: &Path) -> Option<u32> {
    let output = Command::new("pdfinfo").arg(path).output().await.ok()?;

    if !output.status.success() {
        return None;
    }

    parse_page_count(&String::from_utf8_lossy(&output.stdout))
}

fn parse_page_count(pdfinfo: &str) -> Option<u32> {
    pdfinfo
        .lines()
        .find(|line| line.starts_with("Pages:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
}

/// Locate pdftoppm's output for `page`.
///
/// The page number is zero-padded to the width of the document's page
/// count, so every common width is tried before scanning the directory.
fn find_rendered_page(dir: &Path, stem: &str, page: u32) -> Option<PathBuf> {
    let unpadded = dir.join(format!("{}-{}.png", stem, page));
    if unpadded.exists() {
        return Some(unpadded);
    }

    for digits in [2, 3, 4] {
        let path = dir.join(format!("{}-{:0width$}.png", stem, page, width = digits));
        if path.exists() {
            return Some(path);
        }
    }

    let prefix = format!("{}-", stem);
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.extension().is_some_and(|ext| ext == "png")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
        })
}

/// Fresh output directory for one page, removed when dropped.
fn page_output_dir(pages_dir: &Path, page: u32) -> std::io::Result<TempDir> {
    tempfile::Builder::new()
        .prefix(&format!("page-{}-", page))
        .tempdir_in(pages_dir)
}

/// Scale to `THUMBNAIL_WIDTH` wide and encode as JPEG.
fn thumbnail_in_process(png: &[u8]) -> Result<Vec<u8>, RenderError> {
    let mut reader = ImageReader::new(Cursor::new(png)).with_guessed_format()?;
    reader.no_limits();
    let img = reader.decode()?;

    let height = ((img.height() as f64 * THUMBNAIL_WIDTH as f64) / img.width().max(1) as f64)
        .round()
        .max(1.0) as u32;
    let thumb = image::DynamicImage::ImageRgb8(
        img.resize_exact(THUMBNAIL_WIDTH, height, FilterType::Triangle)
            .to_rgb8(),
    );

    let mut out = Vec::new();
    thumb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, THUMBNAIL_QUALITY))?;
    Ok(out)
}

/// Renders single PDF pages with the tools available on this machine.
#[derive(Debug, Clone, Default)]
pub struct PageRenderer {
    pdftoppm: Option<PathBuf>,
}

impl PageRenderer {
    /// Use `configured` when it exists, otherwise pdftoppm from PATH.
    pub fn new(configured: Option<&Path>) -> Self {
        let pdftoppm = match configured {
            Some(path) if path.exists() => Some(path.to_path_buf()),
            Some(path) => {
                warn!(path = %path.display(), "Configured pdftoppm not found, searching PATH");
                which::which("pdftoppm").ok()
            }
            None => which::which("pdftoppm").ok(),
        };
        Self { pdftoppm }
    }

    /// Render one page (1-based) into `out_dir`. Returns the PNG path.
    pub async fn render_page(
        &self,
        pdf: &Path,
        page: u32,
        out_dir: &Path,
    ) -> Result<PathBuf, RenderError> {
        match self.try_pdftoppm(pdf, page, out_dir).await {
            Ok(Some(path)) => return Ok(path),
            Ok(None) => {}
            Err(e) => warn!(page, "pdftoppm failed: {}", e),
        }

        match self.try_imagemagick(pdf, page, out_dir).await {
            Ok(Some(path)) => Ok(path),
            Ok(None) => Err(RenderError::RenderFailed(page)),
            Err(e) => {
                warn!(page, "ImageMagick failed: {}", e);
                Err(RenderError::RenderFailed(page))
            }
        }
    }

    async fn try_pdftoppm(
        &self,
        pdf: &Path,
        page: u32,
        out_dir: &Path,
    ) -> Result<Option<PathBuf>, RenderError> {
        let Some(ref binary) = self.pdftoppm else {
            return Err(RenderError::ToolNotFound(
                "pdftoppm (install poppler-utils)".to_string(),
            ));
        };

        let page_arg = page.to_string();
        let status = run_with_timeout(
            Command::new(binary)
                .args(["-r", RENDER_DPI, "-png", "-f", &page_arg, "-l", &page_arg])
                .arg(pdf)
                .arg(out_dir.join("page")),
            RENDER_TIMEOUT,
            "pdftoppm",
        )
        .await?;

        if !status.success() {
            return Ok(None);
        }
        Ok(find_rendered_page(out_dir, "page", page))
    }

    async fn try_imagemagick(
        &self,
        pdf: &Path,
        page: u32,
        out_dir: &Path,
    ) -> Result<Option<PathBuf>, RenderError> {
        let output = out_dir.join(format!("page_im_{}.png", page));
        // ImageMagick page indexes are 0-based
        let source = format!("{}[{}]", pdf.display(), page.saturating_sub(1));

        for tool in ["convert", "magick"] {
            let Ok(binary) = which::which(tool) else {
                continue;
            };

            let status = run_with_timeout(
                Command::new(binary)
                    .args(["-density", RENDER_DPI])
                    .arg(&source)
                    .args(["-background", "white", "-alpha", "remove", "-quality", "90"])
                    .arg(&output),
                RENDER_TIMEOUT,
                tool,
            )
            .await?;

            if status.success() && output.exists() {
                return Ok(Some(output));
            }
        }

        Ok(None)
    }

    /// Thumbnail JPEG for a rendered page. ImageMagick first, then an
    /// in-process resize.
    pub async fn thumbnail(&self, png_path: &Path) -> Result<Vec<u8>, RenderError> {
        if let Ok(convert) = which::which("convert") {
            let out = png_path.with_extension("thumb.jpg");
            let result = run_with_timeout(
                Command::new(convert)
                    .arg(png_path)
                    .args(["-thumbnail", &format!("{}x", THUMBNAIL_WIDTH)])
                    .args(["-quality", &THUMBNAIL_QUALITY.to_string()])
                    .arg(&out),
                THUMBNAIL_TIMEOUT,
                "convert",
            )
            .await;

            match result {
                Ok(s) if s.success() && out.exists() => {
                    let bytes = tokio::fs::read(&out).await?;
                    if let Err(e) = tokio::fs::remove_file(&out).await {
                        warn!(path = %out.display(), "Failed to remove thumbnail: {}", e);
                    }
                    return Ok(bytes);
                }
                Ok(_) => debug!("convert thumbnail failed, resizing in process"),
                Err(e) => debug!("convert thumbnail failed ({}), resizing in process", e),
            }
        }

        let png = tokio::fs::read(png_path).await?;
        tokio::task::spawn_blocking(move || thumbnail_in_process(&png))
            .await
            .map_err(|e| RenderError::Io(std::io::Error::other(e.to_string())))?
    }
}

/// Turns an uploaded drawing set into rendered, queued sheets.
#[derive(Clone)]
pub struct DrawingSetProcessor {
    db: DbContext,
    storage: Arc<dyn ObjectStorage>,
    renderer: PageRenderer,
    events: ProgressBroadcaster,
}

impl DrawingSetProcessor {
    pub fn new(
        db: DbContext,
        storage: Arc<dyn ObjectStorage>,
        renderer: PageRenderer,
        events: ProgressBroadcaster,
    ) -> Self {
        Self {
            db,
            storage,
            renderer,
            events,
        }
    }

    /// Render every sheet of a set and queue extraction for each.
    ///
    /// Per-page failures mark only that sheet failed. Anything that stops
    /// the whole set marks it failed and is returned so the job retries.
    pub async fn process_set(&self, drawing_set_id: i32) -> anyhow::Result<()> {
        let Some(set) = self.db.drawing_sets().get(drawing_set_id).await? else {
            error!(drawing_set_id, "Drawing set not found");
            return Ok(());
        };

        self.db
            .drawing_sets()
            .update_status(set.id, DrawingSetStatus::Processing, None)
            .await?;
        self.events
            .publish_progress(&self.db, set.id, None, Some("Processing started"))
            .await;

        match self.render_all(&set).await {
            Ok(()) => {
                let (status, stats) = self.db.drawing_sets().update_status_from_sheets(set.id).await?;
                info!(
                    drawing_set_id = set.id,
                    status = status.as_str(),
                    total = stats.total,
                    failed = stats.failed,
                    "Drawing set rendered"
                );
                self.events
                    .publish_progress(&self.db, set.id, None, Some("Processing complete"))
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(drawing_set_id = set.id, "Failed to process drawing set: {:#}", e);
                self.db
                    .drawing_sets()
                    .update_status(
                        set.id,
                        DrawingSetStatus::Failed,
                        Some(&json!({ "error": e.to_string() })),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Failure hook once a processing job has used up its retries.
    pub async fn mark_permanently_failed(
        &self,
        drawing_set_id: i32,
        error: &str,
    ) -> anyhow::Result<()> {
        let errors = json!({
            "error": error,
            "failed_at": chrono::Utc::now().to_rfc3339(),
        });
        self.db
            .drawing_sets()
            .update_status(drawing_set_id, DrawingSetStatus::Failed, Some(&errors))
            .await?;
        self.events
            .publish_progress(&self.db, drawing_set_id, None, Some("Processing failed"))
            .await;
        Ok(())
    }

    async fn render_all(&self, set: &DrawingSet) -> anyhow::Result<()> {
        let content = self
            .storage
            .get(&set.original_pdf_key)
            .await
            .with_context(|| format!("Failed to read {}", set.original_pdf_key))?;

        if content.is_empty() {
            anyhow::bail!("PDF content is empty - storage download failed or file is empty");
        }
        if !content.starts_with(b"%PDF-") {
            anyhow::bail!("Invalid PDF file - does not have PDF header");
        }

        let temp_dir = TempDir::new()?;
        let pdf_path = temp_dir.path().join(format!("drawing_set_{}.pdf", set.id));
        tokio::fs::write(&pdf_path, &content).await?;
        drop(content);

        info!(
            drawing_set_id = set.id,
            path = %pdf_path.display(),
            "PDF downloaded for processing"
        );

        let pages_dir = temp_dir.path().join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;

        for sheet in self.db.sheets().list_for_set(set.id).await? {
            match self.render_sheet(set, &sheet, &pdf_path, &pages_dir).await {
                Ok(()) => {}
                Err(e) => {
                    error!(
                        drawing_set_id = set.id,
                        page_number = sheet.page_number,
                        "Failed to process page: {:#}",
                        e
                    );
                    self.db
                        .sheets()
                        .mark_failed(sheet.id, &json!({ "processing_error": e.to_string() }))
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn render_sheet(
        &self,
        set: &DrawingSet,
        sheet: &Sheet,
        pdf_path: &Path,
        pages_dir: &Path,
    ) -> anyhow::Result<()> {
        let page = u32::try_from(sheet.page_number)
            .ok()
            .filter(|p| *p > 0)
            .with_context(|| format!("Invalid page number {}", sheet.page_number))?;

        // Dropped on every early return, so a failed page leaves nothing
        // for the next page's output scan to pick up
        let page_dir = page_output_dir(pages_dir, page)?;
        let png_path = self
            .renderer
            .render_page(pdf_path, page, page_dir.path())
            .await?;
        let png = tokio::fs::read(&png_path).await?;

        let (width, height) = crate::crop::dimensions_of(&png)
            .with_context(|| format!("Failed to get dimensions for page {}", page))?;
        let orientation = Orientation::from_dimensions(width, height);
        let size_bucket = TitleBlockTemplate::create_size_bucket(width, height);

        let preview = preview_key(set.project_id, set.id, sheet.page_number);
        self.storage.put(&preview, &png, "image/png").await?;
        drop(png);

        let thumbnail = match self.renderer.thumbnail(&png_path).await {
            Ok(bytes) => {
                let key = thumbnail_key(set.project_id, set.id, sheet.page_number);
                match self.storage.put(&key, &bytes, "image/jpeg").await {
                    Ok(()) => Some(key),
                    Err(e) => {
                        warn!(page, "Failed to upload thumbnail: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!(page, "Failed to generate thumbnail: {}", e);
                None
            }
        };

        if let Err(e) = page_dir.close() {
            warn!(page, "Failed to remove rendered page: {}", e);
        }

        self.db
            .sheets()
            .save_rendered(
                sheet.id,
                &RenderedPage {
                    preview_key: preview,
                    thumbnail_key: thumbnail,
                    width: width as i32,
                    height: height as i32,
                    orientation,
                    size_bucket,
                },
            )
            .await?;

        jobs::dispatch(
            &self.db,
            JobPayload::ExtractSheetMetadata {
                sheet_id: sheet.id,
                preferred_template_id: None,
            },
        )
        .await?;

        debug!(drawing_set_id = set.id, page, width, height, "Page rendered");
        Ok(())
    }
}
