//! Shared helpers for CLI commands.

use std::sync::Arc;

use console::style;

use crate::config::Settings;
use crate::events::ProgressBroadcaster;
use crate::extraction::SheetExtractor;
use crate::jobs::Worker;
use crate::models::Rect;
use crate::ocr::TextractService;
use crate::render::{DrawingSetProcessor, PageRenderer};
use crate::repository::DbContext;
use crate::storage::{self, ObjectStorage};
use crate::validation::MetadataValidator;

/// Open the database, failing with a hint when `init` has not been run.
pub fn open_db(settings: &Settings) -> anyhow::Result<DbContext> {
    if !settings.database_exists() {
        anyhow::bail!(
            "No database at {}. Run 'drawmeta init' first.",
            settings.database_path().display()
        );
    }
    Ok(settings.create_db_context())
}

/// Everything the job worker needs, wired from settings.
pub struct Pipeline {
    pub storage: Arc<dyn ObjectStorage>,
    pub events: ProgressBroadcaster,
    pub extractor: SheetExtractor,
    pub worker: Worker,
}

impl Pipeline {
    pub async fn from_settings(settings: &Settings, db: &DbContext) -> Self {
        let storage = storage::from_backend(&settings.storage).await;
        let events = ProgressBroadcaster::new();
        let textract = TextractService::from_settings(&settings.textract).await;

        let processor = DrawingSetProcessor::new(
            db.clone(),
            storage.clone(),
            PageRenderer::new(settings.pdftoppm_path.as_deref()),
            events.clone(),
        );
        let extractor = SheetExtractor::new(
            db.clone(),
            storage.clone(),
            textract,
            MetadataValidator::new(settings.thresholds),
            events.clone(),
        );
        let worker = Worker::new(db.clone(), processor, extractor.clone());

        Self {
            storage,
            events,
            extractor,
            worker,
        }
    }
}

/// clap value parser for "x,y,w,h" in normalised page coordinates.
pub fn parse_rect(s: &str) -> Result<Rect, String> {
    let rect = Rect::parse(s).ok_or_else(|| format!("expected x,y,w,h but got '{}'", s))?;
    let in_unit = |v: f64| (0.0..=1.0).contains(&v);
    if !(in_unit(rect.x) && in_unit(rect.y) && in_unit(rect.w) && in_unit(rect.h)) {
        return Err("coordinates must be between 0 and 1".to_string());
    }
    if rect.w == 0.0 || rect.h == 0.0 {
        return Err("width and height must be greater than 0".to_string());
    }
    Ok(rect)
}

/// Value or a dim dash.
pub fn or_dash(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => style("-").dim().to_string(),
    }
}

/// Confidence as a whole percentage.
pub fn percent(confidence: Option<f64>) -> String {
    confidence
        .map(|c| format!("{:.0}%", c * 100.0))
        .unwrap_or_else(|| style("-").dim().to_string())
}
