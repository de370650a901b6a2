//! Progress updates for drawing set processing.
//!
//! Updates go out on a `tokio::sync::broadcast` channel. Publishing never
//! fails the caller: a missing subscriber or a lookup error is a warning.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::{DrawingSetStatus, ExtractionStats, ExtractionStatus};
use crate::repository::{DbContext, DieselError};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingUpdate {
    pub project_id: i32,
    pub drawing_set_id: i32,
    pub status: DrawingSetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_status: Option<ExtractionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawing_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawing_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ExtractionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Per-sheet part of an update.
#[derive(Debug, Clone, Default)]
pub struct SheetProgress {
    pub sheet_id: i32,
    pub page_number: i32,
    pub extraction_status: Option<ExtractionStatus>,
    pub drawing_number: Option<String>,
    pub drawing_title: Option<String>,
    pub revision: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    sender: broadcast::Sender<ProcessingUpdate>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingUpdate> {
        self.sender.subscribe()
    }

    pub fn publish(&self, update: ProcessingUpdate) {
        let set_id = update.drawing_set_id;
        match self.sender.send(update) {
            Ok(receivers) => debug!(drawing_set_id = set_id, receivers, "Published progress"),
            Err(_) => warn!(drawing_set_id = set_id, "No listeners for progress update"),
        }
    }

    /// Publish the set's current status, stats, and cover thumbnail along with
    /// an optional sheet detail and message.
    pub async fn publish_progress(
        &self,
        db: &DbContext,
        drawing_set_id: i32,
        sheet: Option<SheetProgress>,
        message: Option<&str>,
    ) {
        match build_update(db, drawing_set_id, sheet, message).await {
            Ok(Some(update)) => self.publish(update),
            Ok(None) => warn!(drawing_set_id, "Drawing set vanished before progress update"),
            Err(e) => warn!(drawing_set_id, "Failed to broadcast progress: {}", e),
        }
    }
}

async fn build_update(
    db: &DbContext,
    drawing_set_id: i32,
    sheet: Option<SheetProgress>,
    message: Option<&str>,
) -> Result<Option<ProcessingUpdate>, DieselError> {
    let Some(set) = db.drawing_sets().get(drawing_set_id).await? else {
        return Ok(None);
    };
    let stats = db.drawing_sets().extraction_stats(drawing_set_id).await?;
    let thumbnail_url = db
        .sheets()
        .get_page(drawing_set_id, 1)
        .await?
        .and_then(|first| first.thumbnail_url());

    let sheet = sheet.unwrap_or_default();
    let has_sheet = sheet.sheet_id != 0;

    Ok(Some(ProcessingUpdate {
        project_id: set.project_id,
        drawing_set_id: set.id,
        status: set.status,
        sheet_id: has_sheet.then_some(sheet.sheet_id),
        page_number: has_sheet.then_some(sheet.page_number),
        extraction_status: sheet.extraction_status,
        drawing_number: sheet.drawing_number,
        drawing_title: sheet.drawing_title,
        revision: sheet.revision,
        stats: Some(stats),
        thumbnail_url,
        message: message.map(String::from),
    }))
}
