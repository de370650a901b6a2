//! A single page of a drawing set and its extracted title-block metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geometry::Orientation;
use super::status::{ExtractionStatus, SheetStatus};

/// Uncompressed RGBA budget above which heuristic cropping is skipped.
pub const MAX_HEURISTIC_CROP_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    pub id: i32,
    pub drawing_set_id: i32,
    pub project_id: i32,
    pub page_number: i32,
    pub page_preview_key: Option<String>,
    pub thumbnail_key: Option<String>,
    pub page_width_px: Option<i32>,
    pub page_height_px: Option<i32>,
    pub page_orientation: Option<Orientation>,
    pub size_bucket: Option<String>,
    pub drawing_number: Option<String>,
    pub drawing_title: Option<String>,
    pub revision: Option<String>,
    pub extraction_status: ExtractionStatus,
    pub confidence_number: Option<f64>,
    pub confidence_title: Option<f64>,
    pub confidence_revision: Option<f64>,
    pub used_template_id: Option<i32>,
    pub extraction_raw: Option<serde_json::Value>,
    pub extraction_errors: Option<serde_json::Value>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub drawing_sheet_id: Option<i32>,
    pub previous_revision_id: Option<i32>,
    pub revision_number: Option<String>,
    pub status: SheetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sheet {
    /// Estimated RGBA bitmap size in bytes (4 bytes per pixel).
    pub fn estimated_bitmap_bytes(&self) -> u64 {
        let w = self.page_width_px.unwrap_or(0).max(0) as u64;
        let h = self.page_height_px.unwrap_or(0).max(0) as u64;
        w * h * 4
    }

    /// Whether the page is too large to decode for heuristic cropping.
    pub fn skips_heuristic_cropping(&self) -> bool {
        self.estimated_bitmap_bytes() > MAX_HEURISTIC_CROP_BYTES
    }

    /// UI path for the thumbnail, if one was rendered.
    pub fn thumbnail_url(&self) -> Option<String> {
        self.thumbnail_key
            .as_ref()
            .map(|_| format!("/drawing-sheets/{}/thumbnail", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet_with_size(w: Option<i32>, h: Option<i32>) -> Sheet {
        let now = Utc::now();
        Sheet {
            id: 7,
            drawing_set_id: 1,
            project_id: 1,
            page_number: 1,
            page_preview_key: None,
            thumbnail_key: None,
            page_width_px: w,
            page_height_px: h,
            page_orientation: None,
            size_bucket: None,
            drawing_number: None,
            drawing_title: None,
            revision: None,
            extraction_status: ExtractionStatus::Queued,
            confidence_number: None,
            confidence_title: None,
            confidence_revision: None,
            used_template_id: None,
            extraction_raw: None,
            extraction_errors: None,
            extracted_at: None,
            drawing_sheet_id: None,
            previous_revision_id: None,
            revision_number: None,
            status: SheetStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_a1_at_300dpi_is_cropped() {
        // A1 landscape at 300 DPI: ~134 MB of RGBA
        let sheet = sheet_with_size(Some(9933), Some(7016));
        assert!(!sheet.skips_heuristic_cropping());
    }

    #[test]
    fn test_a0_at_300dpi_skips_cropping() {
        // A0 landscape at 300 DPI: ~268 MB of RGBA
        let sheet = sheet_with_size(Some(14043), Some(9933));
        assert!(sheet.skips_heuristic_cropping());
    }

    #[test]
    fn test_unknown_dimensions_do_not_skip() {
        assert!(!sheet_with_size(None, None).skips_heuristic_cropping());
    }

    #[test]
    fn test_thumbnail_url() {
        let mut sheet = sheet_with_size(None, None);
        assert_eq!(sheet.thumbnail_url(), None);
        sheet.thumbnail_key = Some("drawing-thumbnails/1/1/thumb_0001.jpg".into());
        assert_eq!(
            sheet.thumbnail_url().as_deref(),
            Some("/drawing-sheets/7/thumbnail")
        );
    }
}
