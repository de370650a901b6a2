//! Sheet persistence: per-page render results, extraction results, and
//! revision links.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde_json::Value;

use super::diesel_models::{NewSheet, SheetRecord};
use super::pool::{AsyncSqlitePool, DieselError};
use super::util::{
    now_rfc3339, parse_datetime, parse_datetime_opt, parse_json_opt, parse_status,
};
use crate::models::{DrawingSet, ExtractionStatus, Orientation, Sheet, SheetStatus};
use crate::schema::sheets;

impl From<SheetRecord> for Sheet {
    fn from(r: SheetRecord) -> Self {
        Sheet {
            id: r.id,
            drawing_set_id: r.drawing_set_id,
            project_id: r.project_id,
            page_number: r.page_number,
            page_preview_key: r.page_preview_key,
            thumbnail_key: r.thumbnail_key,
            page_width_px: r.page_width_px,
            page_height_px: r.page_height_px,
            page_orientation: r.page_orientation.as_deref().and_then(Orientation::from_str),
            size_bucket: r.size_bucket,
            drawing_number: r.drawing_number,
            drawing_title: r.drawing_title,
            revision: r.revision,
            extraction_status: parse_status(
                "sheets",
                r.id,
                &r.extraction_status,
                ExtractionStatus::from_str,
                ExtractionStatus::Queued,
            ),
            confidence_number: r.confidence_number,
            confidence_title: r.confidence_title,
            confidence_revision: r.confidence_revision,
            used_template_id: r.used_template_id,
            extraction_raw: parse_json_opt(r.extraction_raw.as_deref()),
            extraction_errors: parse_json_opt(r.extraction_errors.as_deref()),
            extracted_at: parse_datetime_opt(r.extracted_at),
            drawing_sheet_id: r.drawing_sheet_id,
            previous_revision_id: r.previous_revision_id,
            revision_number: r.revision_number,
            status: parse_status(
                "sheets",
                r.id,
                &r.status,
                SheetStatus::from_str,
                SheetStatus::Draft,
            ),
            created_at: parse_datetime(&r.created_at),
            updated_at: parse_datetime(&r.updated_at),
        }
    }
}

/// Output of rendering one page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub preview_key: String,
    pub thumbnail_key: Option<String>,
    pub width: i32,
    pub height: i32,
    pub orientation: Orientation,
    pub size_bucket: String,
}

/// Values written when an extraction finishes.
#[derive(Debug, Clone)]
pub struct ExtractionUpdate {
    pub drawing_number: Option<String>,
    pub drawing_title: Option<String>,
    pub revision: Option<String>,
    pub confidence_number: Option<f64>,
    pub confidence_title: Option<f64>,
    pub confidence_revision: Option<f64>,
    pub used_template_id: Option<i32>,
    pub extraction_raw: Value,
    pub extraction_status: ExtractionStatus,
    /// `None` clears any earlier errors.
    pub extraction_errors: Option<Value>,
}

#[derive(Clone)]
pub struct SheetRepository {
    pool: AsyncSqlitePool,
}

impl SheetRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    /// Create one queued draft sheet per page. Existing pages are left alone.
    ///
    /// Returns the sheet ids in page order.
    pub async fn create_for_set(&self, set: &DrawingSet) -> Result<Vec<i32>, DieselError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        let rows: Vec<NewSheet> = (1..=set.page_count)
            .map(|page_number| NewSheet {
                drawing_set_id: set.id,
                project_id: set.project_id,
                page_number,
                extraction_status: ExtractionStatus::Queued.as_str(),
                status: SheetStatus::Draft.as_str(),
                created_at: &now,
                updated_at: &now,
            })
            .collect();

        diesel::insert_or_ignore_into(sheets::table)
            .values(&rows)
            .execute(&mut conn)
            .await?;

        sheets::table
            .filter(sheets::drawing_set_id.eq(set.id))
            .order(sheets::page_number.asc())
            .select(sheets::id)
            .load(&mut conn)
            .await
    }

    pub async fn get(&self, id: i32) -> Result<Option<Sheet>, DieselError> {
        let mut conn = self.pool.get().await?;

        sheets::table
            .find(id)
            .first::<SheetRecord>(&mut conn)
            .await
            .optional()
            .map(|opt| opt.map(Sheet::from))
    }

    /// Sheets of a set in page order.
    pub async fn list_for_set(&self, drawing_set_id: i32) -> Result<Vec<Sheet>, DieselError> {
        let mut conn = self.pool.get().await?;

        sheets::table
            .filter(sheets::drawing_set_id.eq(drawing_set_id))
            .order(sheets::page_number.asc())
            .load::<SheetRecord>(&mut conn)
            .await
            .map(|records| records.into_iter().map(Sheet::from).collect())
    }

    pub async fn get_page(
        &self,
        drawing_set_id: i32,
        page_number: i32,
    ) -> Result<Option<Sheet>, DieselError> {
        let mut conn = self.pool.get().await?;

        sheets::table
            .filter(sheets::drawing_set_id.eq(drawing_set_id))
            .filter(sheets::page_number.eq(page_number))
            .first::<SheetRecord>(&mut conn)
            .await
            .optional()
            .map(|opt| opt.map(Sheet::from))
    }

    pub async fn set_extraction_status(
        &self,
        id: i32,
        status: ExtractionStatus,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(sheets::table.find(id))
            .set((
                sheets::extraction_status.eq(status.as_str()),
                sheets::updated_at.eq(now_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Mark extraction failed with an error payload.
    pub async fn mark_failed(&self, id: i32, errors: &Value) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(sheets::table.find(id))
            .set((
                sheets::extraction_status.eq(ExtractionStatus::Failed.as_str()),
                sheets::extraction_errors.eq(Some(errors.to_string())),
                sheets::updated_at.eq(now_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Clear extracted values and queue the sheet for a fresh extraction.
    /// Render output and revision links are kept.
    pub async fn reset_extraction(&self, id: i32) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(sheets::table.find(id))
            .set((
                sheets::extraction_status.eq(ExtractionStatus::Queued.as_str()),
                sheets::extraction_errors.eq(None::<String>),
                sheets::used_template_id.eq(None::<i32>),
                sheets::extraction_raw.eq(None::<String>),
                sheets::drawing_number.eq(None::<String>),
                sheets::drawing_title.eq(None::<String>),
                sheets::revision.eq(None::<String>),
                sheets::confidence_number.eq(None::<f64>),
                sheets::confidence_title.eq(None::<f64>),
                sheets::confidence_revision.eq(None::<f64>),
                sheets::extracted_at.eq(None::<String>),
                sheets::updated_at.eq(now_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Store render output and queue the sheet for extraction.
    pub async fn save_rendered(&self, id: i32, page: &RenderedPage) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;

        diesel::update(sheets::table.find(id))
            .set((
                sheets::page_preview_key.eq(Some(&page.preview_key)),
                sheets::thumbnail_key.eq(page.thumbnail_key.as_ref()),
                sheets::page_width_px.eq(Some(page.width)),
                sheets::page_height_px.eq(Some(page.height)),
                sheets::page_orientation.eq(Some(page.orientation.as_str())),
                sheets::size_bucket.eq(Some(&page.size_bucket)),
                sheets::extraction_status.eq(ExtractionStatus::Queued.as_str()),
                sheets::extraction_errors.eq(None::<String>),
                sheets::updated_at.eq(now_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn save_extraction(
        &self,
        id: i32,
        update: &ExtractionUpdate,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        diesel::update(sheets::table.find(id))
            .set((
                sheets::drawing_number.eq(update.drawing_number.as_ref()),
                sheets::drawing_title.eq(update.drawing_title.as_ref()),
                sheets::revision.eq(update.revision.as_ref()),
                sheets::confidence_number.eq(update.confidence_number),
                sheets::confidence_title.eq(update.confidence_title),
                sheets::confidence_revision.eq(update.confidence_revision),
                sheets::used_template_id.eq(update.used_template_id),
                sheets::extraction_raw.eq(Some(update.extraction_raw.to_string())),
                sheets::extraction_status.eq(update.extraction_status.as_str()),
                sheets::extraction_errors.eq(update.extraction_errors.as_ref().map(|e| e.to_string())),
                sheets::extracted_at.eq(Some(&now)),
                sheets::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
