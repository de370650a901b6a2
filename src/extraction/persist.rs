//! Writing extraction outcomes back to the sheet, revision linking, and
//! set-level progress.

use serde_json::{json, Value};
use tracing::{info, warn};

use super::{Attempt, AttemptResult, SheetExtractor};
use crate::events::SheetProgress;
use crate::models::{ExtractionStatus, Sheet};
use crate::repository::ExtractionUpdate;

const LARGE_IMAGE_NOTE: &str = "Image too large for auto-cropping - full page analysis used. \
Results may be less accurate. Create a template by clicking \"Draw Template\" for better extraction.";

/// Review payload for a result that did not pass validation.
fn review_errors(result: &AttemptResult, skipped_heuristic_cropping: bool) -> Value {
    let mut errors = match &result.validation {
        Some(v) => json!({
            "validation_errors": v.overall_errors,
            "field_errors": {
                "drawing_number": v.drawing_number.errors,
                "drawing_title": v.drawing_title.errors,
                "revision": v.revision.errors,
            },
        }),
        None => json!({ "validation_errors": [], "field_errors": {} }),
    };

    errors["best_guesses"] = match &result.fields {
        Some(f) => json!({
            "drawing_number": f.drawing_number.text,
            "drawing_title": f.drawing_title.text,
            "revision": f.revision.text,
        }),
        None => json!({}),
    };

    if skipped_heuristic_cropping && result.used_template_id.is_none() {
        errors["note"] = json!(LARGE_IMAGE_NOTE);
    }
    errors
}

/// Column values for a result that produced fields.
fn extraction_update(result: &AttemptResult, skipped_heuristic_cropping: bool) -> ExtractionUpdate {
    let (extraction_status, extraction_errors) = if result.passes {
        (ExtractionStatus::Success, None)
    } else {
        (
            ExtractionStatus::NeedsReview,
            Some(review_errors(result, skipped_heuristic_cropping)),
        )
    };

    let v = result.validation.as_ref();
    ExtractionUpdate {
        drawing_number: v.and_then(|v| v.drawing_number.value.clone()),
        drawing_title: v.and_then(|v| v.drawing_title.value.clone()),
        revision: v.and_then(|v| v.revision.value.clone()),
        confidence_number: v.map(|v| v.drawing_number.confidence),
        confidence_title: v.map(|v| v.drawing_title.confidence),
        confidence_revision: v.map(|v| v.revision.confidence),
        used_template_id: result.used_template_id,
        extraction_raw: json!({
            "fields": result.fields,
            "raw_queries": result.raw,
            "used_field_mappings": result.used_field_mappings,
        }),
        extraction_status,
        extraction_errors,
    }
}

impl SheetExtractor {
    pub(super) async fn save_extraction_result(
        &self,
        sheet: &Sheet,
        best: Option<&AttemptResult>,
        attempts: &[Attempt],
        skipped_heuristic_cropping: bool,
    ) -> anyhow::Result<ExtractionStatus> {
        let Some(result) = best.filter(|b| b.fields.is_some()) else {
            let errors = json!({
                "error": "No extraction result available",
                "attempts": attempts,
            });
            self.db.sheets().mark_failed(sheet.id, &errors).await?;
            self.finish_set(sheet, ExtractionStatus::Failed, None).await;
            return Ok(ExtractionStatus::Failed);
        };

        let update = extraction_update(result, skipped_heuristic_cropping);
        self.db.sheets().save_extraction(sheet.id, &update).await?;

        self.link_to_drawing_sheet(sheet, &update).await;
        self.finish_set(sheet, update.extraction_status, Some(&update))
            .await;

        Ok(update.extraction_status)
    }

    /// Group the sheet with earlier revisions of the same drawing number.
    async fn link_to_drawing_sheet(&self, sheet: &Sheet, update: &ExtractionUpdate) {
        let Some(number) = update.drawing_number.as_deref().filter(|n| !n.is_empty()) else {
            return;
        };
        if sheet.drawing_sheet_id.is_some() {
            return;
        }

        let linked = async {
            let drawing_sheet = self
                .db
                .drawing_sheets()
                .find_or_create_by_drawing_number(
                    sheet.project_id,
                    number,
                    update.drawing_title.as_deref(),
                )
                .await?;
            let revision = self
                .db
                .drawing_sheets()
                .add_revision(drawing_sheet.id, sheet.id, update.revision.as_deref())
                .await?;
            Ok::<_, crate::repository::DieselError>((drawing_sheet.id, revision))
        }
        .await;

        match linked {
            Ok((drawing_sheet_id, revision)) => info!(
                sheet_id = sheet.id,
                drawing_sheet_id,
                drawing_number = number,
                %revision,
                "Linked sheet to drawing sheet"
            ),
            Err(e) => warn!(
                sheet_id = sheet.id,
                drawing_number = number,
                "Failed to link sheet to drawing sheet: {}",
                e
            ),
        }
    }

    /// Recompute the set status and broadcast the sheet's outcome.
    pub(crate) async fn finish_set(
        &self,
        sheet: &Sheet,
        status: ExtractionStatus,
        update: Option<&ExtractionUpdate>,
    ) {
        if let Err(e) = self
            .db
            .drawing_sets()
            .update_status_from_sheets(sheet.drawing_set_id)
            .await
        {
            warn!(
                drawing_set_id = sheet.drawing_set_id,
                "Failed to update drawing set status: {}", e
            );
        }

        let progress = SheetProgress {
            sheet_id: sheet.id,
            page_number: sheet.page_number,
            extraction_status: Some(status),
            drawing_number: update.map_or(sheet.drawing_number.clone(), |u| u.drawing_number.clone()),
            drawing_title: update.map_or(sheet.drawing_title.clone(), |u| u.drawing_title.clone()),
            revision: update.map_or(sheet.revision.clone(), |u| u.revision.clone()),
        };
        self.events
            .publish_progress(&self.db, sheet.drawing_set_id, Some(progress), None)
            .await;
    }

    /// Failure hook once an extraction job has used up its retries.
    pub async fn mark_permanently_failed(&self, sheet_id: i32, error: &str) -> anyhow::Result<()> {
        let Some(sheet) = self.db.sheets().get(sheet_id).await? else {
            return Ok(());
        };
        let errors = json!({
            "error": error,
            "failed_at": chrono::Utc::now().to_rfc3339(),
        });
        self.db.sheets().mark_failed(sheet_id, &errors).await?;
        self.finish_set(&sheet, ExtractionStatus::Failed, None).await;
        Ok(())
    }
}
