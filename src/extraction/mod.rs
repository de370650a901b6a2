//! Tiered title-block extraction for a single sheet.
//!
//! Strategies run in a fixed order and stop early once something is good
//! enough:
//!
//! 1. A preferred template, when the caller names one. It is the only
//!    template tried.
//! 2. Otherwise the two best-matching project templates.
//! 3. A heuristic bottom-right crop, unless the page is too large to decode.
//! 4. The full page.
//!
//! Every attempt is recorded so failures can be reviewed later.

mod field_mappings;
mod persist;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crop::ImageCropService;
use crate::events::ProgressBroadcaster;
use crate::models::{ExtractionStatus, Sheet, TitleBlockTemplate};
use crate::ocr::{Answer, ExtractedFields, QueryExtraction, TextractService};
use crate::repository::DbContext;
use crate::storage::ObjectStorage;
use crate::validation::{MetadataValidator, ValidationReport};

pub use field_mappings::pad_small_region;

/// Templates tried when no preferred template is given.
const AUTO_TEMPLATE_LIMIT: usize = 2;

/// Confidence at which a passing template result ends the search.
const TEMPLATE_ACCEPT_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptMethod {
    PreferredTemplate,
    Template,
    Heuristic,
    FullPage,
}

/// Outcome of one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptResult {
    pub passes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<ExtractedFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub raw: BTreeMap<String, Answer>,
    pub overall_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_template_id: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub used_field_mappings: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub full_page_fallback: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped_heuristic_cropping: bool,
}

impl AttemptResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            passes: false,
            fields: None,
            validation: None,
            raw: BTreeMap::new(),
            overall_confidence: 0.0,
            error: Some(error.into()),
            used_template_id: None,
            used_field_mappings: false,
            full_page_fallback: false,
            skipped_heuristic_cropping: false,
        }
    }

    /// Validate extracted fields into a scored result.
    pub fn validated(
        fields: ExtractedFields,
        raw: BTreeMap<String, Answer>,
        validator: &MetadataValidator,
        skip_strict_checks: bool,
    ) -> Self {
        let validation = validator.validate(&fields, skip_strict_checks);
        Self {
            passes: validation.passes,
            overall_confidence: validation.overall_confidence(),
            fields: Some(fields),
            validation: Some(validation),
            raw,
            error: None,
            used_template_id: None,
            used_field_mappings: false,
            full_page_fallback: false,
            skipped_heuristic_cropping: false,
        }
    }

    fn from_queries(extraction: QueryExtraction, validator: &MetadataValidator) -> Self {
        match (extraction.success, extraction.fields) {
            (true, Some(fields)) => Self::validated(fields, extraction.raw, validator, false),
            _ => Self::failure(
                extraction
                    .error
                    .unwrap_or_else(|| "Textract extraction failed".to_string()),
            ),
        }
    }

    fn with_template(mut self, template_id: i32) -> Self {
        self.used_template_id = Some(template_id);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub method: AttemptMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i32>,
    pub result: AttemptResult,
}

/// Keep the better of the held result and a new one.
///
/// Passing beats failing; otherwise strictly higher confidence wins and
/// ties keep what is already held.
pub fn compare_best(current: Option<AttemptResult>, new: AttemptResult) -> AttemptResult {
    let Some(current) = current else {
        return new;
    };
    match (current.passes, new.passes) {
        (false, true) => new,
        (true, false) => current,
        _ if new.overall_confidence > current.overall_confidence => new,
        _ => current,
    }
}

fn is_settled(best: &Option<AttemptResult>) -> bool {
    best.as_ref().is_some_and(|b| b.passes)
}

/// Runs the extraction strategies for sheets and persists the outcome.
#[derive(Clone)]
pub struct SheetExtractor {
    db: DbContext,
    storage: Arc<dyn ObjectStorage>,
    textract: TextractService,
    crop: ImageCropService,
    validator: MetadataValidator,
    events: ProgressBroadcaster,
}

impl SheetExtractor {
    pub fn new(
        db: DbContext,
        storage: Arc<dyn ObjectStorage>,
        textract: TextractService,
        validator: MetadataValidator,
        events: ProgressBroadcaster,
    ) -> Self {
        Self {
            crop: ImageCropService::new(storage.clone()),
            db,
            storage,
            textract,
            validator,
            events,
        }
    }

    pub fn textract(&self) -> &TextractService {
        &self.textract
    }

    pub fn crop_service(&self) -> &ImageCropService {
        &self.crop
    }

    /// Extract and persist metadata for one sheet.
    ///
    /// Returns the final extraction status, or `None` when the sheet does
    /// not exist. Strategy failures are recorded on the sheet; only database
    /// errors outside the strategy phase are returned.
    pub async fn extract_sheet(
        &self,
        sheet_id: i32,
        preferred_template_id: Option<i32>,
    ) -> anyhow::Result<Option<ExtractionStatus>> {
        info!(sheet_id, ?preferred_template_id, "Extracting sheet metadata");

        let Some(sheet) = self.db.sheets().get(sheet_id).await? else {
            warn!(sheet_id, "Sheet not found for extraction");
            return Ok(None);
        };

        let Some(preview_key) = sheet.page_preview_key.clone() else {
            warn!(sheet_id, "Sheet has no preview image");
            self.db
                .sheets()
                .mark_failed(sheet_id, &serde_json::json!({"error": "No preview image available"}))
                .await?;
            return Ok(Some(ExtractionStatus::Failed));
        };

        self.db
            .sheets()
            .set_extraction_status(sheet_id, ExtractionStatus::Processing)
            .await?;

        let skip_heuristic = sheet.skips_heuristic_cropping();
        if skip_heuristic {
            info!(
                sheet_id,
                width = ?sheet.page_width_px,
                height = ?sheet.page_height_px,
                estimated_mb = sheet.estimated_bitmap_bytes() / (1024 * 1024),
                "Large image, skipping heuristic cropping"
            );
        }

        let mut attempts = Vec::new();
        let outcome = self
            .run_strategies(&sheet, &preview_key, preferred_template_id, skip_heuristic, &mut attempts)
            .await;

        let status = match outcome {
            Ok(best) => {
                self.save_extraction_result(&sheet, best.as_ref(), &attempts, skip_heuristic)
                    .await?
            }
            Err(e) => {
                warn!(sheet_id, "Extraction failed: {:#}", e);
                let errors = serde_json::json!({
                    "error": e.to_string(),
                    "attempts": attempts,
                });
                self.db.sheets().mark_failed(sheet_id, &errors).await?;
                self.finish_set(&sheet, ExtractionStatus::Failed, None).await;
                ExtractionStatus::Failed
            }
        };

        info!(sheet_id, status = status.as_str(), attempts = attempts.len(), "Extraction finished");
        Ok(Some(status))
    }

    async fn run_strategies(
        &self,
        sheet: &Sheet,
        preview_key: &str,
        preferred_template_id: Option<i32>,
        skip_heuristic: bool,
        attempts: &mut Vec<Attempt>,
    ) -> anyhow::Result<Option<AttemptResult>> {
        let mut best: Option<AttemptResult> = None;

        let preferred = match preferred_template_id {
            Some(id) => self
                .db
                .templates()
                .get(id)
                .await?
                .filter(|t| t.project_id == sheet.project_id),
            None => None,
        };

        if let Some(template) = &preferred {
            info!(sheet_id = sheet.id, template_id = template.id, name = %template.name, "Using preferred template");
            let result = self.attempt_template(sheet, preview_key, template).await;
            if result.passes {
                self.db.templates().record_success(template.id).await?;
            }
            attempts.push(Attempt {
                method: AttemptMethod::PreferredTemplate,
                template_id: Some(template.id),
                result: result.clone(),
            });
            best = Some(result);
        } else {
            let templates = self.db.templates().list_for_project(sheet.project_id).await?;
            let matches = TitleBlockTemplate::find_best_matches(
                &templates,
                sheet.page_orientation,
                sheet.size_bucket.as_deref(),
                AUTO_TEMPLATE_LIMIT,
            );

            for (score, template) in matches {
                debug!(sheet_id = sheet.id, template_id = template.id, score, "Trying template");
                let result = self.attempt_template(sheet, preview_key, &template).await;
                attempts.push(Attempt {
                    method: AttemptMethod::Template,
                    template_id: Some(template.id),
                    result: result.clone(),
                });

                let accepted =
                    result.passes && result.overall_confidence >= TEMPLATE_ACCEPT_CONFIDENCE;
                best = Some(compare_best(best, result));
                if accepted {
                    self.db.templates().record_success(template.id).await?;
                    break;
                }
            }
        }

        if !is_settled(&best) && !skip_heuristic {
            let result = self.attempt_heuristic(preview_key).await;
            attempts.push(Attempt {
                method: AttemptMethod::Heuristic,
                template_id: None,
                result: result.clone(),
            });
            if result.passes {
                best = Some(compare_best(best, result));
            }
        }

        if !is_settled(&best) {
            let mut result = self.attempt_full_page(preview_key).await;
            result.full_page_fallback = true;
            result.skipped_heuristic_cropping = skip_heuristic;
            attempts.push(Attempt {
                method: AttemptMethod::FullPage,
                template_id: None,
                result: result.clone(),
            });
            best = Some(compare_best(best, result));
        }

        Ok(best)
    }

    async fn attempt_template(
        &self,
        sheet: &Sheet,
        preview_key: &str,
        template: &TitleBlockTemplate,
    ) -> AttemptResult {
        debug!(
            sheet_id = sheet.id,
            template_id = template.id,
            crop = ?template.crop_rect,
            has_field_mappings = template.mappings().is_some(),
            "Template extraction"
        );

        if let Some(mappings) = template.mappings() {
            return field_mappings::extract(
                &self.crop,
                &self.textract,
                &self.validator,
                preview_key,
                &template.crop_rect,
                mappings,
            )
            .await
            .with_template(template.id);
        }

        let Some(cropped) = self.crop.crop_image(preview_key, &template.crop_rect).await else {
            warn!(sheet_id = sheet.id, template_id = template.id, "Template crop failed");
            return AttemptResult::failure("Failed to crop image with template")
                .with_template(template.id);
        };

        let extraction = self.textract.extract_from_bytes(&cropped).await;
        AttemptResult::from_queries(extraction, &self.validator).with_template(template.id)
    }

    async fn attempt_heuristic(&self, preview_key: &str) -> AttemptResult {
        let Some(cropped) = self.crop.crop_heuristic(preview_key).await else {
            return AttemptResult::failure("Failed to crop image with heuristic");
        };
        let extraction = self.textract.extract_from_bytes(&cropped).await;
        AttemptResult::from_queries(extraction, &self.validator)
    }

    async fn attempt_full_page(&self, preview_key: &str) -> AttemptResult {
        let extraction = match self.storage.textract_location(preview_key) {
            Some(location) => self.textract.extract_from_s3(&location).await,
            None => match self.storage.get(preview_key).await {
                Ok(bytes) => self.textract.extract_from_bytes(&bytes).await,
                Err(e) => return AttemptResult::failure(e.to_string()),
            },
        };
        AttemptResult::from_queries(extraction, &self.validator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(passes: bool, confidence: f64) -> AttemptResult {
        let mut r = AttemptResult::failure("x");
        r.passes = passes;
        r.overall_confidence = confidence;
        r
    }

    #[test]
    fn test_compare_best_prefers_passing() {
        let best = compare_best(Some(result(false, 0.9)), result(true, 0.2));
        assert!(best.passes);
        let best = compare_best(Some(result(true, 0.2)), result(false, 0.9));
        assert!(best.passes);
        assert_eq!(best.overall_confidence, 0.2);
    }

    #[test]
    fn test_compare_best_confidence_and_ties() {
        let best = compare_best(Some(result(true, 0.6)), result(true, 0.8));
        assert_eq!(best.overall_confidence, 0.8);

        let mut held = result(false, 0.5);
        held.used_template_id = Some(1);
        let best = compare_best(Some(held), result(false, 0.5).with_template(2));
        assert_eq!(best.used_template_id, Some(1));

        let best = compare_best(None, result(false, 0.0));
        assert!(!best.passes);
    }

    #[test]
    fn test_attempt_serialization() {
        let attempt = Attempt {
            method: AttemptMethod::PreferredTemplate,
            template_id: Some(3),
            result: AttemptResult::failure("Failed to crop image with template").with_template(3),
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["method"], "preferred_template");
        assert_eq!(json["result"]["error"], "Failed to crop image with template");
        assert_eq!(json["result"]["passes"], false);
        assert!(json["result"].get("full_page_fallback").is_none());
    }
}
