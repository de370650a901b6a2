//! Extraction from user-drawn field regions.
//!
//! Each mapped field is cropped on its own and all text inside is read.
//! The user chose the region, so validation only checks for emptiness.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::AttemptResult;
use crate::crop::ImageCropService;
use crate::models::{FieldMappings, Rect};
use crate::ocr::{AnswerBox, ExtractedFields, FieldAnswer, TextractService};
use crate::validation::MetadataValidator;

/// Smallest region (fraction of the page) the OCR service reliably reads.
const MIN_WIDTH: f64 = 0.025;
const MIN_HEIGHT: f64 = 0.02;
/// Revision boxes often hold a single letter and need more context.
const MIN_REVISION_WIDTH: f64 = 0.045;
const MIN_REVISION_HEIGHT: f64 = 0.035;

/// Grow a region below the minimum size symmetrically, shifting it back
/// inside the page when it crosses an edge.
pub fn pad_small_region(rect: &Rect, field: &str) -> Rect {
    let (min_w, min_h) = if field == "revision" {
        (MIN_REVISION_WIDTH, MIN_REVISION_HEIGHT)
    } else {
        (MIN_WIDTH, MIN_HEIGHT)
    };

    if rect.w >= min_w && rect.h >= min_h {
        return *rect;
    }

    let w = rect.w.max(min_w);
    let h = rect.h.max(min_h);
    let mut x = (rect.x - (w - rect.w) / 2.0).max(0.0);
    let mut y = (rect.y - (h - rect.h) / 2.0).max(0.0);
    if x + w > 1.0 {
        x = (1.0 - w).max(0.0);
    }
    if y + h > 1.0 {
        y = (1.0 - h).max(0.0);
    }

    Rect {
        x,
        y,
        w: w.min(1.0 - x),
        h: h.min(1.0 - y),
    }
}

async fn read_field(
    crop: &ImageCropService,
    textract: &TextractService,
    preview_key: &str,
    crop_rect: &Rect,
    mappings: &FieldMappings,
    field: &str,
) -> FieldAnswer {
    let mut answer = FieldAnswer {
        text: String::new(),
        confidence: 0.0,
        source_alias: field.to_string(),
        bounding_box: None,
    };

    let Some(mapping) = mappings.get(field) else {
        debug!(field, "No field mapping");
        return answer;
    };
    let Some(region) = mapping.page_rect(crop_rect) else {
        warn!(field, ?mapping, "Field mapping has no usable coordinates");
        return answer;
    };

    let padded = pad_small_region(&region, field);
    if padded != region {
        debug!(field, ?region, ?padded, "Padded small field region");
    }

    let Some(bytes) = crop.crop_image(preview_key, &padded).await else {
        warn!(field, ?region, "Field crop failed");
        return answer;
    };

    let read = textract.extract_all_text_from_region(&bytes).await;
    debug!(field, text = %read.text, confidence = read.confidence, success = read.success, "Field region read");

    answer.text = read.text;
    answer.confidence = read.confidence;
    answer.bounding_box = Some(AnswerBox {
        left: region.x,
        top: region.y,
        width: region.w,
        height: region.h,
    });
    answer
}

pub(super) async fn extract(
    crop: &ImageCropService,
    textract: &TextractService,
    validator: &MetadataValidator,
    preview_key: &str,
    crop_rect: &Rect,
    mappings: &FieldMappings,
) -> AttemptResult {
    let read = |field: &'static str| read_field(crop, textract, preview_key, crop_rect, mappings, field);

    let fields = ExtractedFields {
        drawing_number: read("drawing_number").await,
        drawing_title: read("drawing_title").await,
        revision: read("revision").await,
    };

    let mut result = AttemptResult::validated(fields, BTreeMap::new(), validator, true);
    result.used_field_mappings = true;
    result
}
