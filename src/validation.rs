//! Deterministic validation and normalisation of extracted title-block fields.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ocr::{ExtractedFields, FieldAnswer};

/// Minimum OCR confidence for each field to count as valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub number: f64,
    pub title: f64,
    pub revision: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            number: 0.50,
            title: 0.40,
            revision: 0.50,
        }
    }
}

/// How far below the number threshold a strong title or revision can carry a pass.
const RELAXED_NUMBER_MARGIN: f64 = 0.10;

const WEIGHT_NUMBER: f64 = 0.50;
const WEIGHT_TITLE: f64 = 0.30;
const WEIGHT_REVISION: f64 = 0.20;

const TITLE_PLACEHOLDERS: [&str; 8] = ["N/A", "NA", "NONE", "TBD", "TBC", "-", "--", "..."];

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static NUMBER_FORMATS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // A-101, M-201.1, E-301-A
        r"(?i)^[A-Z]{0,4}-?\d{1,4}[A-Z0-9\-.]*$",
        // ABC 1234, ABC1234-01
        r"(?i)^[A-Z]{1,6}\s?\d{1,6}(-\d{1,6})?$",
        // DWG-001, DRW123
        r"(?i)^(DWG|DRW|SK|SH|SHEET)\s?-?\s?\d{1,6}[A-Z]?$",
        // 12345, 12345-A
        r"(?i)^\d{2,6}(-?[A-Z0-9]{1,4})?$",
        // SHEET 01, SH-01
        r"(?i)^(SHEET|SH)\s?-?\s?\d{1,4}$",
        // NTA-DRW-ARC-1730-3001
        r"(?i)^[A-Z]{2,6}-[A-Z]{2,4}-[A-Z0-9\-]{3,20}$",
        // XXX-YYY-ZZZ, 123-456-789
        r"(?i)^[A-Z0-9]{2,6}-[A-Z0-9]{2,6}(-[A-Z0-9]{2,10}){0,4}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

// "REV" is tried before "REVISION", so "REVISION 2" keeps "ISION 2" and
// fails the format check.
static REVISION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(REV|REVISION|R)\s*[:.]?\s*").expect("valid regex"));

static REVISION_FORMATS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^[A-Z]{1,2}$",
        r"^\d{1,3}$",
        r"^[A-Z]\d{0,2}$",
        r"^P\d{1,2}$",
        r"^C\d?$",
        r"^FC\d?$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static ALL_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("valid regex"));

/// Outcome for one field. `value` is the normalised text when no rule failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    pub value: Option<String>,
    pub valid: bool,
    pub confidence: f64,
    pub errors: Vec<String>,
}

impl FieldValidation {
    fn empty(confidence: f64, error: &str) -> Self {
        Self {
            value: None,
            valid: false,
            confidence,
            errors: vec![error.to_string()],
        }
    }

    fn finish(normalized: String, confidence: f64, threshold: f64, errors: Vec<String>) -> Self {
        let ok = errors.is_empty();
        Self {
            value: ok.then_some(normalized),
            valid: ok && confidence >= threshold,
            confidence,
            errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passes: bool,
    pub drawing_number: FieldValidation,
    pub drawing_title: FieldValidation,
    pub revision: FieldValidation,
    pub overall_errors: Vec<String>,
}

impl ValidationReport {
    /// Weighted mean confidence over the valid fields; 0 when none is valid.
    pub fn overall_confidence(&self) -> f64 {
        let weighted = [
            (&self.drawing_number, WEIGHT_NUMBER),
            (&self.drawing_title, WEIGHT_TITLE),
            (&self.revision, WEIGHT_REVISION),
        ];
        let (sum, total) = weighted
            .iter()
            .filter(|(field, _)| field.valid)
            .fold((0.0, 0.0), |(sum, total), (field, weight)| {
                (sum + field.confidence * weight, total + weight)
            });

        if total > 0.0 {
            sum / total
        } else {
            0.0
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").trim().to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataValidator {
    thresholds: Thresholds,
}

impl MetadataValidator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Validate all three fields.
    ///
    /// A pass needs a valid drawing number plus a valid title or revision.
    /// With `skip_strict_checks` only emptiness and confidence apply; it is
    /// used for text read from regions a user drew by hand.
    pub fn validate(&self, fields: &ExtractedFields, skip_strict_checks: bool) -> ValidationReport {
        let number = self.validate_drawing_number(&fields.drawing_number, skip_strict_checks);
        let title = self.validate_title(
            &fields.drawing_title,
            number.value.as_deref(),
            skip_strict_checks,
        );
        let revision = self.validate_revision(&fields.revision, skip_strict_checks);

        let t = &self.thresholds;
        let mut passes =
            number.valid && number.confidence >= t.number && (title.valid || revision.valid);

        if !passes && number.valid && number.confidence >= t.number - RELAXED_NUMBER_MARGIN {
            passes = (title.valid && title.confidence >= t.title)
                || (revision.valid && revision.confidence >= t.revision);
        }

        let mut overall_errors = Vec::new();
        if !number.valid {
            overall_errors.push("Invalid or missing drawing number".to_string());
        }
        if !title.valid && !revision.valid {
            overall_errors.push("Both title and revision are invalid or missing".to_string());
        }

        ValidationReport {
            passes,
            drawing_number: number,
            drawing_title: title,
            revision,
            overall_errors,
        }
    }

    pub fn validate_drawing_number(&self, field: &FieldAnswer, lenient: bool) -> FieldValidation {
        let confidence = field.confidence;
        if field.text.trim().is_empty() {
            return FieldValidation::empty(confidence, "Drawing number is empty");
        }

        let normalized = collapse_whitespace(&field.text);
        let mut errors = Vec::new();

        if !lenient {
            if normalized.chars().count() < 2 {
                errors.push("Drawing number too short (< 2 chars)".to_string());
            }
            let upper = normalized.to_uppercase();
            if upper == "N/A" || upper == "NA" {
                errors.push("Drawing number is N/A".to_string());
            }
            if errors.is_empty() && !NUMBER_FORMATS.iter().any(|re| re.is_match(&normalized)) {
                info!(value = %normalized, "Drawing number format not recognized");
            }
        }

        FieldValidation::finish(normalized, confidence, self.thresholds.number, errors)
    }

    pub fn validate_title(
        &self,
        field: &FieldAnswer,
        drawing_number: Option<&str>,
        lenient: bool,
    ) -> FieldValidation {
        let confidence = field.confidence;
        if field.text.trim().is_empty() {
            return FieldValidation::empty(confidence, "Title is empty");
        }

        let normalized = collapse_whitespace(&field.text);
        let mut errors = Vec::new();

        if !lenient {
            let upper = normalized.to_uppercase();
            if normalized.chars().count() < 3 {
                errors.push("Title too short (< 3 chars)".to_string());
            }
            if ALL_DIGITS.is_match(&normalized) {
                errors.push("Title is purely numeric".to_string());
            }
            if drawing_number.is_some_and(|n| n.to_uppercase() == upper) {
                errors.push("Title matches drawing number".to_string());
            }
            if TITLE_PLACEHOLDERS.contains(&upper.as_str()) {
                errors.push("Title is a placeholder value".to_string());
            }
        }

        FieldValidation::finish(normalized, confidence, self.thresholds.title, errors)
    }

    pub fn validate_revision(&self, field: &FieldAnswer, lenient: bool) -> FieldValidation {
        let confidence = field.confidence;
        if field.text.trim().is_empty() {
            return FieldValidation::empty(confidence, "Revision is empty");
        }

        let normalized = REVISION_PREFIX
            .replace(field.text.trim(), "")
            .trim()
            .to_uppercase();
        let mut errors = Vec::new();

        if lenient {
            if normalized.is_empty() {
                errors.push("Revision is empty".to_string());
            }
        } else if !REVISION_FORMATS.iter().any(|re| re.is_match(&normalized)) {
            errors.push("Revision format not recognized".to_string());
        }

        FieldValidation::finish(normalized, confidence, self.thresholds.revision, errors)
    }
}
