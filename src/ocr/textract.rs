//! Title-block queries and text detection on top of [`TextractApi`].
//!
//! Service failures never propagate out of the query and region methods:
//! they come back as `success: false` with the message in `error`, which the
//! extraction pipeline records as a failed attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{AwsTextract, Block, BlockType, Document, OcrError, TextractApi};
use crate::config::TextractSettings;
use crate::models::Rect;
use crate::storage::TextractLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub alias: &'static str,
    pub text: &'static str,
}

/// Several phrasings per field; answers are merged by [`map_fields`].
pub const QUERIES: [Query; 6] = [
    Query {
        alias: "drawing_number",
        text: "What is the drawing number in the title block?",
    },
    Query {
        alias: "dwg_no",
        text: "What is the DWG NO or drawing number?",
    },
    Query {
        alias: "drawing_title",
        text: "What is the drawing title in the title block?",
    },
    Query {
        alias: "title",
        text: "What is the title or description of this drawing?",
    },
    Query {
        alias: "revision",
        text: "What is the revision letter or number in the title block?",
    },
    Query {
        alias: "issue",
        text: "What is the issue or revision?",
    },
];

const NUMBER_ALIASES: [&str; 2] = ["drawing_number", "dwg_no"];
const TITLE_ALIASES: [&str; 2] = ["drawing_title", "title"];
const REVISION_ALIASES: [&str; 2] = ["revision", "issue"];

/// Confidence gap above which a fallback alias beats the primary one.
const ALIAS_CONFIDENCE_MARGIN: f64 = 0.1;

/// Same-line tolerances (fraction of image height).
const DETECT_LINE_TOLERANCE: f64 = 0.02;
const REGION_LINE_TOLERANCE: f64 = 0.05;

static LABEL_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(ISSUE|REV|REVISION|R)\s*[:.]?\s*$").expect("valid regex")
});
static SINGLE_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[A-Z0-9]$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnswerBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// One QUERY_RESULT, keyed by alias in the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub confidence: f64,
    #[serde(rename = "boundingBox")]
    pub bounding_box: Option<AnswerBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAnswer {
    pub text: String,
    pub confidence: f64,
    pub source_alias: String,
    #[serde(rename = "boundingBox")]
    pub bounding_box: Option<AnswerBox>,
}

impl FieldAnswer {
    fn empty(alias: &str) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            source_alias: alias.to_string(),
            bounding_box: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub drawing_number: FieldAnswer,
    pub drawing_title: FieldAnswer,
    pub revision: FieldAnswer,
}

/// Outcome of a query-based extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExtraction {
    pub success: bool,
    pub fields: Option<ExtractedFields>,
    pub raw: BTreeMap<String, Answer>,
    pub error: Option<String>,
}

impl QueryExtraction {
    fn failed(error: &OcrError) -> Self {
        Self {
            success: false,
            fields: None,
            raw: BTreeMap::new(),
            error: Some(error.to_string()),
        }
    }
}

/// A detected line, for picking field regions by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub id: String,
    pub text: String,
    pub confidence: f64,
    #[serde(rename = "boundingBox")]
    pub bounding_box: Option<Rect>,
}

/// Text read from a cropped field region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionText {
    pub success: bool,
    pub text: String,
    pub confidence: f64,
    pub error: Option<String>,
}

impl RegionText {
    fn found(text: String, confidence: f64) -> Self {
        Self {
            success: true,
            text,
            confidence,
            error: None,
        }
    }

    fn failed(error: &OcrError) -> Self {
        Self {
            success: false,
            text: String::new(),
            confidence: 0.0,
            error: Some(error.to_string()),
        }
    }
}

/// Reduce QUERY / QUERY_RESULT blocks to answers keyed by alias.
///
/// A later answer for the same alias replaces an earlier one.
pub fn parse_query_blocks(blocks: &[Block]) -> BTreeMap<String, Answer> {
    let by_id: HashMap<&str, &Block> = blocks.iter().map(|b| (b.id.as_str(), b)).collect();
    let mut results = BTreeMap::new();

    for block in blocks.iter().filter(|b| b.block_type == BlockType::Query) {
        let Some(alias) = block.query_alias.as_deref().filter(|a| !a.is_empty()) else {
            continue;
        };

        for answer_id in &block.answer_ids {
            let Some(answer) = by_id
                .get(answer_id.as_str())
                .filter(|b| b.block_type == BlockType::QueryResult)
            else {
                continue;
            };

            results.insert(
                alias.to_string(),
                Answer {
                    text: answer.text.clone().unwrap_or_default(),
                    confidence: answer.unit_confidence(),
                    bounding_box: answer.bounding_box.map(|bb| AnswerBox {
                        left: bb.left,
                        top: bb.top,
                        width: bb.width,
                        height: bb.height,
                    }),
                },
            );
        }
    }

    results
}

/// Best non-empty answer among `aliases`, given in preference order.
///
/// A later alias only wins when it is more than 0.1 more confident.
pub fn select_best(results: &BTreeMap<String, Answer>, aliases: &[&str]) -> FieldAnswer {
    let mut best: Option<FieldAnswer> = None;

    for alias in aliases {
        let Some(result) = results.get(*alias) else {
            continue;
        };
        let text = result.text.trim();
        if text.is_empty() {
            continue;
        }

        let candidate = FieldAnswer {
            text: text.to_string(),
            confidence: result.confidence,
            source_alias: alias.to_string(),
            bounding_box: result.bounding_box,
        };
        best = match best {
            Some(held) if candidate.confidence - held.confidence <= ALIAS_CONFIDENCE_MARGIN => {
                Some(held)
            }
            _ => Some(candidate),
        };
    }

    best.unwrap_or_else(|| FieldAnswer::empty(aliases.first().copied().unwrap_or_default()))
}

pub fn map_fields(results: &BTreeMap<String, Answer>) -> ExtractedFields {
    ExtractedFields {
        drawing_number: select_best(results, &NUMBER_ALIASES),
        drawing_title: select_best(results, &TITLE_ALIASES),
        revision: select_best(results, &REVISION_ALIASES),
    }
}

/// Stable insertion sort into reading order: top to bottom, then left to
/// right for items within `tolerance` of each other vertically.
///
/// The tolerance makes the comparison intransitive, which `sort_by` does
/// not allow.
fn sort_reading_order<T>(items: &mut [T], position: impl Fn(&T) -> (f64, f64), tolerance: f64) {
    let before = |a: (f64, f64), b: (f64, f64)| {
        if (a.1 - b.1).abs() < tolerance {
            a.0 < b.0
        } else {
            a.1 < b.1
        }
    };

    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && before(position(&items[j]), position(&items[j - 1])) {
            items.swap(j, j - 1);
            j -= 1;
        }
    }
}

#[derive(Clone)]
pub struct TextractService {
    api: Arc<dyn TextractApi>,
}

impl TextractService {
    pub fn new(api: Arc<dyn TextractApi>) -> Self {
        Self { api }
    }

    pub async fn from_settings(settings: &TextractSettings) -> Self {
        Self::new(Arc::new(AwsTextract::new(settings).await))
    }

    pub fn queries() -> &'static [Query] {
        &QUERIES
    }

    async fn run_queries(&self, document: Document<'_>) -> Result<QueryExtraction, OcrError> {
        let blocks = self.api.analyze_queries(document, &QUERIES).await?;
        let raw = parse_query_blocks(&blocks);
        Ok(QueryExtraction {
            success: true,
            fields: Some(map_fields(&raw)),
            raw,
            error: None,
        })
    }

    /// Query an image the service can read from S3 directly.
    pub async fn extract_from_s3(&self, location: &TextractLocation) -> QueryExtraction {
        let document = Document::S3 {
            bucket: &location.bucket,
            key: &location.key,
        };
        self.run_queries(document).await.unwrap_or_else(|e| {
            error!(bucket = %location.bucket, key = %location.key, "Textract extraction failed: {}", e);
            QueryExtraction::failed(&e)
        })
    }

    pub async fn extract_from_bytes(&self, image: &[u8]) -> QueryExtraction {
        self.run_queries(Document::Bytes(image))
            .await
            .unwrap_or_else(|e| {
                error!(bytes = image.len(), "Textract extraction from bytes failed: {}", e);
                QueryExtraction::failed(&e)
            })
    }

    /// Every non-empty LINE in reading order.
    pub async fn detect_all_text(&self, image: &[u8]) -> Result<Vec<TextLine>, OcrError> {
        let blocks = self.api.detect_text(image).await?;
        info!(blocks = blocks.len(), bytes = image.len(), "Detected document text");

        let mut lines: Vec<TextLine> = blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Line && !b.trimmed_text().is_empty())
            .map(|b| TextLine {
                id: b.id.clone(),
                text: b.trimmed_text().to_string(),
                confidence: b.unit_confidence(),
                bounding_box: b
                    .bounding_box
                    .map(|bb| Rect::new(bb.left, bb.top, bb.width, bb.height)),
            })
            .collect();

        sort_reading_order(
            &mut lines,
            |l| l.bounding_box.map(|r| (r.x, r.y)).unwrap_or((0.0, 0.0)),
            DETECT_LINE_TOLERANCE,
        );
        Ok(lines)
    }

    /// All text in a user-drawn field region, joined in reading order.
    ///
    /// A lone label such as "REV:" picks up the rightmost single-character
    /// word, which is usually the revision letter the line detector dropped.
    pub async fn extract_all_text_from_region(&self, image: &[u8]) -> RegionText {
        let blocks = match self.api.detect_text(image).await {
            Ok(blocks) => blocks,
            Err(e) => {
                error!("Region text extraction failed: {}", e);
                return RegionText::failed(&e);
            }
        };

        // (text, confidence, x, y)
        let positioned = |b: &Block| {
            let bb = b.bounding_box.unwrap_or_default();
            (b.trimmed_text().to_string(), b.unit_confidence(), bb.left, bb.top)
        };
        let mut lines: Vec<(String, f64, f64, f64)> = Vec::new();
        let mut words: Vec<(String, f64, f64, f64)> = Vec::new();
        for block in blocks.iter().filter(|b| !b.trimmed_text().is_empty()) {
            match block.block_type {
                BlockType::Line => lines.push(positioned(block)),
                BlockType::Word => words.push(positioned(block)),
                _ => {}
            }
        }

        sort_reading_order(&mut lines, |l| (l.2, l.3), REGION_LINE_TOLERANCE);

        let mut text = lines
            .iter()
            .map(|l| l.0.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let mut total: f64 = lines.iter().map(|l| l.1).sum();
        let mut count = lines.len();

        if LABEL_ONLY.is_match(&text) {
            let rightmost = words
                .iter()
                .filter(|w| SINGLE_CHAR.is_match(&w.0))
                .fold(None::<&(String, f64, f64, f64)>, |acc, w| match acc {
                    Some(held) if held.2 >= w.2 => Some(held),
                    _ => Some(w),
                });
            if let Some(letter) = rightmost {
                debug!(label = %text, letter = %letter.0, "Appending revision letter from word blocks");
                text = format!("{} {}", text, letter.0);
                total += letter.1;
                count += 1;
            }
        }

        let confidence = if count > 0 { total / count as f64 } else { 0.0 };
        debug!(lines = lines.len(), words = words.len(), %text, confidence, "Region text extracted");
        RegionText::found(text, confidence)
    }
}
