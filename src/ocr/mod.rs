//! OCR through AWS Textract.
//!
//! The [`TextractApi`] trait is the seam between the pipeline and the remote
//! service: [`AwsTextract`] talks to AWS, tests script responses. Responses
//! are reduced to [`Block`]s, a flattened subset of Textract's block model.

mod aws;
mod textract;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use aws::AwsTextract;
pub use textract::{
    map_fields, parse_query_blocks, select_best, Answer, AnswerBox, ExtractedFields, FieldAnswer,
    Query, QueryExtraction, RegionText, TextLine, TextractService, QUERIES,
};

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Textract request failed: {0}")]
    Service(String),

    #[error("Invalid Textract request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    Line,
    Word,
    Query,
    QueryResult,
    #[serde(other)]
    Other,
}

/// Geometry in fractions of the analysed image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Block {
    pub id: String,
    pub block_type: BlockType,
    #[serde(default)]
    pub text: Option<String>,
    /// 0..100, as Textract reports it.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    /// Alias of a QUERY block.
    #[serde(default)]
    pub query_alias: Option<String>,
    /// Ids on ANSWER relationships.
    #[serde(default)]
    pub answer_ids: Vec<String>,
}

impl Block {
    /// Trimmed text, empty when absent.
    pub fn trimmed_text(&self) -> &str {
        self.text.as_deref().map(str::trim).unwrap_or("")
    }

    /// Confidence scaled to 0..1.
    pub fn unit_confidence(&self) -> f64 {
        self.confidence.unwrap_or(0.0) / 100.0
    }
}

/// Document handed to AnalyzeDocument.
#[derive(Debug, Clone, Copy)]
pub enum Document<'a> {
    S3 { bucket: &'a str, key: &'a str },
    Bytes(&'a [u8]),
}

#[async_trait]
pub trait TextractApi: Send + Sync {
    /// AnalyzeDocument with the QUERIES feature.
    async fn analyze_queries(
        &self,
        document: Document<'_>,
        queries: &[Query],
    ) -> Result<Vec<Block>, OcrError>;

    /// DetectDocumentText on raw image bytes.
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<Block>, OcrError>;
}
