use async_trait::async_trait;
use aws_sdk_textract::config::{Credentials, Region};
use aws_sdk_textract::error::DisplayErrorContext;
use aws_sdk_textract::primitives::Blob;
use aws_sdk_textract::types;
use aws_sdk_textract::Client;
use tracing::debug;

use super::{Block, BlockType, BoundingBox, Document, OcrError, Query, TextractApi};
use crate::config::TextractSettings;

/// Textract client built from the configured region and credentials.
///
/// Explicit keys win; otherwise the default AWS provider chain applies.
#[derive(Clone)]
pub struct AwsTextract {
    client: Client,
}

impl AwsTextract {
    pub async fn new(settings: &TextractSettings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        if let (Some(key), Some(secret)) = (&settings.access_key, &settings.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "drawmeta-config",
            ));
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_textract::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

fn to_document(document: Document<'_>) -> types::Document {
    match document {
        Document::S3 { bucket, key } => types::Document::builder()
            .s3_object(types::S3Object::builder().bucket(bucket).name(key).build())
            .build(),
        Document::Bytes(bytes) => types::Document::builder()
            .bytes(Blob::new(bytes.to_vec()))
            .build(),
    }
}

fn convert_block(block: &types::Block) -> Block {
    let block_type = match block.block_type() {
        Some(types::BlockType::Line) => BlockType::Line,
        Some(types::BlockType::Word) => BlockType::Word,
        Some(types::BlockType::Query) => BlockType::Query,
        Some(types::BlockType::QueryResult) => BlockType::QueryResult,
        _ => BlockType::Other,
    };

    let bounding_box = block
        .geometry()
        .and_then(|g| g.bounding_box())
        .map(|bb| BoundingBox {
            left: bb.left() as f64,
            top: bb.top() as f64,
            width: bb.width() as f64,
            height: bb.height() as f64,
        });

    let answer_ids = block
        .relationships()
        .iter()
        .filter(|r| r.r#type() == Some(&types::RelationshipType::Answer))
        .flat_map(|r| r.ids().iter().cloned())
        .collect();

    Block {
        id: block.id().unwrap_or_default().to_string(),
        block_type,
        text: block.text().map(String::from),
        confidence: block.confidence().map(f64::from),
        bounding_box,
        query_alias: block.query().and_then(|q| q.alias()).map(String::from),
        answer_ids,
    }
}

#[async_trait]
impl TextractApi for AwsTextract {
    async fn analyze_queries(
        &self,
        document: Document<'_>,
        queries: &[Query],
    ) -> Result<Vec<Block>, OcrError> {
        let mut config = types::QueriesConfig::builder();
        for query in queries {
            let query = types::Query::builder()
                .text(query.text)
                .alias(query.alias)
                .build()
                .map_err(|e| OcrError::InvalidRequest(e.to_string()))?;
            config = config.queries(query);
        }
        let config = config
            .build()
            .map_err(|e| OcrError::InvalidRequest(e.to_string()))?;

        let output = self
            .client
            .analyze_document()
            .document(to_document(document))
            .feature_types(types::FeatureType::Queries)
            .queries_config(config)
            .send()
            .await
            .map_err(|e| OcrError::Service(DisplayErrorContext(e).to_string()))?;

        debug!("AnalyzeDocument returned {} blocks", output.blocks().len());
        Ok(output.blocks().iter().map(convert_block).collect())
    }

    async fn detect_text(&self, image: &[u8]) -> Result<Vec<Block>, OcrError> {
        let output = self
            .client
            .detect_document_text()
            .document(to_document(Document::Bytes(image)))
            .send()
            .await
            .map_err(|e| OcrError::Service(DisplayErrorContext(e).to_string()))?;

        debug!("DetectDocumentText returned {} blocks", output.blocks().len());
        Ok(output.blocks().iter().map(convert_block).collect())
    }
}
