//! End-to-end extraction through the job queue, with a scripted Textract.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};

use drawmeta::events::ProgressBroadcaster;
use drawmeta::extraction::SheetExtractor;
use drawmeta::jobs::{self, JobPayload, Worker};
use drawmeta::models::{DrawingSetStatus, ExtractionStatus, Orientation, SheetStatus};
use drawmeta::ocr::{Block, BlockType, Document, OcrError, Query, TextractApi, TextractService};
use drawmeta::render::{DrawingSetProcessor, PageRenderer};
use drawmeta::repository::{DbContext, RenderedPage};
use drawmeta::storage::{LocalStorage, ObjectStorage};
use drawmeta::validation::MetadataValidator;

/// Answers every query call with the same title block.
struct ScriptedTextract {
    answers: Vec<(&'static str, &'static str, f64)>,
    calls: AtomicUsize,
}

impl ScriptedTextract {
    fn new(answers: Vec<(&'static str, &'static str, f64)>) -> Self {
        Self {
            answers,
            calls: AtomicUsize::new(0),
        }
    }
}

fn block(id: String, block_type: BlockType) -> Block {
    Block {
        id,
        block_type,
        text: None,
        confidence: None,
        bounding_box: None,
        query_alias: None,
        answer_ids: Vec::new(),
    }
}

#[async_trait]
impl TextractApi for ScriptedTextract {
    async fn analyze_queries(
        &self,
        _document: Document<'_>,
        _queries: &[Query],
    ) -> Result<Vec<Block>, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut blocks = Vec::new();
        for (i, (alias, text, confidence)) in self.answers.iter().enumerate() {
            let answer_id = format!("answer-{}", i);

            let mut query = block(format!("query-{}", i), BlockType::Query);
            query.query_alias = Some(alias.to_string());
            query.answer_ids = vec![answer_id.clone()];

            let mut answer = block(answer_id, BlockType::QueryResult);
            answer.text = Some(text.to_string());
            answer.confidence = Some(*confidence);

            blocks.push(query);
            blocks.push(answer);
        }
        Ok(blocks)
    }

    async fn detect_text(&self, _image: &[u8]) -> Result<Vec<Block>, OcrError> {
        Ok(Vec::new())
    }
}

struct Harness {
    db: DbContext,
    storage: Arc<dyn ObjectStorage>,
    events: ProgressBroadcaster,
    worker: Worker,
    _db_dir: tempfile::TempDir,
    _storage_dir: tempfile::TempDir,
}

async fn harness(api: Arc<dyn TextractApi>) -> Harness {
    let db_dir = tempfile::tempdir().unwrap();
    let db = DbContext::from_path(&db_dir.path().join("drawmeta.db"));
    db.migrate().await.unwrap();

    let storage_dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn ObjectStorage> =
        Arc::new(LocalStorage::new(storage_dir.path().to_path_buf()));
    let events = ProgressBroadcaster::new();

    let processor = DrawingSetProcessor::new(
        db.clone(),
        storage.clone(),
        PageRenderer::default(),
        events.clone(),
    );
    let extractor = SheetExtractor::new(
        db.clone(),
        storage.clone(),
        TextractService::new(api),
        MetadataValidator::default(),
        events.clone(),
    );

    Harness {
        worker: Worker::new(db.clone(), processor, extractor),
        db,
        storage,
        events,
        _db_dir: db_dir,
        _storage_dir: storage_dir,
    }
}

fn page_png() -> Vec<u8> {
    let img = RgbImage::from_pixel(420, 297, Rgb([255, 255, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// A one-page set whose page is already rendered and queued for extraction.
async fn rendered_set(h: &Harness, project_id: i32, name: &str) -> i32 {
    rendered_set_sized(h, project_id, name, 420, 297).await
}

/// Like [`rendered_set`], with the page recorded at `width` x `height`.
async fn rendered_set_sized(
    h: &Harness,
    project_id: i32,
    name: &str,
    width: i32,
    height: i32,
) -> i32 {
    let set_id = h
        .db
        .drawing_sets()
        .create(project_id, name, &format!("drawing-sets/{}.pdf", name), 1)
        .await
        .unwrap();
    let set = h.db.drawing_sets().get(set_id).await.unwrap().unwrap();
    let sheet_ids = h.db.sheets().create_for_set(&set).await.unwrap();
    let sheet_id = sheet_ids[0];

    let preview_key = format!("drawing-previews/{}/{}/page_0001.png", project_id, set_id);
    h.storage
        .put(&preview_key, &page_png(), "image/png")
        .await
        .unwrap();
    h.db
        .sheets()
        .save_rendered(
            sheet_id,
            &RenderedPage {
                preview_key,
                thumbnail_key: None,
                width,
                height,
                orientation: Orientation::Landscape,
                size_bucket: "A3".to_string(),
            },
        )
        .await
        .unwrap();

    jobs::dispatch(
        &h.db,
        JobPayload::ExtractSheetMetadata {
            sheet_id,
            preferred_template_id: None,
        },
    )
    .await
    .unwrap();

    sheet_id
}

#[tokio::test]
async fn test_revisions_link_to_one_drawing_sheet() {
    let api = Arc::new(ScriptedTextract::new(vec![
        ("drawing_number", "A-101", 96.0),
        ("drawing_title", "GROUND FLOOR PLAN", 91.0),
        ("revision", "Rev B", 88.0),
    ]));
    let h = harness(api.clone()).await;
    let mut updates = h.events.subscribe();

    let first = rendered_set(&h, 7, "issue-1").await;
    let second = rendered_set(&h, 7, "issue-2").await;

    let summary = h.worker.run_until_idle(1).await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);

    // The heuristic crop passes, so the full page is never sent
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);

    let older = h.db.sheets().get(first).await.unwrap().unwrap();
    let newer = h.db.sheets().get(second).await.unwrap().unwrap();

    assert_eq!(newer.extraction_status, ExtractionStatus::Success);
    assert_eq!(newer.drawing_number.as_deref(), Some("A-101"));
    assert_eq!(newer.drawing_title.as_deref(), Some("GROUND FLOOR PLAN"));
    assert_eq!(newer.revision.as_deref(), Some("B"));
    assert!(newer.extraction_errors.is_none());
    assert!(newer.extracted_at.is_some());

    let drawing_sheet_id = newer.drawing_sheet_id.unwrap();
    assert_eq!(older.drawing_sheet_id, Some(drawing_sheet_id));
    assert_eq!(newer.previous_revision_id, Some(first));
    assert_eq!(newer.status, SheetStatus::Active);
    assert_eq!(older.status, SheetStatus::Superseded);

    let drawing_sheet = h
        .db
        .drawing_sheets()
        .get(drawing_sheet_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(drawing_sheet.current_revision_id, Some(second));
    assert_eq!(drawing_sheet.revision_count, 2);
    assert_eq!(drawing_sheet.title.as_deref(), Some("GROUND FLOOR PLAN"));

    for set in h.db.drawing_sets().list_for_project(7).await.unwrap() {
        assert_eq!(set.status, DrawingSetStatus::Success);
    }

    let update = updates.try_recv().unwrap();
    assert_eq!(update.project_id, 7);
    assert_eq!(update.extraction_status, Some(ExtractionStatus::Success));
    assert_eq!(update.drawing_number.as_deref(), Some("A-101"));
}

#[tokio::test]
async fn test_number_without_title_or_revision_needs_review() {
    let api = Arc::new(ScriptedTextract::new(vec![("dwg_no", "M-201", 93.0)]));
    let h = harness(api.clone()).await;

    let sheet_id = rendered_set(&h, 3, "mechanical").await;
    h.worker.run_until_idle(2).await.unwrap();

    // Heuristic crop and full page are both tried
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);

    let sheet = h.db.sheets().get(sheet_id).await.unwrap().unwrap();
    assert_eq!(sheet.extraction_status, ExtractionStatus::NeedsReview);
    assert_eq!(sheet.drawing_number.as_deref(), Some("M-201"));
    assert!(sheet.drawing_title.is_none());

    let errors = sheet.extraction_errors.unwrap();
    assert_eq!(errors["best_guesses"]["drawing_number"], "M-201");
    assert!(errors["validation_errors"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e == "Both title and revision are invalid or missing"));

    // Review sheets still join their drawing sheet
    assert!(sheet.drawing_sheet_id.is_some());

    let set = h.db.drawing_sets().get(sheet.drawing_set_id).await.unwrap().unwrap();
    assert_eq!(set.status, DrawingSetStatus::Partial);
}

#[tokio::test]
async fn test_empty_answers_need_review() {
    let api = Arc::new(ScriptedTextract::new(Vec::new()));
    let h = harness(api).await;

    let sheet_id = rendered_set(&h, 1, "blank").await;
    h.worker.run_until_idle(1).await.unwrap();

    let sheet = h.db.sheets().get(sheet_id).await.unwrap().unwrap();
    assert_eq!(sheet.extraction_status, ExtractionStatus::NeedsReview);
    assert!(sheet.drawing_number.is_none());
    assert!(sheet.drawing_sheet_id.is_none());

    let stats = h
        .db
        .drawing_sets()
        .extraction_stats(sheet.drawing_set_id)
        .await
        .unwrap();
    assert_eq!(stats.needs_review, 1);
    assert_eq!(stats.progress_percent(), 100);
}

#[tokio::test]
async fn test_large_sheet_goes_straight_to_full_page() {
    let api = Arc::new(ScriptedTextract::new(vec![("dwg_no", "S-501", 90.0)]));
    let h = harness(api.clone()).await;

    // 9000 x 6000 at 4 bytes per pixel is over the auto-crop limit
    let sheet_id = rendered_set_sized(&h, 5, "structural", 9000, 6000).await;
    let sheet = h.db.sheets().get(sheet_id).await.unwrap().unwrap();
    assert!(sheet.skips_heuristic_cropping());

    let summary = h.worker.run_until_idle(1).await.unwrap();
    assert_eq!(summary.completed, 1);

    // No heuristic crop: the full page is the only call
    assert_eq!(api.calls.load(Ordering::SeqCst), 1);

    let sheet = h.db.sheets().get(sheet_id).await.unwrap().unwrap();
    assert_eq!(sheet.extraction_status, ExtractionStatus::NeedsReview);
    assert_eq!(sheet.drawing_number.as_deref(), Some("S-501"));

    let errors = sheet.extraction_errors.unwrap();
    assert!(errors["note"]
        .as_str()
        .unwrap()
        .starts_with("Image too large for auto-cropping"));
}

#[tokio::test]
async fn test_large_sheet_that_passes_has_no_note() {
    let api = Arc::new(ScriptedTextract::new(vec![
        ("drawing_number", "S-502", 95.0),
        ("drawing_title", "FOUNDATION PLAN", 90.0),
        ("revision", "C1", 90.0),
    ]));
    let h = harness(api.clone()).await;

    let sheet_id = rendered_set_sized(&h, 5, "structural", 9000, 6000).await;
    h.worker.run_until_idle(1).await.unwrap();

    assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    let sheet = h.db.sheets().get(sheet_id).await.unwrap().unwrap();
    assert_eq!(sheet.extraction_status, ExtractionStatus::Success);
    assert_eq!(sheet.revision.as_deref(), Some("C1"));
    assert!(sheet.extraction_errors.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_sheets_with_concurrent_workers() {
    let api = Arc::new(ScriptedTextract::new(vec![
        ("drawing_number", "E-001", 95.0),
        ("drawing_title", "LIGHTING LAYOUT", 90.0),
        ("revision", "A", 90.0),
    ]));
    let h = harness(api.clone()).await;

    let mut sheet_ids = Vec::new();
    for i in 0..24 {
        sheet_ids.push(rendered_set(&h, 9, &format!("issue-{}", i)).await);
    }

    let summary = h.worker.run_until_idle(8).await.unwrap();
    assert_eq!(summary.completed, 24);
    assert_eq!(summary.failed, 0);
    assert_eq!(h.db.jobs().pending_count().await.unwrap(), 0);

    for id in sheet_ids {
        let sheet = h.db.sheets().get(id).await.unwrap().unwrap();
        assert_eq!(sheet.extraction_status, ExtractionStatus::Success);
        assert!(sheet.drawing_sheet_id.is_some());
    }
}
