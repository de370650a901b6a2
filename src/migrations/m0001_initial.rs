use cetane::prelude::*;

fn sqlite(sql: &str) -> RunSql {
    RunSql::portable().for_backend("sqlite", sql)
}

pub fn migration() -> Migration {
    Migration::new("0001_initial")
        .operation(sqlite(
            r#"CREATE TABLE drawing_sets (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    project_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    original_pdf_key TEXT NOT NULL,
    page_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    processing_errors TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
        ))
        .operation(sqlite(
            r#"CREATE TABLE sheets (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    drawing_set_id INTEGER NOT NULL REFERENCES drawing_sets(id) ON DELETE CASCADE,
    project_id INTEGER NOT NULL,
    page_number INTEGER NOT NULL,
    page_preview_key TEXT,
    thumbnail_key TEXT,
    page_width_px INTEGER,
    page_height_px INTEGER,
    page_orientation TEXT,
    size_bucket TEXT,
    drawing_number TEXT,
    drawing_title TEXT,
    revision TEXT,
    extraction_status TEXT NOT NULL DEFAULT 'queued',
    confidence_number REAL,
    confidence_title REAL,
    confidence_revision REAL,
    used_template_id INTEGER,
    extraction_raw TEXT,
    extraction_errors TEXT,
    extracted_at TEXT,
    drawing_sheet_id INTEGER,
    previous_revision_id INTEGER,
    revision_number TEXT,
    status TEXT NOT NULL DEFAULT 'draft',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(drawing_set_id, page_number)
)"#,
        ))
        .operation(sqlite(
            "CREATE INDEX idx_sheets_set_status ON sheets(drawing_set_id, extraction_status)",
        ))
        .operation(sqlite(
            "CREATE INDEX idx_sheets_drawing_sheet ON sheets(drawing_sheet_id)",
        ))
        .operation(sqlite(
            r#"CREATE TABLE title_block_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    project_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    crop_rect TEXT NOT NULL,
    orientation TEXT,
    size_bucket TEXT,
    anchor_labels TEXT,
    field_mappings TEXT,
    success_count INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
        ))
        .operation(sqlite(
            "CREATE INDEX idx_templates_project ON title_block_templates(project_id)",
        ))
        .operation(sqlite(
            r#"CREATE TABLE drawing_sheets (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    project_id INTEGER NOT NULL,
    sheet_number TEXT NOT NULL,
    title TEXT,
    discipline TEXT,
    current_revision_id INTEGER,
    revision_count INTEGER NOT NULL DEFAULT 0,
    last_revision_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(project_id, sheet_number)
)"#,
        ))
}
