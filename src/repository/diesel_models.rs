//! Diesel row types. Timestamps and JSON payloads are stored as text.

use diesel::prelude::*;

use crate::schema;

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::drawing_sets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DrawingSetRecord {
    pub id: i32,
    pub project_id: i32,
    pub name: String,
    pub original_pdf_key: String,
    pub page_count: i32,
    pub status: String,
    pub processing_errors: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::drawing_sets)]
pub struct NewDrawingSet<'a> {
    pub project_id: i32,
    pub name: &'a str,
    pub original_pdf_key: &'a str,
    pub page_count: i32,
    pub status: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::sheets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SheetRecord {
    pub id: i32,
    pub drawing_set_id: i32,
    pub project_id: i32,
    pub page_number: i32,
    pub page_preview_key: Option<String>,
    pub thumbnail_key: Option<String>,
    pub page_width_px: Option<i32>,
    pub page_height_px: Option<i32>,
    pub page_orientation: Option<String>,
    pub size_bucket: Option<String>,
    pub drawing_number: Option<String>,
    pub drawing_title: Option<String>,
    pub revision: Option<String>,
    pub extraction_status: String,
    pub confidence_number: Option<f64>,
    pub confidence_title: Option<f64>,
    pub confidence_revision: Option<f64>,
    pub used_template_id: Option<i32>,
    pub extraction_raw: Option<String>,
    pub extraction_errors: Option<String>,
    pub extracted_at: Option<String>,
    pub drawing_sheet_id: Option<i32>,
    pub previous_revision_id: Option<i32>,
    pub revision_number: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::sheets)]
pub struct NewSheet<'a> {
    pub drawing_set_id: i32,
    pub project_id: i32,
    pub page_number: i32,
    pub extraction_status: &'a str,
    pub status: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::title_block_templates)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TemplateRecord {
    pub id: i32,
    pub project_id: i32,
    pub name: String,
    pub crop_rect: String,
    pub orientation: Option<String>,
    pub size_bucket: Option<String>,
    pub anchor_labels: Option<String>,
    pub field_mappings: Option<String>,
    pub success_count: i32,
    pub last_used_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::title_block_templates)]
pub struct NewTemplate<'a> {
    pub project_id: i32,
    pub name: &'a str,
    pub crop_rect: &'a str,
    pub orientation: Option<&'a str>,
    pub size_bucket: Option<&'a str>,
    pub anchor_labels: Option<&'a str>,
    pub field_mappings: Option<&'a str>,
    pub success_count: i32,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::drawing_sheets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DrawingSheetRecord {
    pub id: i32,
    pub project_id: i32,
    pub sheet_number: String,
    pub title: Option<String>,
    pub discipline: Option<String>,
    pub current_revision_id: Option<i32>,
    pub revision_count: i32,
    pub last_revision_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::drawing_sheets)]
pub struct NewDrawingSheet<'a> {
    pub project_id: i32,
    pub sheet_number: &'a str,
    pub title: Option<&'a str>,
    pub revision_count: i32,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Queryable, QueryableByName, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub max_tries: i32,
    pub backoff_secs: i32,
    pub timeout_secs: i32,
    pub available_at: String,
    pub reserved_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::jobs)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub kind: &'a str,
    pub payload: &'a str,
    pub status: &'a str,
    pub attempts: i32,
    pub max_tries: i32,
    pub backoff_secs: i32,
    pub timeout_secs: i32,
    pub available_at: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}
