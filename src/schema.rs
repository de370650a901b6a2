// Diesel table definitions. Kept in sync with src/migrations by hand.

diesel::table! {
    drawing_sets (id) {
        id -> Integer,
        project_id -> Integer,
        name -> Text,
        original_pdf_key -> Text,
        page_count -> Integer,
        status -> Text,
        processing_errors -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sheets (id) {
        id -> Integer,
        drawing_set_id -> Integer,
        project_id -> Integer,
        page_number -> Integer,
        page_preview_key -> Nullable<Text>,
        thumbnail_key -> Nullable<Text>,
        page_width_px -> Nullable<Integer>,
        page_height_px -> Nullable<Integer>,
        page_orientation -> Nullable<Text>,
        size_bucket -> Nullable<Text>,
        drawing_number -> Nullable<Text>,
        drawing_title -> Nullable<Text>,
        revision -> Nullable<Text>,
        extraction_status -> Text,
        confidence_number -> Nullable<Double>,
        confidence_title -> Nullable<Double>,
        confidence_revision -> Nullable<Double>,
        used_template_id -> Nullable<Integer>,
        extraction_raw -> Nullable<Text>,
        extraction_errors -> Nullable<Text>,
        extracted_at -> Nullable<Text>,
        drawing_sheet_id -> Nullable<Integer>,
        previous_revision_id -> Nullable<Integer>,
        revision_number -> Nullable<Text>,
        status -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    title_block_templates (id) {
        id -> Integer,
        project_id -> Integer,
        name -> Text,
        crop_rect -> Text,
        orientation -> Nullable<Text>,
        size_bucket -> Nullable<Text>,
        anchor_labels -> Nullable<Text>,
        field_mappings -> Nullable<Text>,
        success_count -> Integer,
        last_used_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    drawing_sheets (id) {
        id -> Integer,
        project_id -> Integer,
        sheet_number -> Text,
        title -> Nullable<Text>,
        discipline -> Nullable<Text>,
        current_revision_id -> Nullable<Integer>,
        revision_count -> Integer,
        last_revision_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    jobs (id) {
        id -> Text,
        kind -> Text,
        payload -> Text,
        status -> Text,
        attempts -> Integer,
        max_tries -> Integer,
        backoff_secs -> Integer,
        timeout_secs -> Integer,
        available_at -> Text,
        reserved_at -> Nullable<Text>,
        last_error -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::joinable!(sheets -> drawing_sets (drawing_set_id));

diesel::allow_tables_to_appear_in_same_query!(
    drawing_sets,
    sheets,
    title_block_templates,
    drawing_sheets,
    jobs,
);
