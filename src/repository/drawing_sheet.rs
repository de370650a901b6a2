//! Drawing sheet persistence and revision linking.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::diesel_models::{DrawingSheetRecord, NewDrawingSheet};
use super::pool::{
    begin_immediate, end_transaction, AsyncSqliteConnection, AsyncSqlitePool, DieselError,
};
use super::util::{now_rfc3339, parse_datetime, parse_datetime_opt};
use super::LastInsertRowId;
use crate::models::{next_revision_after, DrawingSheet, SheetStatus};
use crate::schema::{drawing_sheets, sheets};

impl From<DrawingSheetRecord> for DrawingSheet {
    fn from(r: DrawingSheetRecord) -> Self {
        DrawingSheet {
            id: r.id,
            project_id: r.project_id,
            sheet_number: r.sheet_number,
            title: r.title,
            discipline: r.discipline,
            current_revision_id: r.current_revision_id,
            revision_count: r.revision_count,
            last_revision_at: parse_datetime_opt(r.last_revision_at),
            created_at: parse_datetime(&r.created_at),
            updated_at: parse_datetime(&r.updated_at),
        }
    }
}

#[derive(Clone)]
pub struct DrawingSheetRepository {
    pool: AsyncSqlitePool,
}

impl DrawingSheetRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i32) -> Result<Option<DrawingSheet>, DieselError> {
        let mut conn = self.pool.get().await?;

        drawing_sheets::table
            .find(id)
            .first::<DrawingSheetRecord>(&mut conn)
            .await
            .optional()
            .map(|opt| opt.map(DrawingSheet::from))
    }

    /// Find the project's drawing sheet for a drawing number, creating it if
    /// needed. A missing title is filled in when one is given.
    pub async fn find_or_create_by_drawing_number(
        &self,
        project_id: i32,
        drawing_number: &str,
        title: Option<&str>,
    ) -> Result<DrawingSheet, DieselError> {
        let normalized = DrawingSheet::normalize_number(drawing_number);
        let title = title.filter(|t| !t.is_empty());
        let mut conn = self.pool.get().await?;

        // Two workers may see the same new number at once
        begin_immediate(&mut conn).await?;
        let result = find_or_create(&mut conn, project_id, &normalized, title).await;
        end_transaction(&mut conn, result).await
    }

    /// Make `sheet_id` the current revision of a drawing sheet.
    ///
    /// The previous current revision is superseded. Without an explicit
    /// revision number the next one is derived from the latest numbered
    /// revision. Returns the revision number used.
    pub async fn add_revision(
        &self,
        drawing_sheet_id: i32,
        sheet_id: i32,
        revision_number: Option<&str>,
    ) -> Result<String, DieselError> {
        let revision_number = revision_number.filter(|r| !r.is_empty());
        let mut conn = self.pool.get().await?;

        begin_immediate(&mut conn).await?;
        let result = link_revision(&mut conn, drawing_sheet_id, sheet_id, revision_number).await;
        end_transaction(&mut conn, result).await
    }
}

async fn find_or_create(
    conn: &mut AsyncSqliteConnection,
    project_id: i32,
    sheet_number: &str,
    title: Option<&str>,
) -> Result<DrawingSheet, DieselError> {
    let existing: Option<DrawingSheetRecord> = drawing_sheets::table
        .filter(drawing_sheets::project_id.eq(project_id))
        .filter(drawing_sheets::sheet_number.eq(sheet_number))
        .first(conn)
        .await
        .optional()?;

    if let Some(record) = existing {
        let mut sheet = DrawingSheet::from(record);
        if sheet.title.as_deref().map_or(true, str::is_empty) {
            if let Some(title) = title {
                diesel::update(drawing_sheets::table.find(sheet.id))
                    .set((
                        drawing_sheets::title.eq(Some(title)),
                        drawing_sheets::updated_at.eq(now_rfc3339()),
                    ))
                    .execute(conn)
                    .await?;
                sheet.title = Some(title.to_string());
            }
        }
        return Ok(sheet);
    }

    let now = now_rfc3339();
    diesel::insert_into(drawing_sheets::table)
        .values(NewDrawingSheet {
            project_id,
            sheet_number,
            title,
            revision_count: 0,
            created_at: &now,
            updated_at: &now,
        })
        .execute(conn)
        .await?;

    let row: LastInsertRowId = diesel::sql_query("SELECT last_insert_rowid()")
        .get_result(conn)
        .await?;

    drawing_sheets::table
        .find(row.id as i32)
        .first::<DrawingSheetRecord>(conn)
        .await
        .map(DrawingSheet::from)
}

async fn link_revision(
    conn: &mut AsyncSqliteConnection,
    drawing_sheet_id: i32,
    sheet_id: i32,
    revision_number: Option<&str>,
) -> Result<String, DieselError> {
    let now = now_rfc3339();

    let current: Option<i32> = drawing_sheets::table
        .find(drawing_sheet_id)
        .select(drawing_sheets::current_revision_id)
        .first(conn)
        .await?;

    if let Some(previous) = current {
        diesel::update(sheets::table.find(previous))
            .set((
                sheets::status.eq(SheetStatus::Superseded.as_str()),
                sheets::updated_at.eq(&now),
            ))
            .execute(conn)
            .await?;
    }

    let revision = match revision_number {
        Some(r) => r.to_string(),
        None => {
            let last: Option<String> = sheets::table
                .filter(sheets::drawing_sheet_id.eq(drawing_sheet_id))
                .filter(sheets::revision_number.is_not_null())
                .order((sheets::created_at.desc(), sheets::id.desc()))
                .select(sheets::revision_number)
                .first::<Option<String>>(conn)
                .await
                .optional()?
                .flatten();
            next_revision_after(last.as_deref())
        }
    };

    diesel::update(sheets::table.find(sheet_id))
        .set((
            sheets::drawing_sheet_id.eq(Some(drawing_sheet_id)),
            sheets::previous_revision_id.eq(current),
            sheets::revision_number.eq(Some(&revision)),
            sheets::status.eq(SheetStatus::Active.as_str()),
            sheets::updated_at.eq(&now),
        ))
        .execute(conn)
        .await?;

    let revision_count: i64 = sheets::table
        .filter(sheets::drawing_sheet_id.eq(drawing_sheet_id))
        .count()
        .get_result(conn)
        .await?;

    diesel::update(drawing_sheets::table.find(drawing_sheet_id))
        .set((
            drawing_sheets::current_revision_id.eq(Some(sheet_id)),
            drawing_sheets::revision_count.eq(revision_count as i32),
            drawing_sheets::last_revision_at.eq(Some(&now)),
            drawing_sheets::updated_at.eq(&now),
        ))
        .execute(conn)
        .await?;

    Ok(revision)
}
