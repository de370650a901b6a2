//! Drawing set persistence and status aggregation.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::diesel_models::{DrawingSetRecord, NewDrawingSet};
use super::pool::{
    begin_immediate, end_transaction, AsyncSqliteConnection, AsyncSqlitePool, DieselError,
};
use super::util::{now_rfc3339, parse_datetime, parse_json_opt, parse_status};
use super::LastInsertRowId;
use crate::models::{DrawingSet, DrawingSetStatus, ExtractionStats};
use crate::schema::{drawing_sets, sheets};

impl From<DrawingSetRecord> for DrawingSet {
    fn from(record: DrawingSetRecord) -> Self {
        DrawingSet {
            id: record.id,
            project_id: record.project_id,
            name: record.name,
            original_pdf_key: record.original_pdf_key,
            page_count: record.page_count,
            status: parse_status(
                "drawing_sets",
                record.id,
                &record.status,
                DrawingSetStatus::from_str,
                DrawingSetStatus::Queued,
            ),
            processing_errors: parse_json_opt(record.processing_errors.as_deref()),
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

#[derive(Clone)]
pub struct DrawingSetRepository {
    pool: AsyncSqlitePool,
}

impl DrawingSetRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a queued set and return its id.
    pub async fn create(
        &self,
        project_id: i32,
        name: &str,
        original_pdf_key: &str,
        page_count: i32,
    ) -> Result<i32, DieselError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        diesel::insert_into(drawing_sets::table)
            .values(NewDrawingSet {
                project_id,
                name,
                original_pdf_key,
                page_count,
                status: DrawingSetStatus::Queued.as_str(),
                created_at: &now,
                updated_at: &now,
            })
            .execute(&mut conn)
            .await?;

        let row: LastInsertRowId = diesel::sql_query("SELECT last_insert_rowid()")
            .get_result(&mut conn)
            .await?;
        Ok(row.id as i32)
    }

    pub async fn get(&self, id: i32) -> Result<Option<DrawingSet>, DieselError> {
        let mut conn = self.pool.get().await?;

        drawing_sets::table
            .find(id)
            .first::<DrawingSetRecord>(&mut conn)
            .await
            .optional()
            .map(|opt| opt.map(DrawingSet::from))
    }

    pub async fn list_for_project(&self, project_id: i32) -> Result<Vec<DrawingSet>, DieselError> {
        let mut conn = self.pool.get().await?;

        drawing_sets::table
            .filter(drawing_sets::project_id.eq(project_id))
            .order(drawing_sets::id.asc())
            .load::<DrawingSetRecord>(&mut conn)
            .await
            .map(|records| records.into_iter().map(DrawingSet::from).collect())
    }

    /// Set the status, replacing `processing_errors`. `None` clears them.
    pub async fn update_status(
        &self,
        id: i32,
        status: DrawingSetStatus,
        errors: Option<&serde_json::Value>,
    ) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let errors = errors.map(|e| e.to_string());

        diesel::update(drawing_sets::table.find(id))
            .set((
                drawing_sets::status.eq(status.as_str()),
                drawing_sets::processing_errors.eq(errors),
                drawing_sets::updated_at.eq(now_rfc3339()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Sheet counts by extraction status, with `total` taken from the page count.
    pub async fn extraction_stats(&self, id: i32) -> Result<ExtractionStats, DieselError> {
        let mut conn = self.pool.get().await?;
        load_stats(&mut conn, id).await
    }

    /// Recompute the set status from its sheets and store it.
    ///
    /// Counting and writing share one write transaction, so a worker that
    /// counted before another sheet finished cannot overwrite a newer
    /// status. Existing processing errors are kept.
    pub async fn update_status_from_sheets(
        &self,
        id: i32,
    ) -> Result<(DrawingSetStatus, ExtractionStats), DieselError> {
        let mut conn = self.pool.get().await?;

        begin_immediate(&mut conn).await?;
        let result = async {
            let stats = load_stats(&mut conn, id).await?;
            let status = stats.derive_status();
            diesel::update(drawing_sets::table.find(id))
                .set((
                    drawing_sets::status.eq(status.as_str()),
                    drawing_sets::updated_at.eq(now_rfc3339()),
                ))
                .execute(&mut conn)
                .await?;
            Ok::<_, DieselError>((status, stats))
        }
        .await;
        end_transaction(&mut conn, result).await
    }
}

async fn load_stats(
    conn: &mut AsyncSqliteConnection,
    id: i32,
) -> Result<ExtractionStats, DieselError> {
    use diesel::dsl::count_star;

    let page_count: i32 = drawing_sets::table
        .find(id)
        .select(drawing_sets::page_count)
        .first(conn)
        .await?;

    let counts: Vec<(String, i64)> = sheets::table
        .filter(sheets::drawing_set_id.eq(id))
        .group_by(sheets::extraction_status)
        .select((sheets::extraction_status, count_star()))
        .load(conn)
        .await?;

    Ok(ExtractionStats::from_counts(page_count as i64, &counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionStatus;
    use crate::repository::test_support::setup_test_db;
    use crate::repository::SheetRepository;

    #[tokio::test]
    async fn test_create_and_get() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DrawingSetRepository::new(pool);

        let id = repo.create(4, "Architectural", "drawing-sets/a.pdf", 3).await.unwrap();
        let set = repo.get(id).await.unwrap().unwrap();
        assert_eq!(set.project_id, 4);
        assert_eq!(set.page_count, 3);
        assert_eq!(set.status, DrawingSetStatus::Queued);
        assert!(set.processing_errors.is_none());

        assert!(repo.get(id + 100).await.unwrap().is_none());
        assert_eq!(repo.list_for_project(4).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_status_reads_as_queued() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DrawingSetRepository::new(pool.clone());
        let id = repo.create(1, "S", "k.pdf", 1).await.unwrap();

        let mut conn = pool.get().await.unwrap();
        diesel::update(drawing_sets::table.find(id))
            .set(drawing_sets::status.eq("archived"))
            .execute(&mut conn)
            .await
            .unwrap();

        let set = repo.get(id).await.unwrap().unwrap();
        assert_eq!(set.status, DrawingSetStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_status_with_errors() {
        let (pool, _dir) = setup_test_db().await;
        let repo = DrawingSetRepository::new(pool);
        let id = repo.create(1, "S", "k.pdf", 1).await.unwrap();

        let errors = serde_json::json!({"error": "boom"});
        repo.update_status(id, DrawingSetStatus::Failed, Some(&errors))
            .await
            .unwrap();

        let set = repo.get(id).await.unwrap().unwrap();
        assert_eq!(set.status, DrawingSetStatus::Failed);
        assert_eq!(set.processing_errors.unwrap()["error"], "boom");
    }

    #[tokio::test]
    async fn test_status_from_sheets() {
        let (pool, _dir) = setup_test_db().await;
        let sets = DrawingSetRepository::new(pool.clone());
        let sheets = SheetRepository::new(pool);

        let id = sets.create(1, "S", "k.pdf", 3).await.unwrap();
        let set = sets.get(id).await.unwrap().unwrap();
        let ids = sheets.create_for_set(&set).await.unwrap();
        assert_eq!(ids.len(), 3);

        let (status, stats) = sets.update_status_from_sheets(id).await.unwrap();
        assert_eq!(status, DrawingSetStatus::Processing);
        assert_eq!(stats.queued, 3);

        sheets
            .set_extraction_status(ids[0], ExtractionStatus::Success)
            .await
            .unwrap();
        sheets
            .set_extraction_status(ids[1], ExtractionStatus::NeedsReview)
            .await
            .unwrap();
        sheets
            .set_extraction_status(ids[2], ExtractionStatus::Failed)
            .await
            .unwrap();

        let (status, stats) = sets.update_status_from_sheets(id).await.unwrap();
        assert_eq!(status, DrawingSetStatus::Partial);
        assert_eq!(stats.progress_percent(), 100);
        assert_eq!(sets.get(id).await.unwrap().unwrap().status, DrawingSetStatus::Partial);
    }
}
