//! Title-block template persistence.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::diesel_models::{NewTemplate, TemplateRecord};
use super::pool::{AsyncSqlitePool, DieselError};
use super::util::{now_rfc3339, parse_datetime, parse_datetime_opt, parse_json_opt, to_diesel_error};
use super::LastInsertRowId;
use crate::models::{FieldMappings, Orientation, Rect, TitleBlockTemplate};
use crate::schema::title_block_templates;

impl From<TemplateRecord> for TitleBlockTemplate {
    fn from(r: TemplateRecord) -> Self {
        TitleBlockTemplate {
            id: r.id,
            project_id: r.project_id,
            name: r.name,
            crop_rect: serde_json::from_str(&r.crop_rect).unwrap_or(Rect::FULL),
            orientation: r.orientation.as_deref().and_then(Orientation::from_str),
            size_bucket: r.size_bucket,
            anchor_labels: parse_json_opt(r.anchor_labels.as_deref()),
            field_mappings: parse_json_opt(r.field_mappings.as_deref()),
            success_count: r.success_count,
            last_used_at: parse_datetime_opt(r.last_used_at),
            created_at: parse_datetime(&r.created_at),
            updated_at: parse_datetime(&r.updated_at),
        }
    }
}

/// Fields for a new template.
#[derive(Debug, Clone)]
pub struct TemplateInput {
    pub project_id: i32,
    pub name: String,
    pub crop_rect: Rect,
    pub orientation: Option<Orientation>,
    pub size_bucket: Option<String>,
    pub anchor_labels: Option<Vec<String>>,
    pub field_mappings: Option<FieldMappings>,
}

#[derive(Clone)]
pub struct TemplateRepository {
    pool: AsyncSqlitePool,
}

impl TemplateRepository {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: &TemplateInput) -> Result<i32, DieselError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        let crop_rect = serde_json::to_string(&input.crop_rect).map_err(to_diesel_error)?;
        let anchor_labels = input
            .anchor_labels
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(to_diesel_error)?;
        let field_mappings = input
            .field_mappings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(to_diesel_error)?;

        diesel::insert_into(title_block_templates::table)
            .values(NewTemplate {
                project_id: input.project_id,
                name: &input.name,
                crop_rect: &crop_rect,
                orientation: input.orientation.map(|o| o.as_str()),
                size_bucket: input.size_bucket.as_deref(),
                anchor_labels: anchor_labels.as_deref(),
                field_mappings: field_mappings.as_deref(),
                success_count: 0,
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

    pub async fn get(&self, id: i32) -> Result<Option<TitleBlockTemplate>, DieselError> {
        let mut conn = self.pool.get().await?;

        title_block_templates::table
            .find(id)
            .first::<TemplateRecord>(&mut conn)
            .await
            .optional()
            .map(|opt| opt.map(TitleBlockTemplate::from))
    }

    /// Templates of a project in creation order.
    pub async fn list_for_project(
        &self,
        project_id: i32,
    ) -> Result<Vec<TitleBlockTemplate>, DieselError> {
        let mut conn = self.pool.get().await?;

        title_block_templates::table
            .filter(title_block_templates::project_id.eq(project_id))
            .order(title_block_templates::id.asc())
            .load::<TemplateRecord>(&mut conn)
            .await
            .map(|records| records.into_iter().map(TitleBlockTemplate::from).collect())
    }

    pub async fn delete(&self, id: i32) -> Result<bool, DieselError> {
        let mut conn = self.pool.get().await?;

        let rows = diesel::delete(title_block_templates::table.find(id))
            .execute(&mut conn)
            .await?;
        Ok(rows > 0)
    }

    /// Bump the success counter and touch `last_used_at`.
    pub async fn record_success(&self, id: i32) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        diesel::update(title_block_templates::table.find(id))
            .set((
                title_block_templates::success_count.eq(title_block_templates::success_count + 1),
                title_block_templates::last_used_at.eq(Some(&now)),
                title_block_templates::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldMapping;
    use crate::repository::test_support::setup_test_db;

    fn input(project_id: i32) -> TemplateInput {
        let mut mappings = FieldMappings::new();
        mappings.insert(
            "drawing_number".into(),
            FieldMapping {
                bounding_box: Some(Rect::new(0.5, 0.5, 0.5, 0.2)),
                ..Default::default()
            },
        );
        TemplateInput {
            project_id,
            name: "Consultant A".into(),
            crop_rect: Rect::new(0.6, 0.7, 0.4, 0.3),
            orientation: Some(Orientation::Landscape),
            size_bucket: Some("7000x4950".into()),
            anchor_labels: Some(vec!["DWG NO".into(), "REV".into()]),
            field_mappings: Some(mappings),
        }
    }

    #[tokio::test]
    async fn test_template_crud() {
        let (pool, _dir) = setup_test_db().await;
        let repo = TemplateRepository::new(pool);

        let id = repo.create(&input(3)).await.unwrap();
        repo.create(&input(9)).await.unwrap();

        let t = repo.get(id).await.unwrap().unwrap();
        assert_eq!(t.crop_rect, Rect::new(0.6, 0.7, 0.4, 0.3));
        assert_eq!(t.orientation, Some(Orientation::Landscape));
        assert_eq!(t.anchor_labels.as_ref().unwrap().len(), 2);
        assert!(t.mappings().unwrap().contains_key("drawing_number"));
        assert_eq!(t.success_count, 0);

        assert_eq!(repo.list_for_project(3).await.unwrap().len(), 1);

        assert!(repo.delete(id).await.unwrap());
        assert!(!repo.delete(id).await.unwrap());
        assert!(repo.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_success() {
        let (pool, _dir) = setup_test_db().await;
        let repo = TemplateRepository::new(pool);
        let id = repo.create(&input(1)).await.unwrap();

        repo.record_success(id).await.unwrap();
        repo.record_success(id).await.unwrap();

        let t = repo.get(id).await.unwrap().unwrap();
        assert_eq!(t.success_count, 2);
        assert!(t.last_used_at.is_some());
    }
}
