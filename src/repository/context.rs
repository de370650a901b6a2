//! Database context: one entry point for all repositories.

use std::path::Path;

use super::drawing_set::DrawingSetRepository;
use super::drawing_sheet::DrawingSheetRepository;
use super::job::JobRepository;
use super::migrations;
use super::pool::{AsyncSqlitePool, DieselError};
use super::sheet::SheetRepository;
use super::template::TemplateRepository;

/// Create one context per command or worker and hand out repositories from it.
///
/// ```ignore
/// let ctx = DbContext::from_url(&settings.database_url());
/// let set = ctx.drawing_sets().get(id).await?;
/// ```
#[derive(Clone)]
pub struct DbContext {
    pool: AsyncSqlitePool,
}

impl DbContext {
    pub fn from_url(database_url: &str) -> Self {
        Self {
            pool: AsyncSqlitePool::new(database_url),
        }
    }

    pub fn from_path(db_path: &Path) -> Self {
        Self {
            pool: AsyncSqlitePool::from_path(db_path),
        }
    }

    pub fn pool(&self) -> &AsyncSqlitePool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<Vec<String>, DieselError> {
        migrations::run_migrations(self.pool.database_url()).await
    }

    pub fn drawing_sets(&self) -> DrawingSetRepository {
        DrawingSetRepository::new(self.pool.clone())
    }

    pub fn sheets(&self) -> SheetRepository {
        SheetRepository::new(self.pool.clone())
    }

    pub fn templates(&self) -> TemplateRepository {
        TemplateRepository::new(self.pool.clone())
    }

    pub fn drawing_sheets(&self) -> DrawingSheetRepository {
        DrawingSheetRepository::new(self.pool.clone())
    }

    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.pool.clone())
    }
}
