//! Repository layer for database persistence.
//!
//! All access goes through Diesel on SQLite via diesel-async's
//! `SyncConnectionWrapper`.

pub mod context;
pub mod diesel_models;
pub mod drawing_set;
pub mod drawing_sheet;
pub mod job;
pub mod migrations;
pub mod pool;
pub mod sheet;
pub mod template;
pub mod util;

pub use context::DbContext;
pub use drawing_set::DrawingSetRepository;
pub use drawing_sheet::DrawingSheetRepository;
pub use job::{JobRepository, JobSpec, StaleRecovery, STALE_ERROR};
pub use pool::{AsyncSqlitePool, DieselError};
pub use sheet::{ExtractionUpdate, RenderedPage, SheetRepository};
pub use template::{TemplateInput, TemplateRepository};
pub use util::{is_busy, parse_datetime, parse_datetime_opt};

use diesel::QueryableByName;

#[derive(QueryableByName)]
pub(crate) struct LastInsertRowId {
    #[diesel(sql_type = diesel::sql_types::BigInt, column_name = "last_insert_rowid()")]
    pub id: i64,
}
