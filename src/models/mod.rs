//! Data models for drawing sets, sheets, title-block templates, and jobs.

mod drawing_set;
mod drawing_sheet;
mod geometry;
mod job;
mod sheet;
mod status;
mod template;

pub use drawing_set::{DrawingSet, ExtractionStats};
pub use drawing_sheet::{next_revision_after, DrawingSheet};
pub use geometry::{Orientation, PixelRect, Rect};
pub use job::{Job, JobStatus};
pub use sheet::{Sheet, MAX_HEURISTIC_CROP_BYTES};
pub use status::{DrawingSetStatus, ExtractionStatus, SheetStatus};
pub use template::{FieldMapping, FieldMappings, TitleBlockTemplate, MAPPED_FIELDS};
