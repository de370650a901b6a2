//! Drawing sets: one uploaded PDF split into per-page sheets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{DrawingSetStatus, ExtractionStatus};

/// An uploaded multi-page drawing PDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawingSet {
    pub id: i32,
    pub project_id: i32,
    pub name: String,
    /// Storage key of the original PDF.
    pub original_pdf_key: String,
    pub page_count: i32,
    pub status: DrawingSetStatus,
    pub processing_errors: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sheet counts per extraction status. `total` is the set's page count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub success: i64,
    pub needs_review: i64,
    pub failed: i64,
}

impl ExtractionStats {
    /// Build from (status, count) pairs, ignoring unknown statuses.
    pub fn from_counts(total: i64, counts: &[(String, i64)]) -> Self {
        let mut stats = Self {
            total,
            ..Default::default()
        };
        for (status, count) in counts {
            match ExtractionStatus::from_str(status) {
                Some(ExtractionStatus::Queued) => stats.queued += count,
                Some(ExtractionStatus::Processing) => stats.processing += count,
                Some(ExtractionStatus::Success) => stats.success += count,
                Some(ExtractionStatus::NeedsReview) => stats.needs_review += count,
                Some(ExtractionStatus::Failed) => stats.failed += count,
                None => {}
            }
        }
        stats
    }

    /// Sheets that reached a terminal extraction state.
    pub fn processed(&self) -> i64 {
        self.success + self.needs_review + self.failed
    }

    /// Set status implied by the sheet counts. Checks run in priority order.
    pub fn derive_status(&self) -> DrawingSetStatus {
        if self.failed == self.total {
            DrawingSetStatus::Failed
        } else if self.success == self.total {
            DrawingSetStatus::Success
        } else if self.queued > 0 || self.processing > 0 {
            DrawingSetStatus::Processing
        } else if self.needs_review > 0 || self.failed > 0 {
            DrawingSetStatus::Partial
        } else {
            DrawingSetStatus::Success
        }
    }

    /// Percentage of pages processed, rounded. 0 for an empty set.
    pub fn progress_percent(&self) -> i64 {
        if self.total == 0 {
            return 0;
        }
        ((self.processed() as f64 / self.total as f64) * 100.0).round() as i64
    }

    pub fn is_fully_processed(&self) -> bool {
        self.queued == 0 && self.processing == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: i64, q: i64, p: i64, s: i64, r: i64, f: i64) -> ExtractionStats {
        ExtractionStats {
            total,
            queued: q,
            processing: p,
            success: s,
            needs_review: r,
            failed: f,
        }
    }

    #[test]
    fn test_derive_status_order() {
        assert_eq!(stats(3, 0, 0, 0, 0, 3).derive_status(), DrawingSetStatus::Failed);
        assert_eq!(stats(3, 0, 0, 3, 0, 0).derive_status(), DrawingSetStatus::Success);
        assert_eq!(stats(3, 1, 0, 1, 0, 1).derive_status(), DrawingSetStatus::Processing);
        assert_eq!(stats(3, 0, 1, 2, 0, 0).derive_status(), DrawingSetStatus::Processing);
        assert_eq!(stats(3, 0, 0, 2, 1, 0).derive_status(), DrawingSetStatus::Partial);
        assert_eq!(stats(3, 0, 0, 2, 0, 1).derive_status(), DrawingSetStatus::Partial);
    }

    #[test]
    fn test_empty_set_counts_as_failed() {
        // failed == total == 0 is checked first
        assert_eq!(stats(0, 0, 0, 0, 0, 0).derive_status(), DrawingSetStatus::Failed);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(stats(0, 0, 0, 0, 0, 0).progress_percent(), 0);
        assert_eq!(stats(3, 1, 0, 1, 1, 0).progress_percent(), 67);
        assert_eq!(stats(8, 0, 0, 1, 0, 0).progress_percent(), 13);
        assert_eq!(stats(4, 0, 0, 2, 1, 1).progress_percent(), 100);
    }

    #[test]
    fn test_from_counts_ignores_unknown() {
        let counts = vec![
            ("success".to_string(), 2),
            ("needs_review".to_string(), 1),
            ("bogus".to_string(), 7),
        ];
        let s = ExtractionStats::from_counts(5, &counts);
        assert_eq!(s, stats(5, 0, 0, 2, 1, 0));
        assert!(s.is_fully_processed());
    }
}
