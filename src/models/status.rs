//! Status enums stored as text columns.

use serde::{Deserialize, Serialize};

/// Extraction state of a single sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Queued,
    Processing,
    Success,
    NeedsReview,
    Failed,
}

impl ExtractionStatus {
    pub const ALL: [ExtractionStatus; 5] = [
        Self::Queued,
        Self::Processing,
        Self::Success,
        Self::NeedsReview,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::NeedsReview => "needs_review",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "needs_review" => Some(Self::NeedsReview),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether extraction has reached a terminal state.
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Success | Self::NeedsReview | Self::Failed)
    }
}

/// Aggregate state of a drawing set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawingSetStatus {
    Queued,
    Processing,
    Partial,
    Success,
    Failed,
}

impl DrawingSetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Partial => "partial",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "partial" => Some(Self::Partial),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Revision workflow state of a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStatus {
    Draft,
    Processing,
    PendingReview,
    Active,
    Superseded,
    Archived,
}

impl SheetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Processing => "processing",
            Self::PendingReview => "pending_review",
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "processing" => Some(Self::Processing),
            "pending_review" => Some(Self::PendingReview),
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}
