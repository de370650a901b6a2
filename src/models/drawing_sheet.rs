//! Drawing sheets group sheets with the same drawing number across uploads,
//! giving each drawing a revision history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawingSheet {
    pub id: i32,
    pub project_id: i32,
    /// Normalised (upper-cased, trimmed) drawing number.
    pub sheet_number: String,
    pub title: Option<String>,
    pub discipline: Option<String>,
    pub current_revision_id: Option<i32>,
    pub revision_count: i32,
    pub last_revision_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DrawingSheet {
    /// Drawing number normalisation used for matching.
    pub fn normalize_number(number: &str) -> String {
        number.trim().to_uppercase()
    }
}

/// Revision number following `last` (A -> B, Z -> AA, 9 -> 10).
///
/// Anything that is neither numeric nor letters restarts at "A".
pub fn next_revision_after(last: Option<&str>) -> String {
    let Some(current) = last.filter(|s| !s.is_empty()) else {
        return "A".to_string();
    };

    if let Ok(n) = current.trim().parse::<f64>() {
        if n.is_finite() {
            return (n as i64).saturating_add(1).to_string();
        }
    }

    if current.bytes().all(|b| b.is_ascii_uppercase()) {
        return increment_letters(current);
    }

    "A".to_string()
}

fn increment_letters(letters: &str) -> String {
    let mut chars: Vec<u8> = letters.bytes().collect();
    for i in (0..chars.len()).rev() {
        if chars[i] != b'Z' {
            chars[i] += 1;
            return String::from_utf8_lossy(&chars).into_owned();
        }
        chars[i] = b'A';
    }
    format!("A{}", String::from_utf8_lossy(&chars))
}
