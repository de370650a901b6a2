//! Title-block templates: reusable crop regions learned per project.
//!
//! A template is matched to a sheet by orientation and rendered size bucket.
//! Templates may also carry per-field regions ("field mappings") drawn
//! inside the crop, which bypass query-based extraction entirely.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geometry::{Orientation, PixelRect, Rect};

/// Fields a template can map, in extraction order.
pub const MAPPED_FIELDS: [&str; 3] = ["drawing_number", "drawing_title", "revision"];

/// Track-record bonus cap.
const MAX_SUCCESS_BONUS: u32 = 20;

/// Region for one field. `boundingBox` is relative to the template crop;
/// the bare `x/y/w/h` form is the legacy full-page layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(
        rename = "boundingBox",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bounding_box: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
}

impl FieldMapping {
    /// Resolve to full-page coordinates given the template crop.
    pub fn page_rect(&self, crop: &Rect) -> Option<Rect> {
        if let Some(bb) = &self.bounding_box {
            return Some(crop.project(bb));
        }
        match (self.x, self.y, self.w, self.h) {
            (Some(x), Some(y), Some(w), Some(h)) => Some(Rect::new(x, y, w, h)),
            _ => None,
        }
    }
}

pub type FieldMappings = BTreeMap<String, FieldMapping>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleBlockTemplate {
    pub id: i32,
    pub project_id: i32,
    pub name: String,
    pub crop_rect: Rect,
    pub orientation: Option<Orientation>,
    /// Rendered page size, e.g. "7000x4950".
    pub size_bucket: Option<String>,
    pub anchor_labels: Option<Vec<String>>,
    pub field_mappings: Option<FieldMappings>,
    pub success_count: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TitleBlockTemplate {
    /// Field mappings, if the template has any.
    pub fn mappings(&self) -> Option<&FieldMappings> {
        self.field_mappings.as_ref().filter(|m| !m.is_empty())
    }

    /// Crop rectangle in pixels for a given image size.
    pub fn crop_pixels(&self, image_width: u32, image_height: u32) -> PixelRect {
        let r = &self.crop_rect;
        PixelRect {
            x: (r.x * image_width as f64).round() as i64,
            y: (r.y * image_height as f64).round() as i64,
            w: (r.w * image_width as f64).round() as i64,
            h: (r.h * image_height as f64).round() as i64,
        }
    }

    /// Score how well this template fits a sheet. Zero means unusable.
    pub fn match_score(&self, orientation: Option<Orientation>, size_bucket: Option<&str>) -> u32 {
        if self.orientation.is_some() && self.orientation != orientation {
            return 0;
        }
        let mut score = 100;

        match (self.size_bucket.as_deref(), size_bucket) {
            (None, _) => score += 50,
            (Some(own), Some(other)) if own == other => score += 80,
            (Some(own), Some(other)) => {
                if let (Some((tw, th)), Some((sw, sh))) =
                    (parse_size_bucket(own), parse_size_bucket(other))
                {
                    let width_ratio = tw.min(sw) as f64 / tw.max(sw) as f64;
                    let height_ratio = th.min(sh) as f64 / th.max(sh) as f64;
                    if width_ratio > 0.9 && height_ratio > 0.9 {
                        score += 60;
                    } else if width_ratio > 0.8 && height_ratio > 0.8 {
                        score += 30;
                    }
                }
            }
            (Some(_), None) => {}
        }

        score + (self.success_count.max(0) as u32).min(MAX_SUCCESS_BONUS)
    }

    /// Pick the best `limit` templates for a sheet, highest score first.
    ///
    /// Equal scores keep their input order.
    pub fn find_best_matches(
        templates: &[TitleBlockTemplate],
        orientation: Option<Orientation>,
        size_bucket: Option<&str>,
        limit: usize,
    ) -> Vec<(u32, TitleBlockTemplate)> {
        let mut scored: Vec<(u32, TitleBlockTemplate)> = templates
            .iter()
            .filter(|t| t.orientation.is_none() || t.orientation == orientation)
            .map(|t| (t.match_score(orientation, size_bucket), t.clone()))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(limit);
        scored
    }

    /// Size bucket for pixel dimensions, rounded to the nearest 50 px.
    pub fn create_size_bucket(width: u32, height: u32) -> String {
        let round50 = |v: u32| ((v as f64 / 50.0).round() as u64) * 50;
        format!("{}x{}", round50(width), round50(height))
    }
}

fn parse_size_bucket(bucket: &str) -> Option<(u64, u64)> {
    let (w, h) = bucket.split_once('x')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(w) || !digits(h) {
        return None;
    }
    Some((w.parse().ok()?, h.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(
        id: i32,
        orientation: Option<Orientation>,
        bucket: Option<&str>,
        success_count: i32,
    ) -> TitleBlockTemplate {
        let now = Utc::now();
        TitleBlockTemplate {
            id,
            project_id: 1,
            name: format!("template {id}"),
            crop_rect: Rect::new(0.6, 0.7, 0.4, 0.3),
            orientation,
            size_bucket: bucket.map(String::from),
            anchor_labels: None,
            field_mappings: None,
            success_count,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_orientation_mismatch_scores_zero() {
        let t = template(1, Some(Orientation::Portrait), None, 50);
        assert_eq!(t.match_score(Some(Orientation::Landscape), None), 0);
    }

    #[test]
    fn test_score_components() {
        let l = Some(Orientation::Landscape);
        // any size: 100 + 50
        assert_eq!(template(1, None, None, 0).match_score(l, Some("7000x4950")), 150);
        // exact bucket: 100 + 80 + 5
        assert_eq!(
            template(1, l, Some("7000x4950"), 5).match_score(l, Some("7000x4950")),
            185
        );
        // within 10%: 100 + 60
        assert_eq!(
            template(1, l, Some("7000x4950"), 0).match_score(l, Some("6600x4700")),
            160
        );
        // within 20%: 100 + 30
        assert_eq!(
            template(1, l, Some("7000x4950"), 0).match_score(l, Some("6000x4200")),
            130
        );
        // far off: 100 only; bonus capped at 20
        assert_eq!(
            template(1, l, Some("7000x4950"), 99).match_score(l, Some("3500x2500")),
            120
        );
        // sheet without a bucket gets no size points
        assert_eq!(template(1, l, Some("7000x4950"), 0).match_score(l, None), 100);
    }

    #[test]
    fn test_unparseable_bucket_gets_no_size_points() {
        let l = Some(Orientation::Landscape);
        assert_eq!(template(1, l, Some("A1"), 0).match_score(l, Some("7000x4950")), 100);
    }

    #[test]
    fn test_find_best_matches_orders_and_limits() {
        let l = Some(Orientation::Landscape);
        let templates = vec![
            template(1, None, None, 0),                           // 150
            template(2, l, Some("7000x4950"), 3),                 // 183
            template(3, Some(Orientation::Portrait), None, 20),   // filtered
            template(4, l, Some("6600x4700"), 0),                 // 160
        ];
        let best = TitleBlockTemplate::find_best_matches(&templates, l, Some("7000x4950"), 2);
        let ids: Vec<i32> = best.iter().map(|(_, t)| t.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(best[0].0, 183);
    }

    #[test]
    fn test_create_size_bucket() {
        assert_eq!(TitleBlockTemplate::create_size_bucket(7016, 4961), "7000x4950");
        assert_eq!(TitleBlockTemplate::create_size_bucket(7025, 4975), "7050x5000");
        assert_eq!(TitleBlockTemplate::create_size_bucket(10, 24), "0x0");
    }

    #[test]
    fn test_crop_pixels() {
        let t = template(1, None, None, 0);
        assert_eq!(
            t.crop_pixels(1000, 500),
            PixelRect {
                x: 600,
                y: 350,
                w: 400,
                h: 150
            }
        );
    }

    #[test]
    fn test_field_mapping_formats() {
        let json = r#"{
            "drawing_number": {"boundingBox": {"x": 0.5, "y": 0.5, "w": 0.5, "h": 0.5}},
            "revision": {"x": 0.9, "y": 0.95, "w": 0.02, "h": 0.01},
            "drawing_title": {"x": 0.1}
        }"#;
        let mappings: FieldMappings = serde_json::from_str(json).unwrap();
        let crop = Rect::new(0.6, 0.6, 0.4, 0.4);

        let number = mappings["drawing_number"].page_rect(&crop).unwrap();
        assert!((number.x - 0.8).abs() < 1e-9);
        assert!((number.w - 0.2).abs() < 1e-9);

        let revision = mappings["revision"].page_rect(&crop).unwrap();
        assert_eq!(revision, Rect::new(0.9, 0.95, 0.02, 0.01));

        assert!(mappings["drawing_title"].page_rect(&crop).is_none());
    }
}
