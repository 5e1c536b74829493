//! Vision Layer
//!
//! Detection and OCR types shared by the pipeline, the collaborator traits the
//! pipeline calls into, and the geometry used to group detections into records.
//! Model inference and text extraction are supplied by the caller:
//! - [`Detector`] returns labelled boxes for a frame
//! - [`TextRecognizer`] reads the text inside one box

pub mod annotate;
pub mod geometry;
pub mod hierarchy;
pub mod manifest;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::capture::frame::Frame;

pub use geometry::{containment, iou};
pub use hierarchy::{GroupedRecord, Hierarchy, HierarchicalResolver, MatchMetric};

/// Axis-aligned rectangle in pixel coordinates, `(x1, y1)` inclusive top-left
/// and `(x2, y2)` exclusive bottom-right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// A box is valid when it has positive width and height
    pub fn is_valid(&self) -> bool {
        self.x2 > self.x1 && self.y2 > self.y1
    }

    pub fn width(&self) -> i64 {
        self.x2 as i64 - self.x1 as i64
    }

    pub fn height(&self) -> i64 {
        self.y2 as i64 - self.y1 as i64
    }

    /// Area, zero for invalid boxes
    pub fn area(&self) -> i64 {
        if self.is_valid() {
            self.width() * self.height()
        } else {
            0
        }
    }

    /// True when every edge differs from `other` by at most `tolerance` pixels
    pub fn within_tolerance(&self, other: &BBox, tolerance: i32) -> bool {
        let close = |a: i32, b: i32| (a as i64 - b as i64).abs() <= tolerance as i64;
        close(self.x1, other.x1)
            && close(self.y1, other.y1)
            && close(self.x2, other.x2)
            && close(self.y2, other.y2)
    }

    /// Grow by `margin` on every side and clip to `(width, height)`
    pub fn expand_clamped(&self, margin: u32, width: u32, height: u32) -> BBox {
        let m = margin as i64;
        let clip = |v: i64, limit: u32| v.clamp(0, (limit as i64).min(i32::MAX as i64)) as i32;
        BBox {
            x1: clip(self.x1 as i64 - m, width),
            y1: clip(self.y1 as i64 - m, height),
            x2: clip(self.x2 as i64 + m, width),
            y2: clip(self.y2 as i64 + m, height),
        }
    }
}

impl std::fmt::Display for BBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}) - ({}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// A labelled box produced by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Detector class name
    #[serde(rename = "class")]
    pub class_label: String,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32, class_label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            class_label: class_label.into(),
        }
    }
}

/// Object detector collaborator
pub trait Detector: Send + Sync {
    /// Detect objects with at least `confidence_threshold` confidence
    fn detect(&self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>>;
}

/// OCR collaborator
pub trait TextRecognizer: Send + Sync {
    /// Read the text inside `bbox`, padded by `margin` pixels.
    ///
    /// Returns an empty string when nothing could be read.
    fn extract_text(&self, frame: &Frame, bbox: &BBox, margin: u32) -> String;
}

/// Stable top-to-bottom, left-to-right ordering
pub fn sort_by_position(detections: &mut [Detection]) {
    detections.sort_by_key(|d| (d.bbox.y1, d.bbox.x1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_validity() {
        assert!(BBox::new(0, 0, 10, 10).is_valid());
        assert!(!BBox::new(10, 0, 10, 10).is_valid());
        assert!(!BBox::new(0, 5, 10, 2).is_valid());
        assert_eq!(BBox::new(10, 0, 5, 5).area(), 0);
    }

    #[test]
    fn test_within_tolerance() {
        let a = BBox::new(100, 100, 200, 150);
        assert!(a.within_tolerance(&BBox::new(108, 92, 210, 141), 10));
        assert!(!a.within_tolerance(&BBox::new(111, 100, 200, 150), 10));
    }

    #[test]
    fn test_expand_clamped() {
        let b = BBox::new(2, 3, 98, 48).expand_clamped(5, 100, 50);
        assert_eq!(b, BBox::new(0, 0, 100, 50));
    }

    #[test]
    fn test_extreme_coordinates_do_not_overflow() {
        let far_left = BBox::new(-2_000_000_000, 0, -1_999_999_000, 10);
        let far_right = BBox::new(2_000_000_000, 0, 2_000_001_000, 10);
        assert!(!far_left.within_tolerance(&far_right, 10));
        assert!(far_left.within_tolerance(&far_left, 0));

        let wide = BBox::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert_eq!(wide.expand_clamped(5, 640, 480), BBox::new(0, 0, 640, 480));
        assert_eq!(
            far_right.expand_clamped(u32::MAX, u32::MAX, 10),
            BBox::new(0, 0, i32::MAX, 10)
        );
    }

    #[test]
    fn test_detection_json_uses_class_key() {
        let det = Detection::new(BBox::new(1, 2, 3, 4), 0.9, "title");
        let json = serde_json::to_string(&det).unwrap();
        assert!(json.contains("\"class\":\"title\""));
    }

    #[test]
    fn test_sort_by_position() {
        let mut dets = vec![
            Detection::new(BBox::new(0, 50, 10, 60), 0.9, "a"),
            Detection::new(BBox::new(20, 10, 30, 20), 0.9, "b"),
            Detection::new(BBox::new(0, 10, 10, 20), 0.9, "c"),
        ];
        sort_by_position(&mut dets);
        let order: Vec<&str> = dets.iter().map(|d| d.class_label.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }
}
