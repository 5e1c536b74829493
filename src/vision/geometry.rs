//! Overlap metrics between axis-aligned boxes
//!
//! Both metrics return 0.0 instead of failing on malformed input; callers that
//! care about data quality check [`BBox::is_valid`] themselves and log.

use super::BBox;

/// Intersection area of two boxes, 0 when they do not overlap
fn intersection_area(a: &BBox, b: &BBox) -> i64 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let w = x2 as i64 - x1 as i64;
    let h = y2 as i64 - y1 as i64;
    if w <= 0 || h <= 0 {
        return 0;
    }
    w * h
}

/// Intersection over Union, in `[0, 1]`
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    if !a.is_valid() || !b.is_valid() {
        return 0.0;
    }

    let inter = intersection_area(a, b);
    if inter == 0 {
        return 0.0;
    }

    let union = a.area() + b.area() - inter;
    if union <= 0 {
        return 0.0;
    }

    (inter as f64 / union as f64).clamp(0.0, 1.0) as f32
}

/// Share of `child` covered by `parent`, in `[0, 1]`
pub fn containment(parent: &BBox, child: &BBox) -> f32 {
    if !parent.is_valid() || !child.is_valid() {
        return 0.0;
    }

    let inter = intersection_area(parent, child);
    let child_area = child.area();
    if inter == 0 || child_area <= 0 {
        return 0.0;
    }

    (inter as f64 / child_area as f64).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[BBox] = &[
        BBox::new(0, 0, 100, 100),
        BBox::new(50, 50, 150, 150),
        BBox::new(10, 10, 20, 20),
        BBox::new(-30, -5, 5, 40),
        BBox::new(200, 200, 201, 201),
        BBox::new(0, 0, 200, 50),
    ];

    #[test]
    fn test_iou_identity() {
        for b in SAMPLES {
            assert!((iou(b, b) - 1.0).abs() < 1e-6, "iou({b}, {b}) != 1");
        }
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BBox::new(0, 0, 100, 100);
        let b = BBox::new(50, 50, 150, 150);
        // 2500 / (10000 + 10000 - 2500)
        assert!((iou(&a, &b) - 0.142_857).abs() < 1e-4);
    }

    #[test]
    fn test_iou_disjoint_and_touching() {
        let a = BBox::new(0, 0, 10, 10);
        assert_eq!(iou(&a, &BBox::new(20, 20, 30, 30)), 0.0);
        // Shared edge has zero area
        assert_eq!(iou(&a, &BBox::new(10, 0, 20, 10)), 0.0);
    }

    #[test]
    fn test_iou_symmetric_and_bounded() {
        for a in SAMPLES {
            for b in SAMPLES {
                let ab = iou(a, b);
                let ba = iou(b, a);
                assert_eq!(ab, ba, "iou not symmetric for {a} / {b}");
                assert!((0.0..=1.0).contains(&ab));
            }
        }
    }

    #[test]
    fn test_invalid_boxes_yield_zero() {
        let valid = BBox::new(0, 0, 10, 10);
        let inverted = BBox::new(10, 10, 0, 0);
        let flat = BBox::new(0, 5, 10, 5);
        assert_eq!(iou(&valid, &inverted), 0.0);
        assert_eq!(iou(&flat, &valid), 0.0);
        assert_eq!(iou(&flat, &flat), 0.0);
        assert_eq!(containment(&inverted, &valid), 0.0);
        assert_eq!(containment(&valid, &flat), 0.0);
    }

    #[test]
    fn test_containment_enclosed_child() {
        let parent = BBox::new(0, 0, 200, 50);
        let child = BBox::new(10, 10, 100, 20);
        assert!((containment(&parent, &child) - 1.0).abs() < 1e-6);
        // The same pair scores low on plain IoU
        assert!(iou(&parent, &child) < 0.1);
    }

    #[test]
    fn test_containment_half_outside() {
        let parent = BBox::new(0, 0, 100, 100);
        let child = BBox::new(50, 0, 150, 10);
        assert!((containment(&parent, &child) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_large_coordinates_do_not_overflow() {
        let a = BBox::new(0, 0, 1_000_000, 1_000_000);
        let b = BBox::new(0, 0, 1_000_000, 500_000);
        assert!((iou(&a, &b) - 0.5).abs() < 1e-6);
    }
}
