//! Display annotation
//!
//! Draws the resolved hierarchy over a copy of the frame: containers in green,
//! assigned attributes in blue and orphaned attributes in red.

use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use super::{BBox, Hierarchy};
use crate::capture::Frame;
use crate::error::CacheError;

const CONTAINER_COLOR: Rgba<u8> = Rgba([0, 200, 0, 255]);
const ATTRIBUTE_COLOR: Rgba<u8> = Rgba([30, 110, 255, 255]);
const ORPHAN_COLOR: Rgba<u8> = Rgba([230, 30, 30, 255]);

/// Annotated frame ready for display
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    /// Sequence number of the source frame
    pub sequence: u64,
    pub image: RgbaImage,
    pub record_count: usize,
    pub orphan_count: usize,
}

/// Render `hierarchy` onto an RGBA copy of `frame`
pub fn annotate(frame: &Frame, hierarchy: &Hierarchy) -> Result<DisplayFrame, CacheError> {
    let mut image = frame.to_rgba()?;

    for record in &hierarchy.records {
        draw_box(&mut image, &record.container.bbox, CONTAINER_COLOR);
        for attribute in record.attributes.values() {
            draw_box(&mut image, &attribute.bbox, ATTRIBUTE_COLOR);
        }
    }
    for orphan in &hierarchy.orphans {
        draw_box(&mut image, &orphan.bbox, ORPHAN_COLOR);
    }

    Ok(DisplayFrame {
        sequence: frame.sequence,
        image,
        record_count: hierarchy.records.len(),
        orphan_count: hierarchy.orphans.len(),
    })
}

/// Outline `bbox`, clipped to the image; boxes fully outside are skipped
fn draw_box(image: &mut RgbaImage, bbox: &BBox, color: Rgba<u8>) {
    let (width, height) = image.dimensions();
    let clipped = bbox.expand_clamped(0, width, height);
    if !clipped.is_valid() {
        return;
    }
    let rect = Rect::at(clipped.x1, clipped.y1)
        .of_size(clipped.width() as u32, clipped.height() as u32);
    draw_hollow_rect_mut(image, rect, color);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{Detection, GroupedRecord};

    fn blank_frame() -> Frame {
        Frame::from_rgba_image(RgbaImage::from_pixel(100, 80, Rgba([0, 0, 0, 255])))
    }

    #[test]
    fn test_colors_by_role() {
        let mut record = GroupedRecord::new(
            "item_001",
            Detection::new(BBox::new(0, 0, 60, 40), 0.9, "list-item"),
        );
        record.attributes.insert(
            "title".to_string(),
            Detection::new(BBox::new(10, 10, 50, 20), 0.8, "title"),
        );
        let hierarchy = Hierarchy {
            records: vec![record],
            orphans: vec![Detection::new(BBox::new(70, 50, 90, 70), 0.7, "title")],
        };

        let display = annotate(&blank_frame(), &hierarchy).unwrap();
        assert_eq!(display.record_count, 1);
        assert_eq!(display.orphan_count, 1);
        assert_eq!(*display.image.get_pixel(0, 0), CONTAINER_COLOR);
        assert_eq!(*display.image.get_pixel(10, 10), ATTRIBUTE_COLOR);
        assert_eq!(*display.image.get_pixel(70, 50), ORPHAN_COLOR);
        // Interior stays untouched
        assert_eq!(*display.image.get_pixel(30, 30), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_boxes_outside_are_clipped_or_skipped() {
        let hierarchy = Hierarchy {
            records: vec![GroupedRecord::new(
                "item_001",
                Detection::new(BBox::new(-20, -20, 500, 500), 0.9, "list-item"),
            )],
            orphans: vec![Detection::new(BBox::new(200, 200, 300, 300), 0.7, "title")],
        };
        let display = annotate(&blank_frame(), &hierarchy).unwrap();
        assert_eq!(*display.image.get_pixel(0, 0), CONTAINER_COLOR);
        assert_eq!(*display.image.get_pixel(99, 79), CONTAINER_COLOR);
    }
}
