//! Overlay drawing for recognized images.

use common::detections::{BoundingBox, DetectionResult};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub const VEHICLE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const PLATE_READ_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const PLATE_UNREAD_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Border width in pixels
pub const BORDER_THICKNESS: u32 = 2;

/// Draw a box border `thickness` pixels wide, growing inwards from the box edge.
pub fn draw_box(canvas: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    for i in 0..thickness {
        let inset = i as i32;
        let width = bbox.width().saturating_sub(2 * i);
        let height = bbox.height().saturating_sub(2 * i);
        if width == 0 || height == 0 {
            break;
        }
        let rect = Rect::at(bbox.x1 + inset, bbox.y1 + inset).of_size(width, height);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

/// Copy of `image` with vehicles in green, canonical plates in blue and every other
/// plate in red.
pub fn annotate(image: &RgbImage, results: &[DetectionResult]) -> RgbImage {
    let mut canvas = image.clone();

    for result in results {
        draw_box(&mut canvas, &result.vehicle_bbox, VEHICLE_COLOR, BORDER_THICKNESS);

        for plate in &result.plates {
            let color = if plate.canonical {
                PLATE_READ_COLOR
            } else {
                PLATE_UNREAD_COLOR
            };
            draw_box(&mut canvas, &plate.bbox, color, BORDER_THICKNESS);
        }
    }

    canvas
}

/// Like [`annotate`], but a drawing failure only logs and returns the plain copy.
pub fn annotate_best_effort(image: &RgbImage, results: &[DetectionResult]) -> RgbImage {
    match catch_unwind(AssertUnwindSafe(|| annotate(image, results))) {
        Ok(annotated) => annotated,
        Err(_) => {
            tracing::warn!(
                vehicles = results.len(),
                "annotation failed, returning unannotated image"
            );
            image.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::detections::{NormalizationPass, PlateResult, VehicleClass};

    fn plate(bbox: BoundingBox, canonical: bool) -> PlateResult {
        PlateResult {
            bbox,
            text: if canonical { "1234AB56".into() } else { String::new() },
            raw_text: String::new(),
            confidence: 0.0,
            detection_confidence: 0.9,
            pass: if canonical {
                NormalizationPass::Direct
            } else {
                NormalizationPass::BestEffort
            },
            canonical,
            image: RgbImage::new(1, 1),
        }
    }

    #[test]
    fn test_colors_by_outcome() {
        let image = RgbImage::new(100, 100);
        let results = vec![DetectionResult {
            vehicle_bbox: BoundingBox::new(5, 5, 95, 95).unwrap(),
            vehicle_confidence: 0.9,
            vehicle_class: VehicleClass::Car,
            plates: vec![
                plate(BoundingBox::new(20, 60, 50, 70).unwrap(), true),
                plate(BoundingBox::new(60, 60, 90, 70).unwrap(), false),
            ],
        }];

        let annotated = annotate(&image, &results);
        assert_eq!(*annotated.get_pixel(5, 50), VEHICLE_COLOR);
        assert_eq!(*annotated.get_pixel(6, 50), VEHICLE_COLOR);
        assert_eq!(*annotated.get_pixel(7, 50), Rgb([0, 0, 0]));
        assert_eq!(*annotated.get_pixel(20, 65), PLATE_READ_COLOR);
        assert_eq!(*annotated.get_pixel(60, 65), PLATE_UNREAD_COLOR);
        // Source untouched
        assert_eq!(*image.get_pixel(5, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_box_at_image_edge_is_clipped() {
        let image = RgbImage::new(20, 20);
        let results = vec![DetectionResult {
            vehicle_bbox: BoundingBox::new(0, 0, 20, 20).unwrap(),
            vehicle_confidence: 0.5,
            vehicle_class: VehicleClass::Truck,
            plates: Vec::new(),
        }];

        let annotated = annotate_best_effort(&image, &results);
        assert_eq!(*annotated.get_pixel(0, 0), VEHICLE_COLOR);
        assert_eq!(*annotated.get_pixel(19, 19), VEHICLE_COLOR);
        assert_eq!(*annotated.get_pixel(10, 10), Rgb([0, 0, 0]));
    }
}
