//! Model-free plate finder.
//!
//! Looks for bright-bordered quadrilaterals with plate-like proportions in the edge map
//! of a vehicle region. Confidence is the extent (contour area over bounding box area).

use super::{nms, PlateLocalizer};
use crate::config::ContourConfig;
use crate::preprocess::{clahe, denoise, scale_to_width, PreprocessConfig};
use anyhow::Result;
use common::detections::{BoundingBox, DetectionCandidate};
use image::{imageops, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::geometry::{approximate_polygon_dp, arc_length, contour_area, convex_hull};
use imageproc::point::Point;
use imageproc::{edges, morphology};

#[derive(Debug, Clone)]
pub struct ContourPlateLocalizer {
    config: ContourConfig,
    filters: PreprocessConfig,
    iou_threshold: f32,
    max_plates: usize,
}

/// Shape measurements of one accepted contour, in resized-region pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Quad {
    bbox: BoundingBox,
    extent: f32,
}

impl ContourPlateLocalizer {
    pub fn new(
        config: ContourConfig,
        filters: PreprocessConfig,
        iou_threshold: f32,
        max_plates: usize,
    ) -> Self {
        Self {
            config,
            filters,
            iou_threshold,
            max_plates,
        }
    }

    fn find_quads(&self, region: &RgbImage) -> Vec<Quad> {
        let scaled = scale_to_width(region, self.config.resize_width);
        let gray = imageops::grayscale(&scaled);
        let enhanced = clahe(&gray, self.filters.clahe_clip_limit, self.filters.clahe_grid);
        let smoothed = denoise(&enhanced, &self.filters);
        let edge_map = edges::canny(&smoothed, self.config.canny_low, self.config.canny_high);
        // Close one-pixel gaps so plate borders trace as a single loop
        let edge_map = morphology::dilate(&edge_map, Norm::LInf, 1);

        let mut shapes: Vec<(f64, Vec<Point<i32>>)> = find_contours::<i32>(&edge_map)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.points.len() >= 4)
            .map(|c| (contour_area(&c.points), c.points))
            .collect();
        shapes.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        shapes.truncate(self.config.max_contours);

        let min_area =
            self.config.min_area_ratio as f64 * scaled.width() as f64 * scaled.height() as f64;

        shapes
            .into_iter()
            .filter(|(area, _)| *area >= min_area && *area > 0.0)
            .filter_map(|(area, points)| self.accept(area, &points))
            .collect()
    }

    fn accept(&self, area: f64, points: &[Point<i32>]) -> Option<Quad> {
        let epsilon = self.config.approx_epsilon * arc_length(points, true);
        if epsilon <= 0.0 || approximate_polygon_dp(points, epsilon, true).len() != 4 {
            return None;
        }

        let (min_x, min_y, max_x, max_y) = points.iter().fold(
            (i32::MAX, i32::MAX, i32::MIN, i32::MIN),
            |(x0, y0, x1, y1), p| (x0.min(p.x), y0.min(p.y), x1.max(p.x), y1.max(p.y)),
        );
        let width = (max_x - min_x + 1) as f64;
        let height = (max_y - min_y + 1) as f64;

        let aspect = (width / height) as f32;
        if aspect < self.config.min_aspect || aspect > self.config.max_aspect {
            return None;
        }

        let hull_area = contour_area(&convex_hull(points));
        if hull_area <= 0.0 || ((area / hull_area) as f32) < self.config.min_solidity {
            return None;
        }

        let extent = (area / (width * height)) as f32;
        if extent < self.config.min_extent {
            return None;
        }

        let bbox = BoundingBox::from_xywh(min_x, min_y, width as u32, height as u32)?;
        Some(Quad {
            bbox,
            extent: extent.min(1.0),
        })
    }
}

impl PlateLocalizer for ContourPlateLocalizer {
    fn name(&self) -> &str {
        "contour"
    }

    fn detect_plates(&self, region: &RgbImage) -> Result<Vec<DetectionCandidate>> {
        if region.width() == 0 || region.height() == 0 {
            return Ok(Vec::new());
        }

        let ratio = region.width() as f64 / self.config.resize_width as f64;
        let candidates = self
            .find_quads(region)
            .into_iter()
            .filter_map(|quad| {
                let b = quad.bbox;
                let bbox = BoundingBox::new(
                    (b.x1 as f64 * ratio).round() as i32,
                    (b.y1 as f64 * ratio).round() as i32,
                    (b.x2 as f64 * ratio).round() as i32,
                    (b.y2 as f64 * ratio).round() as i32,
                )?
                .clamp_to(region.width(), region.height())?;
                Some(DetectionCandidate::plate(bbox, quad.extent))
            })
            .collect();

        let mut kept = nms(candidates, self.iou_threshold);
        kept.truncate(self.max_plates);
        tracing::debug!(plates = kept.len(), "contour plate search finished");
        Ok(kept)
    }
}
