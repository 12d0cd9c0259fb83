//! Vehicle and plate localization.
//!
//! Backends implement [`VehicleLocalizer`] / [`PlateLocalizer`] and return boxes relative
//! to the image they were given. [`Localizer`] wraps a pair of backends, rejects empty
//! input, clamps every box to the input extents and maps backend failures into
//! [`PipelineError::Inference`].

pub mod contour;
pub mod yolo;

use crate::error::{PipelineError, Result};
use common::detections::DetectionCandidate;
use image::RgbImage;
use std::sync::Arc;

pub use contour::ContourPlateLocalizer;
pub use yolo::{YoloPlateLocalizer, YoloVehicleLocalizer};

/// Finds vehicles in a full image.
pub trait VehicleLocalizer: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates must carry a vehicle class; candidates without one are dropped.
    fn detect_vehicles(&self, image: &RgbImage) -> anyhow::Result<Vec<DetectionCandidate>>;
}

/// Finds plates inside a vehicle region.
pub trait PlateLocalizer: Send + Sync {
    fn name(&self) -> &str;

    fn detect_plates(&self, region: &RgbImage) -> anyhow::Result<Vec<DetectionCandidate>>;
}

#[derive(Clone)]
pub struct Localizer {
    vehicles: Arc<dyn VehicleLocalizer>,
    plates: Arc<dyn PlateLocalizer>,
}

impl std::fmt::Debug for Localizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Localizer")
            .field("vehicles", &self.vehicles.name())
            .field("plates", &self.plates.name())
            .finish()
    }
}

impl Localizer {
    pub fn new(vehicles: Arc<dyn VehicleLocalizer>, plates: Arc<dyn PlateLocalizer>) -> Self {
        Self { vehicles, plates }
    }

    pub fn detect_vehicles(&self, image: &RgbImage) -> Result<Vec<DetectionCandidate>> {
        ensure_non_empty(image)?;

        let candidates = self
            .vehicles
            .detect_vehicles(image)
            .map_err(PipelineError::inference)?;

        Ok(candidates
            .into_iter()
            .filter(|c| {
                if c.class.is_none() {
                    tracing::debug!(backend = self.vehicles.name(), "dropping vehicle without class");
                }
                c.class.is_some()
            })
            .filter_map(|c| clamp_candidate(c, image))
            .collect())
    }

    pub fn detect_plates(&self, region: &RgbImage) -> Result<Vec<DetectionCandidate>> {
        ensure_non_empty(region)?;

        let candidates = self
            .plates
            .detect_plates(region)
            .map_err(PipelineError::inference)?;

        Ok(candidates
            .into_iter()
            .filter_map(|c| clamp_candidate(c, region))
            .collect())
    }
}

fn ensure_non_empty(image: &RgbImage) -> Result<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::InvalidImage(format!(
            "image is empty ({}x{})",
            image.width(),
            image.height()
        )));
    }
    Ok(())
}

fn clamp_candidate(candidate: DetectionCandidate, image: &RgbImage) -> Option<DetectionCandidate> {
    let bbox = candidate.bbox.clamp_to(image.width(), image.height())?;
    Some(DetectionCandidate {
        bbox,
        confidence: candidate.confidence.clamp(0.0, 1.0),
        ..candidate
    })
}

/// Greedy Non-Maximum Suppression, highest confidence first.
pub fn nms(mut candidates: Vec<DetectionCandidate>, iou_threshold: f32) -> Vec<DetectionCandidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<DetectionCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if keep
            .iter()
            .all(|kept| kept.bbox.iou(&candidate.bbox) < iou_threshold)
        {
            keep.push(candidate);
        }
    }

    keep
}
