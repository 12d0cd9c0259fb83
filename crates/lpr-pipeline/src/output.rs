//! Persisting detection outputs next to each other in one directory.
//!
//! Layout for a source `street.jpg`:
//! - `result_street.png`: annotated image
//! - `plate_<vehicle>_<plate>_street.png`: one crop per plate
//! - `detections_street.json`: the [`DetectionReport`]

use anyhow::{Context, Result};
use common::detections::{DetectionResult, RegionRecognition};
use image::RgbImage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct DetectionReport {
    pub source: String,
    pub annotated_image: PathBuf,
    pub plate_images: Vec<PathBuf>,
    pub vehicles: Vec<DetectionResult>,
}

#[derive(Debug, Serialize)]
pub struct RegionReport {
    pub source: String,
    pub selection_image: PathBuf,
    #[serde(flatten)]
    pub recognition: RegionRecognition,
}

fn source_stem(source: &Path) -> String {
    source
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image")
        .to_string()
}

fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Write the annotated image, the plate crops and a JSON report into `out_dir`.
pub fn write_detection_outputs(
    out_dir: &Path,
    source: &Path,
    annotated: &RgbImage,
    results: &[DetectionResult],
) -> Result<DetectionReport> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let stem = source_stem(source);

    let annotated_image = out_dir.join(format!("result_{}.png", stem));
    save_png(annotated, &annotated_image)?;

    let mut plate_images = Vec::new();
    for (i, vehicle) in results.iter().enumerate() {
        for (j, plate) in vehicle.plates.iter().enumerate() {
            if plate.image.width() == 0 || plate.image.height() == 0 {
                continue;
            }
            let path = out_dir.join(format!("plate_{}_{}_{}.png", i, j, stem));
            save_png(&plate.image, &path)?;
            plate_images.push(path);
        }
    }

    let report = DetectionReport {
        source: source.display().to_string(),
        annotated_image,
        plate_images,
        vehicles: results.to_vec(),
    };

    let report_path = out_dir.join(format!("detections_{}.json", stem));
    fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .context("failed to write detection report")?;

    Ok(report)
}

/// Write the selected region as `manual_selection_<stem>.png`.
pub fn write_region_outputs(
    out_dir: &Path,
    source: &Path,
    recognition: RegionRecognition,
) -> Result<RegionReport> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let selection_image = out_dir.join(format!("manual_selection_{}.png", source_stem(source)));
    save_png(&recognition.image, &selection_image)?;

    Ok(RegionReport {
        source: source.display().to_string(),
        selection_image,
        recognition,
    })
}
