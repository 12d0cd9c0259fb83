//! YOLOv8 vehicle and plate localizers backed by ONNX Runtime

use super::{nms, PlateLocalizer, VehicleLocalizer};
use crate::config::LocalizerConfig;
use crate::models::OnnxModel;
use anyhow::{ensure, Result};
use common::detections::{BoundingBox, DetectionCandidate, VehicleClass};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, ArrayD, IxDyn};
use std::sync::Arc;

const OUTPUT_NAMES: &[&str] = &["output0", "output"];

/// One decoded prediction before class filtering and NMS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: usize,
}

/// Resize to `size` x `size` and convert to NCHW normalized to [0, 1].
pub fn image_to_nchw(image: &RgbImage, size: u32) -> ArrayD<f32> {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);

    let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
    for (x, y, pixel) in resized.enumerate_pixels() {
        input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }

    input
}

/// Decode a YOLOv8 `[1, 4 + classes, predictions]` output into boxes of the original
/// image, keeping predictions whose best class score reaches `confidence_threshold`.
pub fn decode_output(
    output: &ArrayD<f32>,
    original_width: u32,
    original_height: u32,
    input_size: u32,
    confidence_threshold: f32,
) -> Result<Vec<RawDetection>> {
    let shape = output.shape();
    ensure!(
        shape.len() == 3 && shape[0] >= 1 && shape[1] > 4,
        "unexpected YOLO output shape {:?}",
        shape
    );

    let scale_x = original_width as f32 / input_size as f32;
    let scale_y = original_height as f32 / input_size as f32;
    let num_classes = shape[1] - 4;
    let num_predictions = shape[2];

    let mut detections = Vec::new();
    for i in 0..num_predictions {
        let mut max_class_score = f32::MIN;
        let mut max_class_idx = 0;
        for class_idx in 0..num_classes {
            let score = output[[0, 4 + class_idx, i]];
            if score > max_class_score {
                max_class_score = score;
                max_class_idx = class_idx;
            }
        }

        if max_class_score < confidence_threshold {
            continue;
        }

        // (cx, cy, w, h) in model input pixels
        let cx = output[[0, 0, i]];
        let cy = output[[0, 1, i]];
        let w = output[[0, 2, i]];
        let h = output[[0, 3, i]];

        let x1 = ((cx - w / 2.0) * scale_x).round() as i32;
        let y1 = ((cy - h / 2.0) * scale_y).round() as i32;
        let x2 = ((cx + w / 2.0) * scale_x).round() as i32;
        let y2 = ((cy + h / 2.0) * scale_y).round() as i32;

        let Some(bbox) = BoundingBox::new(x1, y1, x2, y2)
            .and_then(|b| b.clamp_to(original_width, original_height))
        else {
            continue;
        };

        detections.push(RawDetection {
            bbox,
            confidence: max_class_score,
            class_id: max_class_idx,
        });
    }

    Ok(detections)
}

#[derive(Debug, Clone, Copy)]
struct DecodeSettings {
    input_size: u32,
    confidence: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl DecodeSettings {
    fn run(&self, model: &OnnxModel, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let input = image_to_nchw(image, self.input_size);
        let output = model.run(input, OUTPUT_NAMES)?;
        decode_output(
            &output,
            image.width(),
            image.height(),
            self.input_size,
            self.confidence,
        )
    }
}

/// COCO-trained YOLOv8 restricted to car, motorcycle, bus and truck.
pub struct YoloVehicleLocalizer {
    model: Arc<OnnxModel>,
    settings: DecodeSettings,
}

impl YoloVehicleLocalizer {
    pub fn new(model: Arc<OnnxModel>, config: &LocalizerConfig) -> Self {
        Self {
            model,
            settings: DecodeSettings {
                input_size: config.input_size,
                confidence: config.vehicle_confidence,
                iou_threshold: config.iou_threshold,
                max_detections: config.max_vehicles,
            },
        }
    }
}

impl VehicleLocalizer for YoloVehicleLocalizer {
    fn name(&self) -> &str {
        "yolov8_vehicle"
    }

    fn detect_vehicles(&self, image: &RgbImage) -> Result<Vec<DetectionCandidate>> {
        let raw = self.settings.run(&self.model, image)?;
        Ok(vehicle_candidates(
            raw,
            self.settings.iou_threshold,
            self.settings.max_detections,
        ))
    }
}

/// Keep allow-listed classes, suppress overlaps and cap the count.
pub fn vehicle_candidates(
    raw: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<DetectionCandidate> {
    let candidates = raw
        .into_iter()
        .filter_map(|d| {
            VehicleClass::from_coco_id(d.class_id)
                .map(|class| DetectionCandidate::vehicle(d.bbox, d.confidence, class))
        })
        .collect();

    let mut kept = nms(candidates, iou_threshold);
    kept.truncate(max_detections);
    kept
}

/// Single-class YOLOv8 plate detector.
pub struct YoloPlateLocalizer {
    model: Arc<OnnxModel>,
    settings: DecodeSettings,
}

impl YoloPlateLocalizer {
    pub fn new(model: Arc<OnnxModel>, config: &LocalizerConfig) -> Self {
        Self {
            model,
            settings: DecodeSettings {
                input_size: config.input_size,
                confidence: config.plate_confidence,
                iou_threshold: config.iou_threshold,
                max_detections: config.max_plates,
            },
        }
    }
}

impl PlateLocalizer for YoloPlateLocalizer {
    fn name(&self) -> &str {
        "yolov8_plate"
    }

    fn detect_plates(&self, region: &RgbImage) -> Result<Vec<DetectionCandidate>> {
        let raw = self.settings.run(&self.model, region)?;
        let candidates = raw
            .into_iter()
            .map(|d| DetectionCandidate::plate(d.bbox, d.confidence))
            .collect();

        let mut kept = nms(candidates, self.settings.iou_threshold);
        kept.truncate(self.settings.max_detections);
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a `[1, 4 + classes, n]` output from `(cx, cy, w, h, scores)` rows.
    fn output_from(rows: &[(f32, f32, f32, f32, Vec<f32>)]) -> ArrayD<f32> {
        let classes = rows[0].4.len();
        let mut output = Array::zeros(IxDyn(&[1, 4 + classes, rows.len()]));
        for (i, (cx, cy, w, h, scores)) in rows.iter().enumerate() {
            output[[0, 0, i]] = *cx;
            output[[0, 1, i]] = *cy;
            output[[0, 2, i]] = *w;
            output[[0, 3, i]] = *h;
            for (c, score) in scores.iter().enumerate() {
                output[[0, 4 + c, i]] = *score;
            }
        }
        output
    }

    fn coco_scores(class_id: usize, score: f32) -> Vec<f32> {
        let mut scores = vec![0.0; 80];
        scores[class_id] = score;
        scores
    }

    #[test]
    fn test_image_to_nchw_layout() {
        let image = RgbImage::from_pixel(8, 4, image::Rgb([255, 0, 51]));
        let input = image_to_nchw(&image, 16);
        assert_eq!(input.shape(), &[1, 3, 16, 16]);
        assert!((input[[0, 0, 5, 5]] - 1.0).abs() < 0.01);
        assert!(input[[0, 1, 5, 5]].abs() < 0.01);
        assert!((input[[0, 2, 5, 5]] - 0.2).abs() < 0.01);
    }

    #[test]
    fn test_decode_scales_to_original() {
        // 640 input, 1280x960 original: x scales by 2, y by 1.5
        let output = output_from(&[(320.0, 320.0, 100.0, 40.0, coco_scores(2, 0.9))]);
        let decoded = decode_output(&output, 1280, 960, 640, 0.4).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].class_id, 2);
        assert_eq!(decoded[0].bbox, BoundingBox::new(540, 450, 740, 510).unwrap());
    }

    #[test]
    fn test_decode_threshold_and_clamp() {
        let output = output_from(&[
            (10.0, 10.0, 40.0, 40.0, coco_scores(2, 0.95)),
            (300.0, 300.0, 50.0, 50.0, coco_scores(7, 0.39)),
        ]);
        let decoded = decode_output(&output, 640, 640, 640, 0.4).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].bbox, BoundingBox::new(0, 0, 30, 30).unwrap());
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let output = Array::zeros(IxDyn(&[1, 4, 10]));
        assert!(decode_output(&output, 640, 640, 640, 0.5).is_err());
    }

    #[test]
    fn test_vehicle_allow_list() {
        let output = output_from(&[
            (100.0, 100.0, 80.0, 60.0, coco_scores(0, 0.9)), // person
            (300.0, 300.0, 80.0, 60.0, coco_scores(7, 0.8)), // truck
            (500.0, 500.0, 80.0, 60.0, coco_scores(1, 0.9)), // bicycle
            (500.0, 100.0, 80.0, 60.0, coco_scores(3, 0.7)), // motorcycle
        ]);
        let decoded = decode_output(&output, 640, 640, 640, 0.4).unwrap();
        let vehicles = vehicle_candidates(decoded, 0.45, 50);

        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[0].class, Some(VehicleClass::Truck));
        assert_eq!(vehicles[1].class, Some(VehicleClass::Motorcycle));
    }

    #[test]
    fn test_vehicle_cap() {
        let rows: Vec<_> = (0..6)
            .map(|i| {
                (
                    50.0 + 100.0 * i as f32,
                    50.0,
                    40.0,
                    40.0,
                    coco_scores(2, 0.5 + i as f32 * 0.05),
                )
            })
            .collect();
        let decoded = decode_output(&output_from(&rows), 640, 640, 640, 0.4).unwrap();
        let vehicles = vehicle_candidates(decoded, 0.45, 3);

        assert_eq!(vehicles.len(), 3);
        assert!(vehicles[0].confidence >= vehicles[1].confidence);
        assert!(vehicles[1].confidence >= vehicles[2].confidence);
    }
}
