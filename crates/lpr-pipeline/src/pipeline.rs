//! End-to-end orchestration: vehicles, plates, preprocessing, reading, normalization.

use crate::annotate::annotate_best_effort;
use crate::config::{PipelineConfig, PlateBackend, RecognizerBackend};
use crate::error::{PipelineError, Result};
use crate::extractor::{CtcRecognizer, DisabledRecognizer, Extractor, RecognitionBackend};
use crate::localizer::{
    ContourPlateLocalizer, Localizer, PlateLocalizer, VehicleLocalizer, YoloPlateLocalizer,
    YoloVehicleLocalizer,
};
use crate::models::ModelSet;
use crate::normalizer::PlateNormalizer;
use crate::preprocess::Preprocessor;
use common::detections::{
    BoundingBox, DetectionCandidate, DetectionResult, NormalizationPass, PlateResult,
    RegionMethod, RegionRecognition, VehicleClass,
};
use common::validation::{clamp_selection, validate_image_dimensions, validate_image_path};
use image::{imageops, DynamicImage, RgbImage};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use telemetry::metrics::{
    LPR_IMAGES_PROCESSED, LPR_PLATES_RECOGNIZED, LPR_REGIONS_SKIPPED, LPR_STAGE_LATENCY,
    LPR_VEHICLES_DETECTED,
};

/// Annotated image plus one result per vehicle, in detection order.
pub type DetectionOutput = (RgbImage, Vec<DetectionResult>);

#[derive(Debug)]
pub struct DetectionPipeline {
    config: PipelineConfig,
    localizer: Localizer,
    preprocessor: Preprocessor,
    extractor: Extractor,
    normalizer: PlateNormalizer,
}

impl DetectionPipeline {
    /// Build the configured backends on top of already loaded models.
    pub fn new(config: PipelineConfig, models: &ModelSet) -> Result<Self> {
        let vehicles: Arc<dyn VehicleLocalizer> = Arc::new(YoloVehicleLocalizer::new(
            models.vehicle.clone(),
            &config.localizer,
        ));

        let plates: Arc<dyn PlateLocalizer> = match config.localizer.plate_backend {
            PlateBackend::Onnx => {
                let model = models.plate.clone().ok_or_else(|| {
                    PipelineError::Config("onnx plate backend needs a loaded plate model".into())
                })?;
                Arc::new(YoloPlateLocalizer::new(model, &config.localizer))
            }
            PlateBackend::Contour => Arc::new(ContourPlateLocalizer::new(
                config.localizer.contour.clone(),
                config.preprocess.clone(),
                config.localizer.iou_threshold,
                config.localizer.max_plates,
            )),
        };

        let recognizer: Arc<dyn RecognitionBackend> = match config.recognizer.backend {
            RecognizerBackend::Ctc => {
                let model = models.ocr.clone().ok_or_else(|| {
                    PipelineError::Config("ctc recognizer needs a loaded OCR model".into())
                })?;
                Arc::new(CtcRecognizer::new(model, &config.recognizer))
            }
            RecognizerBackend::Disabled => Arc::new(DisabledRecognizer),
        };

        Self::with_backends(config, vehicles, plates, recognizer)
    }

    /// Build a pipeline around caller-supplied backends.
    pub fn with_backends(
        config: PipelineConfig,
        vehicles: Arc<dyn VehicleLocalizer>,
        plates: Arc<dyn PlateLocalizer>,
        recognizer: Arc<dyn RecognitionBackend>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            vehicles = vehicles.name(),
            plates = plates.name(),
            recognizer = recognizer.name(),
            parallel = config.parallel,
            "detection pipeline ready"
        );

        Ok(Self {
            localizer: Localizer::new(vehicles, plates),
            preprocessor: Preprocessor::new(config.preprocess.clone())?,
            extractor: Extractor::new(recognizer, config.recognizer.allow_separators),
            normalizer: PlateNormalizer::new(config.normalizer.clone())?,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &PlateNormalizer {
        &self.normalizer
    }

    pub fn process_path(&self, path: impl AsRef<Path>) -> Result<DetectionOutput> {
        observe_entry("path", || {
            let path = validate_image_path(path.as_ref())
                .map_err(|e| PipelineError::InvalidImage(format!("{:#}", e)))?;
            let image = image::open(&path).map_err(|e| {
                PipelineError::InvalidImage(format!("cannot decode {}: {}", path.display(), e))
            })?;
            self.run(&image.to_rgb8())
        })
    }

    pub fn process_bytes(&self, bytes: &[u8]) -> Result<DetectionOutput> {
        observe_entry("bytes", || {
            let image = image::load_from_memory(bytes)
                .map_err(|e| PipelineError::InvalidImage(format!("cannot decode image: {}", e)))?;
            self.run(&image.to_rgb8())
        })
    }

    pub fn process_image(&self, image: &DynamicImage) -> Result<DetectionOutput> {
        observe_entry("image", || self.run(&image.to_rgb8()))
    }

    /// Run the full pass on a decoded RGB image.
    pub fn process_detection(&self, image: &RgbImage) -> Result<DetectionOutput> {
        observe_entry("rgb", || self.run(image))
    }

    fn run(&self, image: &RgbImage) -> Result<DetectionOutput> {
        let start = Instant::now();
        validate_image_dimensions(image.width(), image.height())
            .map_err(|e| PipelineError::InvalidImage(format!("{:#}", e)))?;

        let stage = Instant::now();
        let vehicles: Vec<(DetectionCandidate, VehicleClass)> = self
            .localizer
            .detect_vehicles(image)?
            .into_iter()
            .filter_map(|c| c.class.map(|class| (c, class)))
            .collect();
        observe_stage("localize_vehicles", stage);

        for (_, class) in &vehicles {
            LPR_VEHICLES_DETECTED.with_label_values(&[class.label()]).inc();
        }

        let use_parallel = self.config.parallel
            && vehicles.len() >= self.config.parallel_min_vehicles.max(1);
        let results: Vec<DetectionResult> = if use_parallel {
            tracing::debug!("Using parallel processing for {} vehicles", vehicles.len());
            vehicles
                .par_iter()
                .enumerate()
                .map(|(index, (candidate, class))| {
                    self.process_vehicle(image, index, candidate, *class)
                })
                .collect()
        } else {
            vehicles
                .iter()
                .enumerate()
                .map(|(index, (candidate, class))| {
                    self.process_vehicle(image, index, candidate, *class)
                })
                .collect()
        };

        let annotated = if self.config.annotate {
            annotate_best_effort(image, &results)
        } else {
            image.clone()
        };

        observe_stage("total", start);
        tracing::info!(
            vehicles = results.len(),
            plates = results.iter().map(|r| r.plates.len()).sum::<usize>(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "detection finished"
        );

        Ok((annotated, results))
    }

    fn process_vehicle(
        &self,
        image: &RgbImage,
        index: usize,
        vehicle: &DetectionCandidate,
        class: VehicleClass,
    ) -> DetectionResult {
        let mut result = DetectionResult {
            vehicle_bbox: vehicle.bbox,
            vehicle_confidence: vehicle.confidence,
            vehicle_class: class,
            plates: Vec::new(),
        };

        let Some(region_box) = vehicle
            .bbox
            .expand(self.config.localizer.vehicle_margin)
            .clamp_to(image.width(), image.height())
        else {
            skip_region(
                "vehicle",
                &PipelineError::EmptyRegion(format!("vehicle {} crops to nothing", index)),
            );
            return result;
        };
        let region = crop(image, &region_box);

        let stage = Instant::now();
        let plates = match self.localizer.detect_plates(&region) {
            Ok(plates) => plates,
            Err(e) => {
                skip_region("vehicle", &e);
                return result;
            }
        };
        observe_stage("localize_plates", stage);
        tracing::debug!(vehicle = index, plates = plates.len(), "plates localized");

        for (plate_index, plate) in plates.iter().enumerate() {
            match self.read_plate(image, &region_box, plate) {
                Ok(plate_result) => {
                    LPR_PLATES_RECOGNIZED
                        .with_label_values(&[plate_result.pass.as_str()])
                        .inc();
                    result.plates.push(plate_result);
                }
                Err(e) => {
                    tracing::debug!(vehicle = index, plate = plate_index, "plate skipped");
                    skip_region("plate", &e);
                }
            }
        }

        result
    }

    /// Crop, preprocess, read and normalize one plate found inside `region_box`.
    fn read_plate(
        &self,
        image: &RgbImage,
        region_box: &BoundingBox,
        plate: &DetectionCandidate,
    ) -> Result<PlateResult> {
        let absolute = plate
            .bbox
            .translate(region_box.x1, region_box.y1)
            .clamp_to(image.width(), image.height())
            .ok_or_else(|| PipelineError::EmptyRegion("plate crops to nothing".to_string()))?;
        let plate_image = crop(image, &absolute);

        let (raw_text, confidence) = self.read_text(&plate_image)?;
        let normalization = self.normalizer.normalize_detailed(&raw_text);
        let confidence = if normalization.text.is_empty() {
            0.0
        } else {
            confidence
        };

        Ok(PlateResult {
            bbox: absolute,
            canonical: normalization.is_canonical(),
            pass: normalization.pass,
            text: normalization.text,
            raw_text,
            confidence,
            detection_confidence: plate.confidence,
            image: plate_image,
        })
    }

    /// Preprocess and run the extractor. An empty crop reads as `("", 0.0)`.
    fn read_text(&self, plate_image: &RgbImage) -> Result<(String, f32)> {
        let stage = Instant::now();
        let Some(binary) = self.preprocessor.preprocess(plate_image) else {
            return Ok((String::new(), 0.0));
        };
        observe_stage("preprocess", stage);

        let stage = Instant::now();
        let read = self
            .extractor
            .extract(&binary, self.config.recognizer.confidence_threshold);
        observe_stage("extract", stage);
        read
    }

    /// Recognize a manually selected rectangle.
    ///
    /// The selection is clamped to the image. A plate localized inside it is read in
    /// preference to the whole selection.
    pub fn process_region(
        &self,
        image: &RgbImage,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
    ) -> Result<RegionRecognition> {
        validate_image_dimensions(image.width(), image.height())
            .map_err(|e| PipelineError::InvalidImage(format!("{:#}", e)))?;
        let selection = clamp_selection(x1, y1, x2, y2, image.width(), image.height())
            .map_err(|e| PipelineError::InvalidSelection(format!("{:#}", e)))?;
        let region = crop(image, &selection);

        let detected = match self.localizer.detect_plates(&region) {
            Ok(plates) => plates.into_iter().max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            Err(e) => {
                skip_region("selection", &e);
                None
            }
        };

        if let Some(plate) = detected {
            match self.read_plate(image, &selection, &plate) {
                Ok(read) => {
                    return Ok(RegionRecognition {
                        selection,
                        plate_bbox: Some(read.bbox),
                        text: read.text,
                        raw_text: read.raw_text,
                        confidence: read.confidence,
                        canonical: read.canonical,
                        method: RegionMethod::DetectedInRegion,
                        image: region,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "plate in selection unreadable, reading whole selection");
                    skip_region("plate", &e);
                }
            }
        }

        let (raw_text, confidence) = self.read_text(&region)?;
        let normalization = self.normalizer.normalize_detailed(&raw_text);
        let canonical = normalization.is_canonical();
        let confidence = if normalization.text.is_empty() {
            0.0
        } else {
            confidence
        };
        if normalization.pass == NormalizationPass::BestEffort {
            tracing::debug!(raw = %raw_text, "selection text is not a canonical plate");
        }

        Ok(RegionRecognition {
            selection,
            plate_bbox: None,
            text: normalization.text,
            raw_text,
            confidence,
            canonical,
            method: RegionMethod::WholeRegion,
            image: region,
        })
    }
}

fn crop(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    imageops::crop_imm(image, bbox.x1 as u32, bbox.y1 as u32, bbox.width(), bbox.height())
        .to_image()
}

fn observe_entry<T>(entry: &str, run: impl FnOnce() -> Result<T>) -> Result<T> {
    let result = run();
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    LPR_IMAGES_PROCESSED.with_label_values(&[entry, status]).inc();
    if let Err(e) = &result {
        tracing::warn!(entry, error = %e, "detection failed");
    }
    result
}

fn observe_stage(stage: &str, started: Instant) {
    LPR_STAGE_LATENCY
        .with_label_values(&[stage])
        .observe(started.elapsed().as_secs_f64());
}

fn skip_region(stage: &str, error: &PipelineError) {
    tracing::warn!(stage, reason = error.kind(), error = %error, "region skipped");
    LPR_REGIONS_SKIPPED
        .with_label_values(&[stage, error.kind()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::detections::RecognitionToken;
    use image::{GrayImage, Rgb};

    struct OneVehicle(BoundingBox);

    impl VehicleLocalizer for OneVehicle {
        fn name(&self) -> &str {
            "one_vehicle"
        }

        fn detect_vehicles(&self, _image: &RgbImage) -> anyhow::Result<Vec<DetectionCandidate>> {
            Ok(vec![DetectionCandidate::vehicle(self.0, 0.9, VehicleClass::Car)])
        }
    }

    struct FixedPlate(BoundingBox);

    impl PlateLocalizer for FixedPlate {
        fn name(&self) -> &str {
            "fixed_plate"
        }

        fn detect_plates(&self, _region: &RgbImage) -> anyhow::Result<Vec<DetectionCandidate>> {
            Ok(vec![DetectionCandidate::plate(self.0, 0.8)])
        }
    }

    struct Reads(&'static str);

    impl RecognitionBackend for Reads {
        fn name(&self) -> &str {
            "reads"
        }

        fn recognize(&self, _image: &GrayImage) -> anyhow::Result<Vec<RecognitionToken>> {
            Ok(self
                .0
                .chars()
                .enumerate()
                .map(|(i, character)| RecognitionToken {
                    character,
                    confidence: 0.9,
                    center_x: i as f32,
                })
                .collect())
        }
    }

    fn bbox(x1: i32, y1: i32, x2: i32, y2: i32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2).unwrap()
    }

    fn pipeline(vehicle: BoundingBox, plate: BoundingBox, text: &'static str) -> DetectionPipeline {
        let mut config = PipelineConfig::default();
        config.localizer.plate_backend = PlateBackend::Contour;
        config.recognizer.backend = RecognizerBackend::Disabled;
        DetectionPipeline::with_backends(
            config,
            Arc::new(OneVehicle(vehicle)),
            Arc::new(FixedPlate(plate)),
            Arc::new(Reads(text)),
        )
        .unwrap()
    }

    #[test]
    fn test_plate_box_translated_by_clamped_region() {
        // Vehicle near the top-left corner: margin clamps the region origin to (0, 0)
        let image = RgbImage::from_pixel(200, 100, Rgb([200, 200, 200]));
        let pipeline = pipeline(bbox(10, 5, 110, 80), bbox(30, 40, 70, 52), "1234AB56");

        let (_, results) = pipeline.process_detection(&image).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].plates[0].bbox, bbox(30, 40, 70, 52));

        // Vehicle away from the edges: region origin is vehicle origin minus margin
        let pipeline = pipeline_at(bbox(60, 40, 160, 90));
        let (_, results) = pipeline.process_detection(&image).unwrap();
        assert_eq!(results[0].plates[0].bbox, bbox(70, 40, 110, 52));
    }

    fn pipeline_at(vehicle: BoundingBox) -> DetectionPipeline {
        pipeline(vehicle, bbox(30, 20, 70, 32), "1234AB56")
    }

    #[test]
    fn test_text_normalized_and_flagged() {
        let image = RgbImage::from_pixel(200, 100, Rgb([200, 200, 200]));
        let pipeline = pipeline(bbox(10, 5, 110, 80), bbox(30, 40, 70, 52), "CGO12O4AB56");

        let (_, results) = pipeline.process_detection(&image).unwrap();
        let plate = &results[0].plates[0];
        assert_eq!(plate.raw_text, "CGO12O4AB56");
        assert_eq!(plate.text, "1204AB56");
        assert_eq!(plate.pass, NormalizationPass::Positional);
        assert!(plate.canonical);
        assert_eq!(plate.detection_confidence, 0.8);
    }

    #[test]
    fn test_region_inverted_selection_rejected() {
        let image = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        let pipeline = pipeline(bbox(0, 0, 10, 10), bbox(0, 0, 5, 5), "");
        let err = pipeline.process_region(&image, 30, 10, 20, 40).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSelection(_)));
    }
}
