use crate::error::{PipelineError, Result};
use crate::normalizer::NormalizerConfig;
use crate::preprocess::PreprocessConfig;
use common::validation::{validate_non_zero, validate_unit_interval};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Environment variable naming a JSON configuration file
pub const CONFIG_PATH_ENV: &str = "LPR_CONFIG";

/// How plates are localized inside a vehicle region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateBackend {
    /// Single-class YOLOv8 plate model
    #[default]
    Onnx,
    /// Edge and contour geometry, no model required
    Contour,
}

impl FromStr for PlateBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "contour" => Ok(Self::Contour),
            other => Err(PipelineError::Config(format!(
                "unknown plate backend '{}' (expected onnx or contour)",
                other
            ))),
        }
    }
}

/// Which recognizer turns a preprocessed plate into tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerBackend {
    /// CRNN-style ONNX model with CTC output
    #[default]
    Ctc,
    /// Detection only; every plate reads as empty text
    Disabled,
}

impl FromStr for RecognizerBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ctc" => Ok(Self::Ctc),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(PipelineError::Config(format!(
                "unknown recognizer backend '{}' (expected ctc or disabled)",
                other
            ))),
        }
    }
}

/// Parameters of the contour plate finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContourConfig {
    #[serde(default = "default_contour_resize_width")]
    pub resize_width: u32,

    #[serde(default = "default_canny_low")]
    pub canny_low: f32,

    #[serde(default = "default_canny_high")]
    pub canny_high: f32,

    /// Only the largest contours by area are examined
    #[serde(default = "default_max_contours")]
    pub max_contours: usize,

    /// Minimum contour area as a fraction of the region area
    #[serde(default = "default_min_area_ratio")]
    pub min_area_ratio: f32,

    /// Polygon approximation tolerance as a fraction of the contour perimeter
    #[serde(default = "default_approx_epsilon")]
    pub approx_epsilon: f64,

    #[serde(default = "default_min_aspect")]
    pub min_aspect: f32,

    #[serde(default = "default_max_aspect")]
    pub max_aspect: f32,

    /// Contour area over convex hull area
    #[serde(default = "default_min_solidity")]
    pub min_solidity: f32,

    /// Contour area over bounding box area
    #[serde(default = "default_min_extent")]
    pub min_extent: f32,
}

fn default_contour_resize_width() -> u32 {
    600
}

fn default_canny_low() -> f32 {
    30.0
}

fn default_canny_high() -> f32 {
    200.0
}

fn default_max_contours() -> usize {
    10
}

fn default_min_area_ratio() -> f32 {
    0.01
}

fn default_approx_epsilon() -> f64 {
    0.02
}

fn default_min_aspect() -> f32 {
    1.5
}

fn default_max_aspect() -> f32 {
    5.0
}

fn default_min_solidity() -> f32 {
    0.7
}

fn default_min_extent() -> f32 {
    0.6
}

impl Default for ContourConfig {
    fn default() -> Self {
        Self {
            resize_width: default_contour_resize_width(),
            canny_low: default_canny_low(),
            canny_high: default_canny_high(),
            max_contours: default_max_contours(),
            min_area_ratio: default_min_area_ratio(),
            approx_epsilon: default_approx_epsilon(),
            min_aspect: default_min_aspect(),
            max_aspect: default_max_aspect(),
            min_solidity: default_min_solidity(),
            min_extent: default_min_extent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizerConfig {
    /// Path to the COCO vehicle detection ONNX model
    #[serde(default = "default_vehicle_model_path")]
    pub vehicle_model_path: String,

    #[serde(default)]
    pub plate_backend: PlateBackend,

    /// Path to the plate detection ONNX model (used by the `onnx` backend)
    #[serde(default = "default_plate_model_path")]
    pub plate_model_path: Option<String>,

    #[serde(default = "default_vehicle_confidence")]
    pub vehicle_confidence: f32,

    #[serde(default = "default_plate_confidence")]
    pub plate_confidence: f32,

    /// IoU threshold for Non-Maximum Suppression
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    #[serde(default = "default_max_vehicles")]
    pub max_vehicles: usize,

    /// Maximum plates kept per vehicle
    #[serde(default = "default_max_plates")]
    pub max_plates: usize,

    /// Model input size (width and height)
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Pixels added on every side of a vehicle box before plate search
    #[serde(default = "default_vehicle_margin")]
    pub vehicle_margin: u32,

    #[serde(default)]
    pub contour: ContourConfig,
}

fn default_vehicle_model_path() -> String {
    "models/yolov8n.onnx".to_string()
}

fn default_plate_model_path() -> Option<String> {
    Some("models/lpr_detector.onnx".to_string())
}

fn default_vehicle_confidence() -> f32 {
    0.4
}

fn default_plate_confidence() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_max_vehicles() -> usize {
    50
}

fn default_max_plates() -> usize {
    5
}

fn default_input_size() -> u32 {
    640
}

fn default_vehicle_margin() -> u32 {
    20
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            vehicle_model_path: default_vehicle_model_path(),
            plate_backend: PlateBackend::default(),
            plate_model_path: default_plate_model_path(),
            vehicle_confidence: default_vehicle_confidence(),
            plate_confidence: default_plate_confidence(),
            iou_threshold: default_iou_threshold(),
            max_vehicles: default_max_vehicles(),
            max_plates: default_max_plates(),
            input_size: default_input_size(),
            vehicle_margin: default_vehicle_margin(),
            contour: ContourConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    #[serde(default)]
    pub backend: RecognizerBackend,

    /// Path to the OCR ONNX model (used by the `ctc` backend)
    #[serde(default = "default_ocr_model_path")]
    pub model_path: Option<String>,

    /// Tokens below this confidence are dropped
    #[serde(default = "default_token_confidence")]
    pub confidence_threshold: f32,

    #[serde(default = "default_ocr_input_width")]
    pub input_width: u32,

    #[serde(default = "default_ocr_input_height")]
    pub input_height: u32,

    /// Characters of the model output, in order; CTC blank is index 0 and not listed
    #[serde(default = "default_char_vocab")]
    pub char_vocab: String,

    /// Keep `-` and space in the raw text
    #[serde(default = "default_allow_separators")]
    pub allow_separators: bool,
}

fn default_ocr_model_path() -> Option<String> {
    Some("models/lpr_ocr.onnx".to_string())
}

fn default_token_confidence() -> f32 {
    0.3
}

fn default_ocr_input_width() -> u32 {
    200
}

fn default_ocr_input_height() -> u32 {
    64
}

fn default_char_vocab() -> String {
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-".to_string()
}

fn default_allow_separators() -> bool {
    true
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            backend: RecognizerBackend::default(),
            model_path: default_ocr_model_path(),
            confidence_threshold: default_token_confidence(),
            input_width: default_ocr_input_width(),
            input_height: default_ocr_input_height(),
            char_vocab: default_char_vocab(),
            allow_separators: default_allow_separators(),
        }
    }
}

/// ONNX Runtime session settings shared by every model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Execution provider preference (CPU, CUDA, TensorRT)
    #[serde(default = "default_execution_provider")]
    pub execution_provider: String,

    /// GPU device ID (0, 1, 2, etc.)
    #[serde(default)]
    pub device_id: i32,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default = "default_inter_threads")]
    pub inter_threads: usize,
}

fn default_execution_provider() -> String {
    "CUDA".to_string()
}

fn default_intra_threads() -> usize {
    4
}

fn default_inter_threads() -> usize {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_provider: default_execution_provider(),
            device_id: 0,
            intra_threads: default_intra_threads(),
            inter_threads: default_inter_threads(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub localizer: LocalizerConfig,

    #[serde(default)]
    pub preprocess: PreprocessConfig,

    #[serde(default)]
    pub recognizer: RecognizerConfig,

    #[serde(default)]
    pub normalizer: NormalizerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Process vehicles on the rayon pool
    #[serde(default)]
    pub parallel: bool,

    /// Fewer vehicles than this are processed sequentially even when `parallel` is set
    #[serde(default = "default_parallel_min_vehicles")]
    pub parallel_min_vehicles: usize,

    /// Draw boxes onto the returned image
    #[serde(default = "default_annotate")]
    pub annotate: bool,
}

fn default_parallel_min_vehicles() -> usize {
    2
}

fn default_annotate() -> bool {
    true
}

impl PipelineConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| PipelineError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Defaults or `$LPR_CONFIG`, overlaid with the `LPR_*` variables, then validated.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from `lookup`. Unparseable values are configuration errors.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LPR_VEHICLE_MODEL") {
            self.localizer.vehicle_model_path = path;
        }
        if let Some(path) = lookup("LPR_PLATE_MODEL") {
            self.localizer.plate_model_path = Some(path);
        }
        if let Some(path) = lookup("LPR_OCR_MODEL") {
            self.recognizer.model_path = Some(path);
        }
        if let Some(backend) = lookup("LPR_PLATE_BACKEND") {
            self.localizer.plate_backend = backend.parse()?;
        }
        if let Some(backend) = lookup("LPR_OCR_BACKEND") {
            self.recognizer.backend = backend.parse()?;
        }
        if let Some(provider) = lookup("LPR_EXECUTION_PROVIDER") {
            self.runtime.execution_provider = provider;
        }
        if let Some(device_id) = lookup("LPR_DEVICE_ID") {
            self.runtime.device_id = device_id.trim().parse().map_err(|_| {
                PipelineError::Config(format!("LPR_DEVICE_ID is not an integer: '{}'", device_id))
            })?;
        }
        if let Some(confidence) = lookup("LPR_OCR_CONFIDENCE") {
            self.recognizer.confidence_threshold = confidence.trim().parse().map_err(|_| {
                PipelineError::Config(format!(
                    "LPR_OCR_CONFIDENCE is not a number: '{}'",
                    confidence
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let localizer = &self.localizer;
        validate_unit_interval(localizer.vehicle_confidence, "localizer.vehicle_confidence")
            .map_err(PipelineError::config)?;
        validate_unit_interval(localizer.plate_confidence, "localizer.plate_confidence")
            .map_err(PipelineError::config)?;
        validate_unit_interval(localizer.iou_threshold, "localizer.iou_threshold")
            .map_err(PipelineError::config)?;
        validate_non_zero(localizer.input_size, "localizer.input_size")
            .map_err(PipelineError::config)?;
        if localizer.max_vehicles == 0 || localizer.max_plates == 0 {
            return Err(PipelineError::Config(
                "localizer.max_vehicles and localizer.max_plates must be greater than 0"
                    .to_string(),
            ));
        }
        if localizer.plate_backend == PlateBackend::Onnx && localizer.plate_model_path.is_none() {
            return Err(PipelineError::Config(
                "localizer.plate_model_path is required by the onnx plate backend".to_string(),
            ));
        }

        let contour = &localizer.contour;
        validate_non_zero(contour.resize_width, "localizer.contour.resize_width")
            .map_err(PipelineError::config)?;
        if contour.canny_low > contour.canny_high {
            return Err(PipelineError::Config(format!(
                "localizer.contour.canny_low ({}) exceeds canny_high ({})",
                contour.canny_low, contour.canny_high
            )));
        }
        if contour.min_aspect > contour.max_aspect {
            return Err(PipelineError::Config(format!(
                "localizer.contour.min_aspect ({}) exceeds max_aspect ({})",
                contour.min_aspect, contour.max_aspect
            )));
        }
        if contour.approx_epsilon.is_nan() || contour.approx_epsilon <= 0.0 {
            return Err(PipelineError::Config(format!(
                "localizer.contour.approx_epsilon must be positive, got {}",
                contour.approx_epsilon
            )));
        }

        self.preprocess.validate()?;

        let recognizer = &self.recognizer;
        validate_unit_interval(
            recognizer.confidence_threshold,
            "recognizer.confidence_threshold",
        )
        .map_err(PipelineError::config)?;
        validate_non_zero(recognizer.input_width, "recognizer.input_width")
            .map_err(PipelineError::config)?;
        validate_non_zero(recognizer.input_height, "recognizer.input_height")
            .map_err(PipelineError::config)?;
        if recognizer.char_vocab.is_empty() {
            return Err(PipelineError::Config(
                "recognizer.char_vocab must not be empty".to_string(),
            ));
        }
        if recognizer.backend == RecognizerBackend::Ctc && recognizer.model_path.is_none() {
            return Err(PipelineError::Config(
                "recognizer.model_path is required by the ctc backend".to_string(),
            ));
        }

        self.normalizer.validate()?;

        if self.runtime.intra_threads == 0 || self.runtime.inter_threads == 0 {
            return Err(PipelineError::Config(
                "runtime thread counts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
