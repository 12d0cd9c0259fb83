//! Detection contracts shared by the plate recognition pipeline and its callers.
//!
//! Boxes are expressed as `(x1, y1, x2, y2)` pixel corners in the coordinate space of
//! the image they were produced against. Results handed back to callers always carry
//! absolute coordinates of the original image.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Integer pixel rectangle `(x1, y1)`-`(x2, y2)`, right/bottom edges exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Build a box, returning `None` unless `x2 > x1` and `y2 > y1`.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        let bbox = Self { x1, y1, x2, y2 };
        bbox.is_valid().then_some(bbox)
    }

    /// Build a box from a top-left corner and a size.
    pub fn from_xywh(x: i32, y: i32, width: u32, height: u32) -> Option<Self> {
        Self::new(
            x,
            y,
            x.saturating_add(width as i32),
            y.saturating_add(height as i32),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.x2 > self.x1 && self.y2 > self.y1
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) as f32 / 2.0
    }

    /// Grow the box by `margin` pixels on every side. The result is not clamped.
    pub fn expand(&self, margin: u32) -> Self {
        let m = margin as i32;
        Self {
            x1: self.x1.saturating_sub(m),
            y1: self.y1.saturating_sub(m),
            x2: self.x2.saturating_add(m),
            y2: self.y2.saturating_add(m),
        }
    }

    /// Shift the box by `(dx, dy)`.
    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    /// Intersect with `[0, width) x [0, height)`.
    ///
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        let w = width.min(i32::MAX as u32) as i32;
        let h = height.min(i32::MAX as u32) as i32;
        Self::new(
            self.x1.clamp(0, w),
            self.y1.clamp(0, h),
            self.x2.clamp(0, w),
            self.y2.clamp(0, h),
        )
    }

    /// Intersection over Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = if x2 > x1 && y2 > y1 {
            ((x2 - x1) as i64 * (y2 - y1) as i64) as f32
        } else {
            0.0
        };

        let union = self.area() as f32 + other.area() as f32 - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Vehicle classes kept by the vehicle localizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];

    /// Map a COCO class index onto the vehicle allow-list.
    pub fn from_coco_id(class_id: usize) -> Option<Self> {
        match class_id {
            2 => Some(Self::Car),
            3 => Some(Self::Motorcycle),
            5 => Some(Self::Bus),
            7 => Some(Self::Truck),
            _ => None,
        }
    }

    pub fn coco_id(&self) -> usize {
        match self {
            Self::Car => 2,
            Self::Motorcycle => 3,
            Self::Bus => 5,
            Self::Truck => 7,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Bus => "bus",
            Self::Truck => "truck",
        }
    }
}

/// A single localizer hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    pub bbox: BoundingBox,

    /// Detection confidence (0.0 to 1.0)
    pub confidence: f32,

    /// Vehicle class; `None` for plate candidates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<VehicleClass>,
}

impl DetectionCandidate {
    pub fn vehicle(bbox: BoundingBox, confidence: f32, class: VehicleClass) -> Self {
        Self {
            bbox,
            confidence,
            class: Some(class),
        }
    }

    pub fn plate(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            class: None,
        }
    }
}

/// One recognized symbol with its horizontal position in the recognized image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecognitionToken {
    pub character: char,
    pub confidence: f32,
    pub center_x: f32,
}

/// Which normalizer pass produced a plate string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationPass {
    /// Canonical substring found directly in the cleaned text
    Direct,
    /// Confusable characters substituted by slot
    Positional,
    /// Rebuilt from the digit and letter subsequences
    Segments,
    /// No canonical match; cleaned text returned as is
    BestEffort,
}

impl NormalizationPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Positional => "positional",
            Self::Segments => "segments",
            Self::BestEffort => "best_effort",
        }
    }

    pub fn is_canonical(&self) -> bool {
        !matches!(self, Self::BestEffort)
    }
}

/// Recognition outcome for one plate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateResult {
    /// Plate box in original-image coordinates
    pub bbox: BoundingBox,

    /// Normalized plate text (empty when nothing legible was read)
    pub text: String,

    /// Extractor output before normalization
    pub raw_text: String,

    /// Mean recognition confidence of the kept tokens
    pub confidence: f32,

    /// Localizer confidence of the plate box
    pub detection_confidence: f32,

    pub pass: NormalizationPass,

    /// Whether `text` has the canonical plate shape
    pub canonical: bool,

    /// Cropped plate pixels; callers decide whether to persist them
    #[serde(skip)]
    pub image: RgbImage,
}

/// Recognition outcome for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub vehicle_bbox: BoundingBox,
    pub vehicle_confidence: f32,
    pub vehicle_class: VehicleClass,
    pub plates: Vec<PlateResult>,
}

impl DetectionResult {
    pub fn has_plates(&self) -> bool {
        !self.plates.is_empty()
    }
}

/// How a manually selected region was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionMethod {
    /// A plate was localized inside the selection and recognized
    DetectedInRegion,
    /// No plate found; the whole selection was recognized
    WholeRegion,
}

/// Recognition outcome for a manually selected region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRecognition {
    /// Selection after clamping to the image
    pub selection: BoundingBox,

    /// Localized plate in original-image coordinates, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_bbox: Option<BoundingBox>,

    pub text: String,
    pub raw_text: String,
    pub confidence: f32,
    pub canonical: bool,
    pub method: RegionMethod,

    /// Pixels of the whole selection
    #[serde(skip)]
    pub image: RgbImage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_rejects_degenerate() {
        assert!(BoundingBox::new(10, 10, 10, 20).is_none());
        assert!(BoundingBox::new(10, 10, 20, 5).is_none());
        assert!(BoundingBox::new(0, 0, 1, 1).is_some());
    }

    #[test]
    fn test_bbox_clamp_inside_image() {
        let bbox = BoundingBox::new(-15, -5, 120, 90).unwrap();
        let clamped = bbox.clamp_to(100, 80).unwrap();
        assert_eq!(clamped, BoundingBox::new(0, 0, 100, 80).unwrap());

        let outside = BoundingBox::new(150, 10, 170, 20).unwrap();
        assert!(outside.clamp_to(100, 80).is_none());
    }

    #[test]
    fn test_bbox_expand_and_translate() {
        let bbox = BoundingBox::new(10, 20, 30, 40).unwrap();
        assert_eq!(bbox.expand(5), BoundingBox::new(5, 15, 35, 45).unwrap());
        assert_eq!(bbox.translate(100, 1), BoundingBox::new(110, 21, 130, 41).unwrap());
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::from_xywh(10, 10, 50, 50).unwrap();
        let b = BoundingBox::from_xywh(30, 30, 50, 50).unwrap();
        let c = BoundingBox::from_xywh(100, 100, 50, 50).unwrap();

        let iou = a.iou(&b);
        assert!(iou > 0.0 && iou < 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 0.001);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn test_vehicle_class_coco_mapping() {
        for class in VehicleClass::ALL {
            assert_eq!(VehicleClass::from_coco_id(class.coco_id()), Some(class));
        }
        // person, bicycle, airplane
        assert_eq!(VehicleClass::from_coco_id(0), None);
        assert_eq!(VehicleClass::from_coco_id(1), None);
        assert_eq!(VehicleClass::from_coco_id(4), None);
    }

    #[test]
    fn test_plate_result_serialization_skips_pixels() {
        let plate = PlateResult {
            bbox: BoundingBox::new(1, 2, 3, 4).unwrap(),
            text: "1234AB56".to_string(),
            raw_text: "1234 AB 56".to_string(),
            confidence: 0.9,
            detection_confidence: 0.8,
            pass: NormalizationPass::Direct,
            canonical: true,
            image: RgbImage::new(4, 4),
        };

        let json = serde_json::to_value(&plate).unwrap();
        assert_eq!(json["text"], "1234AB56");
        assert_eq!(json["pass"], "direct");
        assert!(json.get("image").is_none());
    }
}
