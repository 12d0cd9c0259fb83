pub mod detections;
pub mod validation;
