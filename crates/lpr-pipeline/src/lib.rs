//! Vehicle and license plate recognition over still images.
//!
//! The [`DetectionPipeline`] localizes vehicles, localizes plates inside each vehicle,
//! preprocesses and reads every plate, then normalizes the text into the canonical
//! `NNNNLLNN` plate identifier.

pub mod annotate;
pub mod config;
pub mod error;
pub mod extractor;
pub mod localizer;
pub mod models;
pub mod normalizer;
pub mod output;
pub mod pipeline;
pub mod preprocess;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use models::ModelSet;
pub use normalizer::PlateNormalizer;
pub use pipeline::{DetectionOutput, DetectionPipeline};
