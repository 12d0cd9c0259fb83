//! Character extraction from preprocessed plate images.

pub mod ctc;

use crate::error::{PipelineError, Result};
use common::detections::RecognitionToken;
use image::GrayImage;
use std::sync::Arc;

pub use ctc::CtcRecognizer;

/// Turns a preprocessed plate image into recognized symbols.
pub trait RecognitionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Tokens in any order; the extractor sorts them.
    fn recognize(&self, image: &GrayImage) -> anyhow::Result<Vec<RecognitionToken>>;
}

/// Backend for detection-only deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledRecognizer;

impl RecognitionBackend for DisabledRecognizer {
    fn name(&self) -> &str {
        "disabled"
    }

    fn recognize(&self, _image: &GrayImage) -> anyhow::Result<Vec<RecognitionToken>> {
        Ok(Vec::new())
    }
}

/// Whether `c` may appear in raw plate text.
pub fn is_allowed(c: char, allow_separators: bool) -> bool {
    c.is_ascii_digit() || c.is_ascii_uppercase() || (allow_separators && (c == '-' || c == ' '))
}

/// Filter, order and join tokens into `(raw_text, average_confidence)`.
///
/// Tokens outside the allow-list or below `confidence_threshold` are dropped first;
/// the rest are read left to right by horizontal center.
pub fn assemble(
    tokens: Vec<RecognitionToken>,
    confidence_threshold: f32,
    allow_separators: bool,
) -> (String, f32) {
    let mut kept: Vec<RecognitionToken> = tokens
        .into_iter()
        .filter(|t| is_allowed(t.character, allow_separators))
        .filter(|t| t.confidence >= confidence_threshold)
        .collect();

    if kept.is_empty() {
        return (String::new(), 0.0);
    }

    kept.sort_by(|a, b| {
        a.center_x
            .partial_cmp(&b.center_x)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let text: String = kept.iter().map(|t| t.character).collect();
    let confidence = kept.iter().map(|t| t.confidence).sum::<f32>() / kept.len() as f32;
    (text, confidence)
}

#[derive(Clone)]
pub struct Extractor {
    backend: Arc<dyn RecognitionBackend>,
    allow_separators: bool,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("backend", &self.backend.name())
            .field("allow_separators", &self.allow_separators)
            .finish()
    }
}

impl Extractor {
    pub fn new(backend: Arc<dyn RecognitionBackend>, allow_separators: bool) -> Self {
        Self {
            backend,
            allow_separators,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Read a preprocessed plate. A zero-size image reads as `("", 0.0)`.
    pub fn extract(&self, image: &GrayImage, confidence_threshold: f32) -> Result<(String, f32)> {
        if image.width() == 0 || image.height() == 0 {
            return Ok((String::new(), 0.0));
        }

        let tokens = self
            .backend
            .recognize(image)
            .map_err(PipelineError::inference)?;
        tracing::trace!(backend = self.backend.name(), tokens = tokens.len(), "recognized");

        Ok(assemble(tokens, confidence_threshold, self.allow_separators))
    }
}
