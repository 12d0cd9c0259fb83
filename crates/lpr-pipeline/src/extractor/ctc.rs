//! CRNN-style recognizer with greedy CTC decoding.

use super::RecognitionBackend;
use crate::config::RecognizerConfig;
use crate::models::OnnxModel;
use anyhow::{ensure, Result};
use common::detections::RecognitionToken;
use image::{imageops::FilterType, GrayImage};
use ndarray::{Array, ArrayD, IxDyn};
use std::sync::Arc;

// Different OCR exports name their output differently
const OUTPUT_NAMES: &[&str] = &["output", "output0", "logits"];

pub struct CtcRecognizer {
    model: Arc<OnnxModel>,
    vocab: Vec<char>,
    input_width: u32,
    input_height: u32,
}

impl CtcRecognizer {
    pub fn new(model: Arc<OnnxModel>, config: &RecognizerConfig) -> Self {
        Self {
            model,
            vocab: config.char_vocab.chars().collect(),
            input_width: config.input_width,
            input_height: config.input_height,
        }
    }

    /// Resize to the model input and convert to NCHW normalized to [0, 1].
    fn to_input(&self, image: &GrayImage) -> ArrayD<f32> {
        let width = self.input_width;
        let height = self.input_height;
        let resized = image::imageops::resize(image, width, height, FilterType::Triangle);

        let mut input = Array::zeros(IxDyn(&[1, 1, height as usize, width as usize]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        }
        input
    }
}

impl RecognitionBackend for CtcRecognizer {
    fn name(&self) -> &str {
        "ctc"
    }

    fn recognize(&self, image: &GrayImage) -> Result<Vec<RecognitionToken>> {
        let output = self.model.run(self.to_input(image), OUTPUT_NAMES)?;
        ctc_decode(&output, &self.vocab, image.width())
    }
}

/// Softmax unless the row already looks like a probability distribution.
fn probabilities(row: &[f32]) -> Vec<f32> {
    let sum: f32 = row.iter().sum();
    if row.iter().all(|&p| (0.0..=1.0).contains(&p)) && (sum - 1.0).abs() < 0.01 {
        return row.to_vec();
    }

    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Greedy CTC decoding of a `[1, timesteps, vocab + 1]` output, blank at index 0.
///
/// Each run of a repeated non-blank class becomes one token. Its confidence is the
/// highest probability within the run and its center is the run's middle timestep
/// mapped onto `image_width` pixels.
pub fn ctc_decode(
    output: &ArrayD<f32>,
    vocab: &[char],
    image_width: u32,
) -> Result<Vec<RecognitionToken>> {
    let shape = output.shape();
    ensure!(
        shape.len() == 3 && shape[0] >= 1 && shape[2] >= 2,
        "unexpected CTC output shape {:?}",
        shape
    );

    let sequence_length = shape[1];
    let classes = shape[2];
    let step = image_width as f32 / sequence_length.max(1) as f32;

    let mut tokens = Vec::new();
    // (class, first timestep, last timestep, best probability)
    let mut run: Option<(usize, usize, usize, f32)> = None;

    let mut flush = |run: Option<(usize, usize, usize, f32)>| {
        if let Some((class, start, end, confidence)) = run {
            // vocab is 1-indexed, with blank at 0
            if let Some(&character) = vocab.get(class - 1) {
                let middle = (start + end) as f32 / 2.0 + 0.5;
                tokens.push(RecognitionToken {
                    character,
                    confidence,
                    center_x: middle * step,
                });
            }
        }
    };

    for t in 0..sequence_length {
        let row: Vec<f32> = (0..classes).map(|c| output[[0, t, c]]).collect();
        let probs = probabilities(&row);

        let (best, prob) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        run = match run {
            Some((class, start, _, confidence)) if class == best => {
                Some((class, start, t, confidence.max(prob)))
            }
            previous => {
                flush(previous);
                (best != 0).then_some((best, t, t, prob))
            }
        };
    }
    flush(run);

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-";

    fn vocab() -> Vec<char> {
        VOCAB.chars().collect()
    }

    /// Build an output where timestep `t` peaks at class `path[t]` with probability 0.9.
    fn output_for(path: &[usize]) -> ArrayD<f32> {
        let classes = VOCAB.len() + 1;
        let rest = 0.1 / (classes - 1) as f32;
        let mut output = Array::from_elem(IxDyn(&[1, path.len(), classes]), rest);
        for (t, &class) in path.iter().enumerate() {
            output[[0, t, class]] = 0.9;
        }
        output
    }

    #[test]
    fn test_ctc_decode_simple() {
        // blank, A, B, C, blank ('A' is vocab index 10, class 11)
        let output = output_for(&[0, 11, 12, 13, 0]);
        let tokens = ctc_decode(&output, &vocab(), 100).unwrap();
        let text: String = tokens.iter().map(|t| t.character).collect();
        assert_eq!(text, "ABC");
        assert!(tokens.iter().all(|t| (t.confidence - 0.9).abs() < 1e-5));
    }

    #[test]
    fn test_repeats_collapse_unless_separated_by_blank() {
        // 1 1 blank 1 2 2 -> "112"
        let output = output_for(&[2, 2, 0, 2, 3, 3]);
        let tokens = ctc_decode(&output, &vocab(), 60).unwrap();
        let text: String = tokens.iter().map(|t| t.character).collect();
        assert_eq!(text, "112");
    }

    #[test]
    fn test_token_centers_follow_runs() {
        // 10 timesteps over 100 px: the run at t=2..=3 is centered at 30 px
        let output = output_for(&[0, 0, 2, 2, 0, 0, 0, 0, 3, 0]);
        let tokens = ctc_decode(&output, &vocab(), 100).unwrap();
        assert_eq!(tokens.len(), 2);
        assert!((tokens[0].center_x - 30.0).abs() < 1e-4);
        assert!((tokens[1].center_x - 85.0).abs() < 1e-4);
        assert!(tokens[0].center_x < tokens[1].center_x);
    }

    #[test]
    fn test_logits_are_softmaxed() {
        let classes = VOCAB.len() + 1;
        let mut output = Array::from_elem(IxDyn(&[1, 1, classes]), -5.0f32);
        output[[0, 0, 1]] = 5.0; // '0'
        let tokens = ctc_decode(&output, &vocab(), 10).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].character, '0');
        assert!(tokens[0].confidence > 0.9 && tokens[0].confidence <= 1.0);
    }

    #[test]
    fn test_bad_shape_is_error() {
        let output = Array::from_elem(IxDyn(&[1, 5]), 0.0f32);
        assert!(ctc_decode(&output, &vocab(), 10).is_err());
    }
}
