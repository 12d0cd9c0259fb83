/// Integration tests for plate preprocessing
use image::{Rgb, RgbImage};
use lpr_pipeline::preprocess::{PreprocessConfig, Preprocessor};
use lpr_pipeline::PipelineError;

/// Light plate with dark vertical strokes
fn plate_crop(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let stroke = x % 12 < 4 && y > height / 5 && y < height - height / 5;
        if stroke {
            Rgb([20, 20, 20])
        } else {
            Rgb([230, 230, 230])
        }
    })
}

#[test]
fn test_output_is_binary_at_target_width() {
    let preprocessor = Preprocessor::default();

    let binary = preprocessor.preprocess(&plate_crop(120, 30)).unwrap();

    assert_eq!(binary.dimensions(), (300, 75));
    assert!(binary.pixels().all(|p| p[0] == 0 || p[0] == 255));
    assert!(binary.pixels().any(|p| p[0] == 0));
    assert!(binary.pixels().any(|p| p[0] == 255));
}

#[test]
fn test_same_input_same_output() {
    let preprocessor = Preprocessor::default();
    let crop = plate_crop(90, 24);

    assert_eq!(preprocessor.preprocess(&crop), preprocessor.preprocess(&crop));
}

#[test]
fn test_native_size_is_kept_without_target_width() {
    let preprocessor = Preprocessor::new(PreprocessConfig {
        target_width: None,
        ..PreprocessConfig::default()
    })
    .unwrap();

    let binary = preprocessor.preprocess(&plate_crop(64, 20)).unwrap();
    assert_eq!(binary.dimensions(), (64, 20));
}

#[test]
fn test_empty_crop_yields_nothing() {
    assert!(Preprocessor::default().preprocess(&RgbImage::new(0, 0)).is_none());
    assert!(Preprocessor::default().preprocess(&RgbImage::new(10, 0)).is_none());
}

#[test]
fn test_invalid_config_rejected() {
    let err = Preprocessor::new(PreprocessConfig {
        threshold_block_size: 10,
        ..PreprocessConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));

    let err = Preprocessor::new(PreprocessConfig {
        clahe_clip_limit: 0.0,
        ..PreprocessConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}
