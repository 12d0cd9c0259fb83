//! Plate region preprocessing.
//!
//! A fixed filter chain with no branching on pixel content:
//! scale to a target width, grayscale, bilateral smoothing, CLAHE, then local-mean
//! binarization. The same helpers back the contour plate localizer.

use crate::error::{PipelineError, Result};
use common::validation::validate_non_zero;
use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::definitions::Image;
use imageproc::filter;
use imageproc::integral_image::{integral_image, sum_image_pixels};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Width every crop is scaled to before filtering (aspect ratio kept); `None` keeps
    /// the crop size
    #[serde(default = "default_target_width")]
    pub target_width: Option<u32>,

    /// Bilateral filter neighbourhood diameter in pixels
    #[serde(default = "default_bilateral_diameter")]
    pub bilateral_diameter: u32,

    #[serde(default = "default_bilateral_sigma")]
    pub bilateral_sigma_color: f32,

    #[serde(default = "default_bilateral_sigma")]
    pub bilateral_sigma_space: f32,

    #[serde(default = "default_clahe_clip_limit")]
    pub clahe_clip_limit: f32,

    /// CLAHE tiles per side
    #[serde(default = "default_clahe_grid")]
    pub clahe_grid: u32,

    /// Side of the square neighbourhood used for the local mean (odd)
    #[serde(default = "default_threshold_block_size")]
    pub threshold_block_size: u32,

    /// Constant subtracted from the local mean
    #[serde(default = "default_threshold_offset")]
    pub threshold_offset: i32,
}

fn default_target_width() -> Option<u32> {
    Some(300)
}

fn default_bilateral_diameter() -> u32 {
    11
}

fn default_bilateral_sigma() -> f32 {
    17.0
}

fn default_clahe_clip_limit() -> f32 {
    2.0
}

fn default_clahe_grid() -> u32 {
    8
}

fn default_threshold_block_size() -> u32 {
    11
}

fn default_threshold_offset() -> i32 {
    2
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            target_width: default_target_width(),
            bilateral_diameter: default_bilateral_diameter(),
            bilateral_sigma_color: default_bilateral_sigma(),
            bilateral_sigma_space: default_bilateral_sigma(),
            clahe_clip_limit: default_clahe_clip_limit(),
            clahe_grid: default_clahe_grid(),
            threshold_block_size: default_threshold_block_size(),
            threshold_offset: default_threshold_offset(),
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(width) = self.target_width {
            validate_non_zero(width, "preprocess.target_width").map_err(PipelineError::config)?;
        }
        validate_non_zero(self.bilateral_diameter, "preprocess.bilateral_diameter")
            .map_err(PipelineError::config)?;
        validate_non_zero(self.clahe_grid, "preprocess.clahe_grid").map_err(PipelineError::config)?;
        if self.threshold_block_size < 3 || self.threshold_block_size % 2 == 0 {
            return Err(PipelineError::Config(format!(
                "preprocess.threshold_block_size must be odd and >= 3, got {}",
                self.threshold_block_size
            )));
        }
        if self.bilateral_sigma_color <= 0.0 || self.bilateral_sigma_space <= 0.0 {
            return Err(PipelineError::Config(
                "preprocess bilateral sigmas must be positive".to_string(),
            ));
        }
        if self.clahe_clip_limit <= 0.0 {
            return Err(PipelineError::Config(
                "preprocess.clahe_clip_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the filter chain. Returns `None` for an empty crop.
    pub fn preprocess(&self, plate: &RgbImage) -> Option<GrayImage> {
        if plate.width() == 0 || plate.height() == 0 {
            return None;
        }

        let scaled = match self.config.target_width {
            Some(width) => scale_to_width(plate, width),
            None => plate.clone(),
        };
        let gray = imageops::grayscale(&scaled);
        let smoothed = denoise(&gray, &self.config);
        let enhanced = clahe(&smoothed, self.config.clahe_clip_limit, self.config.clahe_grid);

        Some(adaptive_mean_threshold(
            &enhanced,
            self.config.threshold_block_size,
            self.config.threshold_offset,
        ))
    }
}

/// Resize so the width equals `width`, keeping the aspect ratio (height at least 1).
pub fn scale_to_width(image: &RgbImage, width: u32) -> RgbImage {
    if image.width() == width {
        return image.clone();
    }
    let scale = width as f32 / image.width() as f32;
    let height = ((image.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(image, width, height, imageops::FilterType::Triangle)
}

/// Edge-preserving smoothing with the configured bilateral window. Borders replicate the
/// nearest pixel.
pub fn denoise(image: &GrayImage, config: &PreprocessConfig) -> GrayImage {
    if image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    filter::bilateral_filter(
        image,
        config.bilateral_diameter,
        config.bilateral_sigma_color,
        config.bilateral_sigma_space,
    )
}

/// Contrast limited adaptive histogram equalization over a `grid` x `grid` tiling.
///
/// Histogram bins are clipped at `clip_limit * tile_area / 256`; the clipped excess is
/// spread evenly over all bins. Per-tile mappings are blended bilinearly between tile
/// centres.
pub fn clahe(image: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let tile_w = width.div_ceil(grid).max(1);
    let tile_h = height.div_ceil(grid).max(1);
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            luts.push(clipped_equalization(&mut hist, area, clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];

    GrayImage::from_fn(width, height, |x, y| {
        let value = image.get_pixel(x, y)[0] as usize;

        let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let tx0 = fx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
        let ty0 = fy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let ax = (fx - tx0 as f32).clamp(0.0, 1.0);
        let ay = (fy - ty0 as f32).clamp(0.0, 1.0);

        let top = lut_at(tx0, ty0)[value] as f32 * (1.0 - ax) + lut_at(tx1, ty0)[value] as f32 * ax;
        let bottom =
            lut_at(tx0, ty1)[value] as f32 * (1.0 - ax) + lut_at(tx1, ty1)[value] as f32 * ax;

        Luma([(top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8])
    })
}

fn clipped_equalization(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share;
        if i < remainder {
            *bin += 1;
        }
    }

    let scale = 255.0 / area.max(1) as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[i] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Binarize against the mean of a `block_size` x `block_size` neighbourhood minus
/// `offset`: pixels strictly above the threshold become 255, the rest 0.
///
/// Near the borders the neighbourhood is cropped to the image.
pub fn adaptive_mean_threshold(image: &GrayImage, block_size: u32, offset: i32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let integral: Image<Luma<u64>> = integral_image(image);
    let radius = block_size / 2;
    GrayImage::from_fn(width, height, |x, y| {
        let left = x.saturating_sub(radius);
        let top = y.saturating_sub(radius);
        let right = (x + radius).min(width - 1);
        let bottom = (y + radius).min(height - 1);

        let sum = sum_image_pixels(&integral, left, top, right, bottom)[0];
        let count = ((right - left + 1) * (bottom - top + 1)) as f64;
        let threshold = sum as f64 / count - offset as f64;

        if image.get_pixel(x, y)[0] as f64 > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn uniform_gray(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([value]))
    }

    #[test]
    fn test_empty_crop_returns_none() {
        let preprocessor = Preprocessor::default();
        assert!(preprocessor.preprocess(&RgbImage::new(0, 0)).is_none());
        assert!(preprocessor.preprocess(&RgbImage::new(10, 0)).is_none());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(PreprocessConfig::default().validate().is_ok());
    }

    #[test]
    fn test_even_block_size_rejected() {
        let config = PreprocessConfig {
            threshold_block_size: 10,
            ..PreprocessConfig::default()
        };
        assert!(Preprocessor::new(config).is_err());
    }

    #[test]
    fn test_scale_to_width_keeps_aspect() {
        let image = RgbImage::new(150, 50);
        let scaled = scale_to_width(&image, 300);
        assert_eq!(scaled.dimensions(), (300, 100));

        let thin = RgbImage::new(1000, 1);
        assert_eq!(scale_to_width(&thin, 300).height(), 1);
    }

    #[test]
    fn test_bilateral_keeps_uniform_image() {
        let image = uniform_gray(20, 12, 120);
        assert_eq!(denoise(&image, &PreprocessConfig::default()), image);
    }

    #[test]
    fn test_bilateral_preserves_strong_edge() {
        let image = GrayImage::from_fn(20, 10, |x, _| if x < 10 { Luma([0]) } else { Luma([255]) });
        let filtered = denoise(&image, &PreprocessConfig::default());
        // A 255 step is far beyond sigma_color, so neither side bleeds over
        assert_eq!(filtered.get_pixel(9, 5)[0], 0);
        assert_eq!(filtered.get_pixel(10, 5)[0], 255);
    }

    #[test]
    fn test_denoise_handles_black_and_empty_images() {
        let config = PreprocessConfig::default();
        let black = uniform_gray(16, 8, 0);
        assert_eq!(denoise(&black, &config), black);
        assert_eq!(denoise(&GrayImage::new(0, 0), &config).dimensions(), (0, 0));
    }

    #[test]
    fn test_adaptive_threshold_borders_use_cropped_window() {
        // A single dark corner pixel still falls below its cropped 6x6 mean
        let mut image = uniform_gray(12, 12, 200);
        image.put_pixel(0, 0, Luma([100]));
        let out = adaptive_mean_threshold(&image, 11, 2);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(11, 11)[0], 255);
    }

    #[test]
    fn test_clahe_uniform_image_stays_uniform() {
        let image = uniform_gray(64, 32, 90);
        let out = clahe(&image, 2.0, 8);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let image = GrayImage::from_fn(64, 64, |x, _| Luma([100 + (x % 8) as u8]));
        let out = clahe(&image, 2.0, 8);
        let (min, max) = out
            .pixels()
            .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
        assert!(max - min > 7, "contrast not increased: {}..{}", min, max);
    }

    #[test]
    fn test_adaptive_threshold_uniform_is_white() {
        let image = uniform_gray(15, 15, 77);
        let out = adaptive_mean_threshold(&image, 11, 2);
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_adaptive_threshold_dark_stroke() {
        // Dark vertical stroke on a light background
        let image = GrayImage::from_fn(21, 21, |x, _| {
            if (9..=11).contains(&x) {
                Luma([20])
            } else {
                Luma([220])
            }
        });
        let out = adaptive_mean_threshold(&image, 11, 2);
        assert_eq!(out.get_pixel(10, 10)[0], 0);
        assert_eq!(out.get_pixel(2, 10)[0], 255);
    }

    #[test]
    fn test_preprocess_output_is_binary_and_deterministic() {
        let plate = RgbImage::from_fn(120, 30, |x, y| {
            if (x / 10) % 2 == 0 && (5..25).contains(&y) {
                Rgb([10, 10, 10])
            } else {
                Rgb([230, 230, 230])
            }
        });
        let preprocessor = Preprocessor::default();
        let first = preprocessor.preprocess(&plate).unwrap();
        let second = preprocessor.preprocess(&plate).unwrap();

        assert_eq!(first.width(), 300);
        assert_eq!(first.height(), 75);
        assert!(first.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(first, second);
    }
}
