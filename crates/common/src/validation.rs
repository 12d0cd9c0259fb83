//! Input validation for values crossing into the recognition pipeline
//!
//! Everything here returns an error instead of panicking:
//! - Configuration values (thresholds, sizes, prefixes)
//! - Image paths supplied by callers
//! - Manually selected image regions

use crate::detections::BoundingBox;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for file paths
pub const MAX_PATH_LENGTH: usize = 4096;

// ============================================================================
// Numeric Validation
// ============================================================================

/// Validate value is within range
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

/// Validate a confidence-like value in `[0.0, 1.0]`
pub fn validate_unit_interval(value: f32, field_name: &str) -> Result<()> {
    if value.is_nan() {
        return Err(anyhow!("{} must be a number, got NaN", field_name));
    }
    validate_range(value, 0.0, 1.0, field_name)
}

/// Validate a strictly positive size
pub fn validate_non_zero(value: u32, field_name: &str) -> Result<()> {
    if value == 0 {
        return Err(anyhow!("{} must be greater than 0", field_name));
    }
    Ok(())
}

/// Validate image dimensions before any pixel work. Only empty images are rejected.
pub fn validate_image_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(anyhow!("image is empty ({}x{})", width, height));
    }
    Ok(())
}

// ============================================================================
// String Validation
// ============================================================================

/// Validate a plate prefix: exactly three ASCII uppercase letters
pub fn validate_plate_prefix(prefix: &str) -> Result<()> {
    if prefix.len() != 3 || !prefix.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(anyhow!(
            "plate prefix must be three uppercase letters, got '{}'",
            prefix
        ));
    }
    Ok(())
}

// ============================================================================
// Path Validation
// ============================================================================

/// Validate an image path supplied by a caller and return it canonicalized
pub fn validate_image_path(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("image path contains invalid UTF-8"))?;

    if path_str.len() > MAX_PATH_LENGTH {
        return Err(anyhow!(
            "image path exceeds maximum length of {} bytes (got {})",
            MAX_PATH_LENGTH,
            path_str.len()
        ));
    }

    let canonical = path
        .canonicalize()
        .with_context(|| format!("image file not found: {}", path.display()))?;

    if !canonical.is_file() {
        return Err(anyhow!("image path is not a file: {}", canonical.display()));
    }

    Ok(canonical)
}

// ============================================================================
// Region Selection
// ============================================================================

/// Clamp a manually selected rectangle to an image of `width` x `height`.
///
/// Inverted selections (`x1 >= x2` or `y1 >= y2`) are rejected before clamping.
/// After clamping the selection keeps at least one pixel:
/// `x1 in [0, w-1]`, `y1 in [0, h-1]`, `x2 in [x1+1, w]`, `y2 in [y1+1, h]`.
pub fn clamp_selection(
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    width: u32,
    height: u32,
) -> Result<BoundingBox> {
    if x1 >= x2 || y1 >= y2 {
        return Err(anyhow!(
            "invalid selection: x1={}, y1={}, x2={}, y2={}",
            x1,
            y1,
            x2,
            y2
        ));
    }
    validate_image_dimensions(width, height)?;

    let w = width as i32;
    let h = height as i32;
    let x1 = x1.clamp(0, w - 1);
    let y1 = y1.clamp(0, h - 1);
    let x2 = x2.min(w).max(x1 + 1);
    let y2 = y2.min(h).max(y1 + 1);

    BoundingBox::new(x1, y1, x2, y2).ok_or_else(|| anyhow!("selection is empty after clamping"))
}

// ============================================================================
// Tests
// ============================================================================
