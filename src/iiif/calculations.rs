//! Pure IIIF dimension math.
//!
//! The normalizer, the converter's planner and the fallback chain all read
//! sizes through the helpers here so that a size computed at request time
//! rounds exactly like the size computed when the derivative was cached.
//! Rounding is `f64::round` (half away from zero), clamped to at least 1px.

use super::params::{BASE_QUALITY, DEFAULT_FORMAT, RasterOpts, Region, SizeSpec};
use crate::imaging::{Dimensions, Rect};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Invalid {field}: {message}")]
    InvalidParameter { field: &'static str, message: String },
    #[error("Region {region} lies outside the {width}x{height} image")]
    RegionOutOfBounds {
        region: String,
        width: u32,
        height: u32,
    },
    #[error("Region {0} is empty")]
    EmptyRegion(String),
    #[error("Cannot scale a zero-sized dimension")]
    ZeroDimension,
}

/// Round a pixel computation to a whole, non-zero pixel count.
pub fn round_px(value: f64) -> u32 {
    value.round().max(1.0) as u32
}

/// Scale `(w, h)` so the width becomes `width`.
pub fn scale_to_width(width: u32, original: Dimensions) -> (u32, u32) {
    let height = width as f64 * original.height as f64 / original.width as f64;
    (width, round_px(height))
}

/// Scale `(w, h)` so the height becomes `height`.
pub fn scale_to_height(height: u32, original: Dimensions) -> (u32, u32) {
    let width = height as f64 * original.width as f64 / original.height as f64;
    (round_px(width), height)
}

/// Largest aspect-preserving size that fits inside `bounds`.
///
/// When the original is wider than the box, the width binds; otherwise the
/// height does.
pub fn fit_within(bounds: (u32, u32), original: Dimensions) -> (u32, u32) {
    let (bound_w, bound_h) = bounds;
    let original_ratio = original.width as f64 / original.height as f64;
    let bounds_ratio = bound_w as f64 / bound_h as f64;
    if original_ratio > bounds_ratio {
        scale_to_width(bound_w, original)
    } else {
        scale_to_height(bound_h, original)
    }
}

/// Scale the long side of `(width, height)` to `size`.
///
/// Used for the `sizes` list of image info.
pub fn closest_size(size: u32, width: u32, height: u32) -> Result<(u32, u32), PlanError> {
    if size == 0 || width == 0 || height == 0 {
        return Err(PlanError::ZeroDimension);
    }
    let original = Dimensions { width, height };
    if width > height {
        Ok(scale_to_width(size, original))
    } else {
        Ok(scale_to_height(size, original))
    }
}

/// Resolve a region against the image it is cut from.
///
/// Rectangles that run past the right or bottom edge are clipped. A
/// rectangle whose origin is outside the image is an error.
pub fn resolve_region(region: &Region, image: Dimensions) -> Result<Rect, PlanError> {
    let Dimensions { width, height } = image;
    let (x, y, w, h) = match *region {
        Region::Full => (0, 0, width, height),
        Region::Square | Region::Featured => {
            let side = width.min(height);
            ((width - side) / 2, (height - side) / 2, side, side)
        }
        Region::Pixels { x, y, w, h } => (x, y, w, h),
        Region::Percent { x, y, w, h } => (
            (x * width as f64 / 100.0).round() as u32,
            (y * height as f64 / 100.0).round() as u32,
            (w * width as f64 / 100.0).round() as u32,
            (h * height as f64 / 100.0).round() as u32,
        ),
    };

    if x >= width || y >= height {
        return Err(PlanError::RegionOutOfBounds {
            region: region.to_string(),
            width,
            height,
        });
    }
    let w = w.min(width - x);
    let h = h.min(height - y);
    if w == 0 || h == 0 {
        return Err(PlanError::EmptyRegion(region.to_string()));
    }
    Ok(Rect {
        x,
        y,
        width: w,
        height: h,
    })
}

/// Resolve a size against the (already cropped) region dimensions.
pub fn resolve_size(size: &SizeSpec, region: Dimensions) -> Result<(u32, u32), PlanError> {
    if region.width == 0 || region.height == 0 {
        return Err(PlanError::ZeroDimension);
    }
    Ok(match *size {
        SizeSpec::Full | SizeSpec::Max => (region.width, region.height),
        SizeSpec::Width(w) => scale_to_width(w, region),
        SizeSpec::Height(h) => scale_to_height(h, region),
        SizeSpec::Percent(p) => (
            round_px(region.width as f64 * p / 100.0),
            round_px(region.height as f64 * p / 100.0),
        ),
        SizeSpec::Exact(w, h) => (w, h),
        SizeSpec::BestFit(w, h) => fit_within((w, h), region),
    })
}

/// Power-of-two zoom levels for a tile pyramid.
///
/// Starts at 1 and keeps doubling while the long side at the current factor
/// still spans at least one tile, so the last factor is the first level at
/// which the whole image fits in a single tile.
pub fn scale_factors(width: u32, height: u32, tile_size: u32) -> Vec<u32> {
    let long_side = width.max(height);
    let mut factors = vec![1u32];
    if tile_size == 0 {
        return factors;
    }
    let mut factor = 1u32;
    while long_side / factor >= tile_size {
        factor *= 2;
        factors.push(factor);
    }
    factors
}

/// Every tile request a zooming viewer can make against an image.
///
/// At scale factor `f` each tile covers a `tile_size * f` square of the
/// image (clipped at the edges) and is scaled to `ceil(region_w / f),`.
pub fn plan_tiles(width: u32, height: u32, tile_size: u32) -> Vec<RasterOpts> {
    let mut tiles = Vec::new();
    if tile_size == 0 || width == 0 || height == 0 {
        return tiles;
    }
    for factor in scale_factors(width, height, tile_size) {
        let span = tile_size.saturating_mul(factor);
        for y in (0..height).step_by(span as usize) {
            for x in (0..width).step_by(span as usize) {
                let w = span.min(width - x);
                let h = span.min(height - y);
                tiles.push(RasterOpts::new(
                    format!("{x},{y},{w},{h}"),
                    format!("{},", w.div_ceil(factor)),
                    0,
                    BASE_QUALITY,
                    DEFAULT_FORMAT,
                ));
            }
        }
    }
    tiles
}
