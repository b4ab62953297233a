//! Canonical form of a raster request.
//!
//! IIIF lets a client ask for the same pixels many ways: `573,`, `,768`,
//! `!768,768` and `573,768` all describe one image for a 6485x8690 source.
//! [`normalize`] rewrites each request to a single canonical form so that
//! equivalent requests share one cache entry.
//!
//! - `square` / `featured` regions become the resource's featured region.
//! - quality `default` becomes `color`.
//! - `w,`, `,h` and `!w,h` sizes become an explicit `w,h` computed from the
//!   resource's standard dimensions.
//!
//! Everything else passes through untouched, including sizes that do not
//! parse; request validation is a separate step.

use super::calculations::{fit_within, scale_to_height, scale_to_width};
use super::params::{BASE_QUALITY, RasterOpts, SizeSpec};
use crate::imaging::Dimensions;
use crate::resource::Resource;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Cannot normalize size {size} for {identifier}: standard dimensions are unknown")]
    MissingDimensions { identifier: String, size: String },
}

pub fn normalize(resource: &Resource, raw: &RasterOpts) -> Result<RasterOpts, NormalizeError> {
    let region = match (raw.region.as_str(), resource.featured_region) {
        ("square" | "featured", Some(featured)) => featured.to_string(),
        _ => raw.region.clone(),
    };

    let quality = if raw.quality == "default" {
        BASE_QUALITY.to_string()
    } else {
        raw.quality.clone()
    };

    let size = normalize_size(&raw.size, resource.dimensions.standard).ok_or_else(|| {
        NormalizeError::MissingDimensions {
            identifier: resource.identifier.clone(),
            size: raw.size.clone(),
        }
    })?;

    Ok(RasterOpts {
        region,
        size,
        rotation: raw.rotation,
        quality,
        format: raw.format.clone(),
    })
}

/// Canonical `w,h` for the computed size forms.
///
/// Returns `None` only when a computed form is requested and `standard` is
/// unknown.
pub fn normalize_size(size: &str, standard: Option<Dimensions>) -> Option<String> {
    let spec = match size.parse::<SizeSpec>() {
        Ok(spec @ (SizeSpec::Width(_) | SizeSpec::Height(_) | SizeSpec::BestFit(..))) => spec,
        _ => return Some(size.to_string()),
    };

    let original = standard.filter(|d| d.width > 0 && d.height > 0)?;
    let (w, h) = match spec {
        SizeSpec::Width(w) => scale_to_width(w, original),
        SizeSpec::Height(h) => scale_to_height(h, original),
        SizeSpec::BestFit(bw, bh) => fit_within((bw, bh), original),
        _ => return Some(size.to_string()),
    };
    Some(format!("{w},{h}"))
}
