//! Data behind an IIIF `info.json` response.
//!
//! Only the numbers are computed here. Wrapping them in the JSON-LD envelope
//! (`@context`, `@id`) is left to the HTTP layer.

use super::calculations::{PlanError, closest_size, scale_factors};
use super::params::{ALLOWED_FORMATS, ALLOWED_QUALITIES};
use crate::imaging::Dimensions;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceLevel {
    /// Only pre-generated rasters can be served.
    Level0,
    /// Arbitrary rasters are generated on demand.
    Level1,
}

impl ComplianceLevel {
    pub fn profile_url(self) -> &'static str {
        match self {
            ComplianceLevel::Level0 => "http://iiif.io/api/image/2/level0.json",
            ComplianceLevel::Level1 => "http://iiif.io/api/image/2/level1.json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileInfo {
    pub width: u32,
    #[serde(rename = "scaleFactors")]
    pub scale_factors: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub sizes: Vec<Dimensions>,
    pub tiles: Vec<TileInfo>,
    pub formats: Vec<&'static str>,
    pub qualities: Vec<&'static str>,
    pub compliance: ComplianceLevel,
    pub profile: &'static str,
}

pub fn image_info(
    dims: Dimensions,
    recommended_sizes: &[u32],
    tile_size: u32,
    compliance: ComplianceLevel,
) -> Result<ImageInfo, PlanError> {
    let sizes = recommended_sizes
        .iter()
        .map(|&size| {
            closest_size(size, dims.width, dims.height)
                .map(|(width, height)| Dimensions { width, height })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ImageInfo {
        width: dims.width,
        height: dims.height,
        sizes,
        tiles: vec![TileInfo {
            width: tile_size,
            scale_factors: scale_factors(dims.width, dims.height, tile_size),
        }],
        formats: ALLOWED_FORMATS.to_vec(),
        qualities: ALLOWED_QUALITIES.to_vec(),
        compliance,
        profile: compliance.profile_url(),
    })
}
