//! IIIF Image API 2 request handling.
//!
//! - **Params**: request grammar, typed components and validation
//! - **Calculations**: pure size/region math and the tile pyramid
//! - **Normalize**: canonical form for equivalent requests
//! - **Info**: data for `info.json`

pub mod calculations;
pub mod info;
pub mod normalize;
pub mod params;

pub use calculations::{PlanError, closest_size, plan_tiles, scale_factors};
pub use info::{ComplianceLevel, ImageInfo, image_info};
pub use normalize::{NormalizeError, normalize};
pub use params::{
    BASE_IMAGE_FORMAT, BASE_QUALITY, BaseType, DEFAULT_FORMAT, FieldError, RasterOpts,
    UnknownBaseType, parse_request, split_quality_format,
};
