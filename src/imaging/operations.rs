//! High-level image operations.
//!
//! These functions combine the IIIF calculations with backend execution:
//! parse the request strings, resolve region and size against the decoded
//! image, and hand the resulting [`ConvertPlan`] to the backend.

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::params::{ColorMode, ConvertPlan, Encoding, JpegQuality, Rotation};
use crate::iiif::calculations::{resolve_region, resolve_size};
use crate::iiif::params::{ColorQuality, OutputFormat, Region, SizeSpec};
use crate::iiif::{PlanError, RasterOpts};
use std::path::Path;

fn invalid(field: &'static str, message: String) -> PlanError {
    PlanError::InvalidParameter { field, message }
}

/// Plan a conversion without executing it.
///
/// Applies the IIIF order of operations: region, size, rotation, quality,
/// format.
pub fn plan_conversion(
    source: Dimensions,
    opts: &RasterOpts,
    jpeg_quality: JpegQuality,
) -> Result<ConvertPlan, PlanError> {
    let region: Region = opts.region.parse().map_err(|e| invalid("region", e))?;
    let size: SizeSpec = opts.size.parse().map_err(|e| invalid("size", e))?;
    let rotation = Rotation::from_degrees(opts.rotation).ok_or_else(|| {
        invalid(
            "rotation",
            format!("must be one of 0, 90, 180, 270 (got {})", opts.rotation),
        )
    })?;
    let color = match opts.quality.parse::<ColorQuality>() {
        Ok(ColorQuality::Default | ColorQuality::Color) => ColorMode::Rgb,
        Ok(ColorQuality::Gray) => ColorMode::Gray,
        Ok(ColorQuality::Bitonal) => ColorMode::Bitonal,
        Err(e) => return Err(invalid("quality", e)),
    };
    let encoding = match opts.format.parse::<OutputFormat>() {
        Ok(OutputFormat::Jpg) => Encoding::Jpeg(jpeg_quality),
        Ok(OutputFormat::Png) => Encoding::Png,
        Err(e) => return Err(invalid("format", e)),
    };

    let crop = resolve_region(&region, source)?;
    let (width, height) = resolve_size(
        &size,
        Dimensions {
            width: crop.width,
            height: crop.height,
        },
    )?;

    Ok(ConvertPlan {
        crop,
        width,
        height,
        rotation,
        color,
        encoding,
    })
}

/// Error from [`render`]: either the request could not be planned or the
/// backend failed to execute it.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Plan and execute one conversion from an already-decoded image.
pub fn render<B: ImageBackend>(
    backend: &B,
    image: &B::Image,
    output: &Path,
    opts: &RasterOpts,
    jpeg_quality: JpegQuality,
) -> Result<Dimensions, RenderError> {
    let plan = plan_conversion(backend.dimensions(image), opts, jpeg_quality)?;
    backend.convert(image, output, &plan)?;
    Ok(plan.output_dimensions())
}
