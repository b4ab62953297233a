//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP) | `image` crate (pure Rust decoders) |
//! | Identify | `image::image_dimensions` (header only) |
//! | Crop | `DynamicImage::crop_imm` |
//! | Scale | `DynamicImage::resize_exact` with `Lanczos3` |
//! | Rotate | `rotate90` / `rotate180` / `rotate270` |
//! | Gray / bitonal | `to_luma8`, bitonal thresholds at 128 |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` with configured quality |
//! | Encode → PNG | `image::codecs::png::PngEncoder` |

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::params::{ColorMode, ConvertPlan, Encoding, Rotation};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageReader};
use std::io::BufWriter;
use std::path::Path;

/// Luma cut-off between black and white for `bitonal`.
const BITONAL_THRESHOLD: u8 = 128;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and decode an image from disk.
fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    ImageReader::open(path)
        .map_err(BackendError::Io)?
        .with_guessed_format()
        .map_err(BackendError::Io)?
        .decode()
        .map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
        })
}

fn apply_color(img: DynamicImage, color: ColorMode) -> DynamicImage {
    match color {
        ColorMode::Rgb => img,
        ColorMode::Gray => DynamicImage::ImageLuma8(img.to_luma8()),
        ColorMode::Bitonal => {
            let mut luma: GrayImage = img.to_luma8();
            for pixel in luma.pixels_mut() {
                pixel.0[0] = if pixel.0[0] >= BITONAL_THRESHOLD { 255 } else { 0 };
            }
            DynamicImage::ImageLuma8(luma)
        }
    }
}

fn apply_rotation(img: DynamicImage, rotation: Rotation) -> DynamicImage {
    match rotation {
        Rotation::None => img,
        Rotation::Cw90 => img.rotate90(),
        Rotation::Cw180 => img.rotate180(),
        Rotation::Cw270 => img.rotate270(),
    }
}

/// Encode and save according to the plan's encoding, regardless of extension.
fn save_image(img: &DynamicImage, path: &Path, encoding: Encoding) -> Result<(), BackendError> {
    let file = std::fs::File::create(path).map_err(BackendError::Io)?;
    let writer = BufWriter::new(file);
    match encoding {
        Encoding::Jpeg(quality) => {
            // JPEG has no alpha channel
            let flattened = match img {
                DynamicImage::ImageLuma8(_) => img.clone(),
                other => DynamicImage::ImageRgb8(other.to_rgb8()),
            };
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(writer, quality.value());
            flattened
                .write_with_encoder(encoder)
                .map_err(|e| BackendError::ProcessingFailed(format!("JPEG encode failed: {}", e)))
        }
        Encoding::Png => {
            let encoder = image::codecs::png::PngEncoder::new(writer);
            img.write_with_encoder(encoder)
                .map_err(|e| BackendError::ProcessingFailed(format!("PNG encode failed: {}", e)))
        }
    }
}

impl ImageBackend for RustBackend {
    type Image = DynamicImage;

    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
        let (width, height) = image::image_dimensions(path).map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to read dimensions: {}", e))
        })?;
        Ok(Dimensions { width, height })
    }

    fn decode(&self, path: &Path) -> Result<DynamicImage, BackendError> {
        load_image(path)
    }

    fn dimensions(&self, image: &DynamicImage) -> Dimensions {
        Dimensions {
            width: image.width(),
            height: image.height(),
        }
    }

    fn convert(
        &self,
        image: &DynamicImage,
        output: &Path,
        plan: &ConvertPlan,
    ) -> Result<(), BackendError> {
        let crop = plan.crop;
        let covers_whole_image = crop.x == 0
            && crop.y == 0
            && crop.width == image.width()
            && crop.height == image.height();
        let cropped = if covers_whole_image {
            image.clone()
        } else {
            image.crop_imm(crop.x, crop.y, crop.width, crop.height)
        };

        let scaled = if (plan.width, plan.height) == (cropped.width(), cropped.height()) {
            cropped
        } else {
            cropped.resize_exact(plan.width, plan.height, FilterType::Lanczos3)
        };

        let colored = apply_color(apply_rotation(scaled, plan.rotation), plan.color);
        save_image(&colored, output, plan.encoding)
    }
}
