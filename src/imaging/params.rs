//! Parameter types for image conversions.
//!
//! A [`ConvertPlan`] describes *what* one IIIF conversion does in concrete
//! pixels. The [`operations`](super::operations) module builds it from request
//! strings; the [`backend`](super::backend) executes it. Keeping the plan as
//! plain data lets the mock backend record exactly what would have happened.

use crate::imaging::Dimensions;

/// JPEG encoding quality (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegQuality(pub u8);

impl JpegQuality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for JpegQuality {
    fn default() -> Self {
        Self(90)
    }
}

/// Pixel rectangle in the decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clockwise rotation applied after scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Cw90),
            180 => Some(Rotation::Cw180),
            270 => Some(Rotation::Cw270),
            _ => None,
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Cw270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    Gray,
    /// Luma thresholded to pure black and white.
    Bitonal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Jpeg(JpegQuality),
    Png,
}

/// One fully-resolved conversion: crop, scale, rotate, colour, encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertPlan {
    pub crop: Rect,
    /// Scaled size before rotation.
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub color: ColorMode,
    pub encoding: Encoding,
}

impl ConvertPlan {
    /// Dimensions of the written file.
    pub fn output_dimensions(&self) -> Dimensions {
        if self.rotation.swaps_axes() {
            Dimensions {
                width: self.height,
                height: self.width,
            }
        } else {
            Dimensions {
                width: self.width,
                height: self.height,
            }
        }
    }
}
