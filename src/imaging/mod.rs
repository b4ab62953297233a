//! Image processing in pure Rust, with no system codec libraries.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image::image_dimensions` |
//! | **Decode** | `image::ImageReader` (format sniffed from content) |
//! | **Convert** | crop + Lanczos3 resize + rotate + colour + JPEG/PNG encode |
//!
//! The module is split into:
//! - **Parameters**: Data structures describing one conversion
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: Planning a conversion from IIIF request strings, and
//!   executing it through a backend

pub mod backend;
pub mod operations;
pub mod params;
pub mod rust_backend;

pub use backend::{BackendError, Dimensions, ImageBackend};
pub use operations::{RenderError, plan_conversion, render};
pub use params::{ColorMode, ConvertPlan, Encoding, JpegQuality, Rect, Rotation};
pub use rust_backend::RustBackend;
