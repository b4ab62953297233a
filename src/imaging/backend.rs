//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait is the whole surface the cache needs from a
//! codec: identify a file, decode it once, and convert a decoded image into
//! one output file according to a [`ConvertPlan`]. Decoding is separate from
//! converting so the pipeline can cut a full tile pyramid from one decode.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend).

use super::params::ConvertPlan;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Trait for image processing backends.
///
/// `Sync` so one backend can be shared by every rayon worker.
pub trait ImageBackend: Sync {
    /// A decoded image, shareable across threads.
    type Image: Sync;

    /// Get image dimensions without a full decode where possible.
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError>;

    /// Decode an image from disk.
    fn decode(&self, path: &Path) -> Result<Self::Image, BackendError>;

    fn dimensions(&self, image: &Self::Image) -> Dimensions;

    /// Execute one conversion, writing the encoded result to `output`.
    fn convert(
        &self,
        image: &Self::Image,
        output: &Path,
        plan: &ConvertPlan,
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::imaging::params::{ColorMode, Encoding, Rect, Rotation};
    use std::sync::Mutex;

    /// Mock backend whose "images" are text files holding `WxH`.
    ///
    /// Operations are recorded in a Mutex (not RefCell) so it is Sync and
    /// works with rayon's par_iter. Converts write the planned output size,
    /// so a file produced by the mock can be decoded by it again.
    #[derive(Default)]
    pub struct MockBackend {
        pub operations: Mutex<Vec<RecordedOp>>,
        pub panic_on_convert: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Identify(String),
        Decode(String),
        Convert {
            output: String,
            crop: Rect,
            width: u32,
            height: u32,
            rotation: Rotation,
            color: ColorMode,
            encoding: Encoding,
        },
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        pub fn convert_count(&self) -> usize {
            self.get_operations()
                .iter()
                .filter(|op| matches!(op, RecordedOp::Convert { .. }))
                .count()
        }

        fn read_dims(path: &Path) -> Result<Dimensions, BackendError> {
            let text = std::fs::read_to_string(path)?;
            parse_mock_dims(&text).ok_or_else(|| {
                BackendError::ProcessingFailed(format!(
                    "Failed to decode {}: not a mock image",
                    path.display()
                ))
            })
        }
    }

    pub fn parse_mock_dims(text: &str) -> Option<Dimensions> {
        let (w, h) = text.trim().split_once('x')?;
        Some(Dimensions {
            width: w.parse().ok()?,
            height: h.parse().ok()?,
        })
    }

    impl ImageBackend for MockBackend {
        type Image = Dimensions;

        fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
            self.operations
                .lock()
                .unwrap()
                .push(RecordedOp::Identify(path.to_string_lossy().to_string()));
            Self::read_dims(path)
        }

        fn decode(&self, path: &Path) -> Result<Dimensions, BackendError> {
            self.operations
                .lock()
                .unwrap()
                .push(RecordedOp::Decode(path.to_string_lossy().to_string()));
            Self::read_dims(path)
        }

        fn dimensions(&self, image: &Dimensions) -> Dimensions {
            *image
        }

        fn convert(
            &self,
            _image: &Dimensions,
            output: &Path,
            plan: &ConvertPlan,
        ) -> Result<(), BackendError> {
            if self.panic_on_convert {
                panic!("mock codec crashed");
            }
            self.operations.lock().unwrap().push(RecordedOp::Convert {
                output: output.to_string_lossy().to_string(),
                crop: plan.crop,
                width: plan.width,
                height: plan.height,
                rotation: plan.rotation,
                color: plan.color,
                encoding: plan.encoding,
            });
            std::fs::write(output, plan.output_dimensions().to_string())?;
            Ok(())
        }
    }

    #[test]
    fn mock_records_identify() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("image.tif");
        std::fs::write(&path, "800x600").unwrap();

        let backend = MockBackend::new();
        let result = backend.identify(&path).unwrap();
        assert_eq!(result.width, 800);
        assert_eq!(result.height, 600);

        let ops = backend.get_operations();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], RecordedOp::Identify(p) if p.ends_with("image.tif")));
    }

    #[test]
    fn mock_decode_rejects_non_mock_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("garbage.tif");
        std::fs::write(&path, "not an image").unwrap();

        let err = MockBackend::new().decode(&path).unwrap_err();
        assert!(matches!(err, BackendError::ProcessingFailed(_)));
    }

    #[test]
    fn mock_convert_writes_planned_dimensions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = tmp.path().join("out.jpg");
        let backend = MockBackend::new();
        let plan = ConvertPlan {
            crop: Rect {
                x: 0,
                y: 0,
                width: 400,
                height: 300,
            },
            width: 200,
            height: 150,
            rotation: Rotation::Cw90,
            color: ColorMode::Gray,
            encoding: Encoding::Png,
        };

        backend
            .convert(
                &Dimensions {
                    width: 400,
                    height: 300,
                },
                &output,
                &plan,
            )
            .unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "150x200");
        assert_eq!(backend.convert_count(), 1);
    }
}
