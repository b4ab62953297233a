//! Writing rasters into the cache.
//!
//! [`RasterGenerator`] turns a source file (or an already-decoded image) plus
//! a set of [`RasterOpts`] into exactly one output file. Files are rendered to
//! a temporary sibling and moved into place with a no-clobber rename, so a
//! reader never observes a partially written raster, and two writers racing
//! on the same destination cannot both succeed.

use crate::iiif::RasterOpts;
use crate::imaging::{BackendError, Dimensions, ImageBackend, JpegQuality, RenderError, render};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("Raster already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

pub struct RasterGenerator<'a, B: ImageBackend> {
    backend: &'a B,
    jpeg_quality: JpegQuality,
}

impl<'a, B: ImageBackend> RasterGenerator<'a, B> {
    pub fn new(backend: &'a B, jpeg_quality: JpegQuality) -> Self {
        Self {
            backend,
            jpeg_quality,
        }
    }

    pub fn backend(&self) -> &'a B {
        self.backend
    }

    /// Decode `source` and write one raster to `dest`.
    ///
    /// Fails with [`RasterError::AlreadyExists`] without decoding anything
    /// when `dest` is already present.
    pub fn generate(
        &self,
        source: &Path,
        dest: &Path,
        opts: &RasterOpts,
    ) -> Result<Dimensions, RasterError> {
        if dest.exists() {
            return Err(RasterError::AlreadyExists(dest.to_path_buf()));
        }
        let image = self.backend.decode(source)?;
        self.generate_from(&image, dest, opts)
    }

    /// Write one raster to `dest` from an already-decoded image.
    pub fn generate_from(
        &self,
        image: &B::Image,
        dest: &Path,
        opts: &RasterOpts,
    ) -> Result<Dimensions, RasterError> {
        if dest.exists() {
            return Err(RasterError::AlreadyExists(dest.to_path_buf()));
        }
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let staged = tempfile::Builder::new()
            .prefix(".partial-")
            .suffix(&format!(".{}", opts.format))
            .tempfile_in(parent)?
            .into_temp_path();
        let dims = render(self.backend, image, &staged, opts, self.jpeg_quality)?;

        staged.persist_noclobber(dest).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                RasterError::AlreadyExists(dest.to_path_buf())
            } else {
                RasterError::Io(e.error)
            }
        })?;

        debug!(path = %dest.display(), %opts, %dims, "Wrote raster");
        Ok(dims)
    }

    /// Render into `tmp_dir` without touching the cache.
    ///
    /// The file is removed when the returned handle is dropped.
    pub fn generate_temporary(
        &self,
        source: &Path,
        tmp_dir: &Path,
        opts: &RasterOpts,
    ) -> Result<TempPath, RasterError> {
        let image = self.backend.decode(source)?;
        std::fs::create_dir_all(tmp_dir)?;
        let out = tempfile::Builder::new()
            .prefix("raster-")
            .suffix(&format!(".{}", opts.format))
            .tempfile_in(tmp_dir)?
            .into_temp_path();
        render(self.backend, &image, &out, opts, self.jpeg_quality)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::MockBackend;
    use crate::test_helpers::write_mock_image;
    use std::fs;
    use tempfile::TempDir;

    fn generator(backend: &MockBackend) -> RasterGenerator<'_, MockBackend> {
        RasterGenerator::new(backend, JpegQuality::default())
    }

    #[test]
    fn generate_creates_missing_parents() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("master.tif");
        write_mock_image(&source, 1000, 500);
        let dest = tmp.path().join("a/b/c/color.jpg");

        let backend = MockBackend::new();
        let dims = generator(&backend)
            .generate(&source, &dest, &RasterOpts::bounded(100))
            .unwrap();

        assert_eq!(
            dims,
            Dimensions {
                width: 100,
                height: 50
            }
        );
        assert_eq!(fs::read_to_string(&dest).unwrap(), "100x50");
    }

    #[test]
    fn generate_refuses_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("master.tif");
        write_mock_image(&source, 1000, 500);
        let dest = tmp.path().join("color.jpg");
        fs::write(&dest, "original").unwrap();

        let backend = MockBackend::new();
        let err = generator(&backend)
            .generate(&source, &dest, &RasterOpts::bounded(100))
            .unwrap_err();

        assert!(matches!(err, RasterError::AlreadyExists(p) if p == dest));
        assert_eq!(fs::read_to_string(&dest).unwrap(), "original");
        // Nothing was decoded
        assert!(backend.get_operations().is_empty());
    }

    #[test]
    fn generate_leaves_no_staging_files() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("master.tif");
        write_mock_image(&source, 300, 300);
        let out_dir = tmp.path().join("out");
        let dest = out_dir.join("color.jpg");

        let backend = MockBackend::new();
        generator(&backend)
            .generate(&source, &dest, &RasterOpts::bounded(64))
            .unwrap();

        let names: Vec<_> = fs::read_dir(&out_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("color.jpg")]);
    }

    #[test]
    fn generate_reports_unreadable_source() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("broken.tif");
        fs::write(&source, "garbage").unwrap();

        let backend = MockBackend::new();
        let err = generator(&backend)
            .generate(&source, &tmp.path().join("x.jpg"), &RasterOpts::base())
            .unwrap_err();
        assert!(matches!(err, RasterError::Backend(_)));
    }

    #[test]
    fn generate_from_reuses_decoded_image() {
        let tmp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let image = Dimensions {
            width: 2048,
            height: 1024,
        };

        let g = generator(&backend);
        for size in [128, 256] {
            let dest = tmp.path().join(format!("{size}.jpg"));
            g.generate_from(&image, &dest, &RasterOpts::bounded(size))
                .unwrap();
        }
        assert_eq!(backend.convert_count(), 2);
    }

    #[test]
    fn invalid_options_fail_before_writing() {
        let tmp = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let image = Dimensions {
            width: 100,
            height: 100,
        };
        let dest = tmp.path().join("out/bad.jpg");
        let opts = RasterOpts::new("500,500,10,10", "full", 0, "color", "jpg");

        let err = generator(&backend)
            .generate_from(&image, &dest, &opts)
            .unwrap_err();
        assert!(matches!(err, RasterError::Render(RenderError::Plan(_))));
        assert!(!dest.exists());
    }

    #[test]
    fn temporary_raster_is_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("master.tif");
        write_mock_image(&source, 400, 200);

        let backend = MockBackend::new();
        let out = generator(&backend)
            .generate_temporary(&source, &tmp.path().join("scratch"), &RasterOpts::bounded(40))
            .unwrap();
        let path = out.to_path_buf();
        assert_eq!(fs::read_to_string(&path).unwrap(), "40x20");
        assert!(path.to_string_lossy().ends_with(".jpg"));

        drop(out);
        assert!(!path.exists());
    }
}
