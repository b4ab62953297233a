//! Content-addressed raster cache layout.
//!
//! Every cached file lives under a directory derived from the SHA-256 of its
//! cache key, sharded four levels deep so that no single directory grows
//! with the size of the collection:
//!
//! ```text
//! {root}/{d[0:2]}/{d[2:4]}/{d[4:6]}/{d[6:8]}/{d}/
//! ├── standard/
//! │   ├── base.png
//! │   └── iiif/{region}/{size}/{rotation}/{quality}.{format}
//! ├── limited/
//! │   └── ...
//! └── featured/
//!     └── ...
//! ```
//!
//! The layout is an on-disk compatibility contract: paths are a pure
//! function of `(key, base type, options)` and are never stored. The cache
//! key is a resource's identifier, or its placeholder locator for
//! placeholder-backed resources (see [`Resource::cache_key`]).
//!
//! Hash collisions between distinct keys are not mitigated.
//!
//! [`Resource::cache_key`]: crate::resource::Resource::cache_key

use crate::iiif::{BASE_IMAGE_FORMAT, BaseType, RasterOpts};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::PathBuf;

/// SHA-256 of a cache key, returned as a hex string.
pub fn hash_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// Resolves cache keys and raster options to paths under one root.
#[derive(Debug, Clone)]
pub struct RasterCache {
    root: PathBuf,
}

impl RasterCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding everything cached for `key`.
    pub fn cache_directory(&self, key: &str) -> PathBuf {
        let digest = hash_key(key);
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(&digest[4..6])
            .join(&digest[6..8])
            .join(&digest)
    }

    /// Root of the IIIF derivative tree for one base type.
    pub fn iiif_directory(&self, base_type: BaseType, key: &str) -> PathBuf {
        self.cache_directory(key).join(base_type.as_str()).join("iiif")
    }

    pub fn raster_path(&self, base_type: BaseType, key: &str, opts: &RasterOpts) -> PathBuf {
        self.iiif_directory(base_type, key)
            .join(&opts.region)
            .join(&opts.size)
            .join(opts.rotation.to_string())
            .join(format!("{}.{}", opts.quality, opts.format))
    }

    /// Path of the unmodified base render for one base type.
    pub fn base_path(&self, base_type: BaseType, key: &str) -> PathBuf {
        self.cache_directory(key)
            .join(base_type.as_str())
            .join(format!("base.{BASE_IMAGE_FORMAT}"))
    }

    pub fn raster_exists(&self, base_type: BaseType, key: &str, opts: &RasterOpts) -> bool {
        self.raster_path(base_type, key, opts).exists()
    }

    /// Remove the whole cache subtree for `key`.
    ///
    /// Returns `false` if there was nothing to remove.
    pub fn purge(&self, key: &str) -> io::Result<bool> {
        let dir = self.cache_directory(key);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Summary of cache activity for a pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub generated: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn generate(&mut self) {
        self.generated += 1;
    }

    pub fn total(&self) -> u32 {
        self.hits + self.generated
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(
                f,
                "{} cached, {} generated ({} total)",
                self.hits,
                self.generated,
                self.total()
            )
        } else {
            write!(f, "{} generated", self.generated)
        }
    }
}
