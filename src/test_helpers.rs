//! Shared fixtures for the unit tests.
//!
//! Most tests run against [`MockBackend`](crate::imaging::backend::tests::MockBackend),
//! whose "images" are text files holding `WxH`. The helpers here build those
//! files, resources, and a complete config rooted in a temp directory.

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use crate::config::{Config, OnMiss};
use crate::resource::{FeaturedRegion, Resource, SourceLocator};

// =========================================================================
// Files
// =========================================================================

/// Write a mock source image, creating parent directories.
pub fn write_mock_image(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("{width}x{height}")).unwrap();
}

// =========================================================================
// Resources
// =========================================================================

/// A pending resource backed by an absolute-path source.
pub fn pending_resource(identifier: &str, source: &Path) -> Resource {
    let mut resource = Resource::new(identifier);
    resource.source = Some(SourceLocator::File(source.to_path_buf()));
    resource.featured_region = Some(FeaturedRegion::new(0, 0, 100, 100));
    resource
}

// =========================================================================
// Config
// =========================================================================

/// A config with every directory inside `tmp`, fast lock retries, and a
/// small derivative set.
pub fn test_config(tmp: &TempDir) -> Config {
    let root = tmp.path();
    let mut config = Config::with_cache_directory(root.join("cache"));
    config.tmp_directory = root.join("tmp");
    config.raster_cache.on_miss = OnMiss::GenerateAndCache;
    config.lock.directory = root.join("locks");
    config.lock.timeout = Duration::from_secs(30);
    config.lock.retry_count = 200;
    config.lock.retry_delay = Duration::from_millis(5);
    config.lock.retry_jitter = Duration::ZERO;
    config.sources.root = root.join("sources");
    config.sources.placeholder_directory = root.join("placeholders");
    config.derivatives.recommended_sizes = vec![256, 768];
    config.derivatives.recommended_limited_sizes = vec![256];
    config.derivatives.pre_generated_featured_sizes = vec![256];
    config.derivatives.tile_size = 512;
    config.store.directory = root.join("resources");
    config
}
