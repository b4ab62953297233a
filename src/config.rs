//! Cache configuration.
//!
//! Loaded from a single TOML file, merged over stock defaults, then checked
//! once. Every problem found is reported together, so a broken deployment
//! config can be fixed in one pass.
//!
//! ## Configuration Options
//!
//! ```toml
//! tmp_directory = "/tmp"               # Uncached rasters (default: OS temp dir)
//!
//! [raster_cache]
//! directory = "/var/cache/iiif"        # Required
//! on_miss = "generate_and_cache"       # Required: generate_and_cache |
//!                                      #   generate_and_do_not_cache | error
//! access_stats_enabled = false
//!
//! [lock]
//! directory = "/var/cache/iiif/.locks" # Default: {raster_cache.directory}/.locks
//! timeout = 30.0                       # Lease TTL in seconds, required
//! retry_count = 10                     # Required
//! retry_delay = 0.5                    # Seconds, required
//! retry_jitter = 0.05                  # Seconds
//! key_prefix = ""
//!
//! [sources]
//! root = "."                           # Base for root:// locators
//! placeholder_directory = "placeholders"
//!
//! [derivatives]
//! limited_base_size = 768
//! featured_base_size = 768
//! recommended_sizes = [256, 768, 1280]
//! recommended_limited_sizes = [256, 768]
//! pre_generated_featured_sizes = [256]
//! tile_size = 512
//! jpeg_quality = 90
//!
//! [store]
//! directory = "resources"
//!
//! [processing]
//! max_processes = 4                    # Omit for auto = CPU cores
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::iiif::BaseType;
use crate::imaging::JpegQuality;
use crate::lock::LockSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// What a request does when its raster is not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMiss {
    GenerateAndCache,
    GenerateAndDoNotCache,
    Error,
}

impl OnMiss {
    pub fn as_str(self) -> &'static str {
        match self {
            OnMiss::GenerateAndCache => "generate_and_cache",
            OnMiss::GenerateAndDoNotCache => "generate_and_do_not_cache",
            OnMiss::Error => "error",
        }
    }
}

impl fmt::Display for OnMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// File layer: what the TOML may contain
// =============================================================================

/// Raw contents of the config file. Required values are `Option` here and
/// checked by [`ConfigFile::into_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmp_directory: Option<PathBuf>,
    pub raster_cache: RasterCacheFile,
    pub lock: LockFile,
    pub sources: SourcesConfig,
    pub derivatives: DerivativesConfig,
    pub store: StoreConfig,
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RasterCacheFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_miss: Option<OnMiss>,
    pub access_stats_enabled: bool,
}

/// Lock settings as written, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<f64>,
    pub retry_jitter: f64,
    pub key_prefix: String,
}

impl Default for LockFile {
    fn default() -> Self {
        Self {
            directory: None,
            timeout: None,
            retry_count: None,
            retry_delay: None,
            retry_jitter: 0.05,
            key_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourcesConfig {
    /// Base directory for `root://` locators.
    pub root: PathBuf,
    /// Directory of `{name}.png` placeholder images.
    pub placeholder_directory: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            placeholder_directory: PathBuf::from("placeholders"),
        }
    }
}

/// What the pipeline pre-generates for each ready resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DerivativesConfig {
    /// Long side of the `limited` base.
    pub limited_base_size: u32,
    /// Long side of the `featured` base.
    pub featured_base_size: u32,
    /// `!s,s` sizes cut from the standard base; also the `sizes` in image info.
    pub recommended_sizes: Vec<u32>,
    pub recommended_limited_sizes: Vec<u32>,
    pub pre_generated_featured_sizes: Vec<u32>,
    pub tile_size: u32,
    pub jpeg_quality: u32,
}

impl Default for DerivativesConfig {
    fn default() -> Self {
        Self {
            limited_base_size: 768,
            featured_base_size: 768,
            recommended_sizes: vec![256, 768, 1280],
            recommended_limited_sizes: vec![256, 768],
            pre_generated_featured_sizes: vec![256],
            tile_size: 512,
            jpeg_quality: 90,
        }
    }
}

impl DerivativesConfig {
    /// Pre-generated `!s,s` sizes for one base type.
    pub fn sizes_for(&self, base_type: BaseType) -> &[u32] {
        match base_type {
            BaseType::Standard => &self.recommended_sizes,
            BaseType::Limited => &self.recommended_limited_sizes,
            BaseType::Featured => &self.pre_generated_featured_sizes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory of the JSON resource store used by the CLI.
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("resources"),
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel pipeline workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.clamp(1, cores)).unwrap_or(cores)
}

// =============================================================================
// Validated layer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tmp_directory: PathBuf,
    pub raster_cache: RasterCacheConfig,
    pub lock: LockConfig,
    pub sources: SourcesConfig,
    pub derivatives: DerivativesConfig,
    pub store: StoreConfig,
    pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterCacheConfig {
    pub directory: PathBuf,
    pub on_miss: OnMiss,
    pub access_stats_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    pub directory: PathBuf,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    pub key_prefix: String,
}

impl Config {
    /// A config with stock settings around the given cache directory.
    pub fn with_cache_directory(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            tmp_directory: std::env::temp_dir(),
            lock: LockConfig {
                directory: directory.join(".locks"),
                timeout: Duration::from_secs(30),
                retry_count: 10,
                retry_delay: Duration::from_millis(500),
                retry_jitter: Duration::from_millis(50),
                key_prefix: String::new(),
            },
            raster_cache: RasterCacheConfig {
                directory,
                on_miss: OnMiss::GenerateAndCache,
                access_stats_enabled: false,
            },
            sources: SourcesConfig::default(),
            derivatives: DerivativesConfig::default(),
            store: StoreConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings::new(self.lock.timeout, self.lock.retry_count, self.lock.retry_delay)
            .with_jitter(self.lock.retry_jitter)
            .with_key_prefix(self.lock.key_prefix.clone())
    }

    pub fn jpeg_quality(&self) -> JpegQuality {
        JpegQuality::new(self.derivatives.jpeg_quality)
    }
}

/// Seconds to a `Duration`, recording a problem for negative or non-finite
/// values.
fn seconds(field: &str, value: f64, problems: &mut Vec<String>) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_else(|_| {
        problems.push(format!("{field} must be a non-negative number of seconds"));
        Duration::ZERO
    })
}

impl ConfigFile {
    /// Check required values and ranges, converting to a [`Config`].
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let mut problems = Vec::new();
        let mut required = |field: &str, present: bool| {
            if !present {
                problems.push(format!("{field} is required"));
            }
        };
        required("raster_cache.directory", self.raster_cache.directory.is_some());
        required("raster_cache.on_miss", self.raster_cache.on_miss.is_some());
        required("lock.timeout", self.lock.timeout.is_some());
        required("lock.retry_count", self.lock.retry_count.is_some());
        required("lock.retry_delay", self.lock.retry_delay.is_some());

        let timeout = self
            .lock
            .timeout
            .map(|t| seconds("lock.timeout", t, &mut problems));
        if timeout.is_some_and(|t| t.is_zero()) {
            problems.push("lock.timeout must be greater than zero".into());
        }
        let retry_delay = self
            .lock
            .retry_delay
            .map(|d| seconds("lock.retry_delay", d, &mut problems))
            .unwrap_or_default();
        let retry_jitter = seconds("lock.retry_jitter", self.lock.retry_jitter, &mut problems);

        let d = &self.derivatives;
        for (field, value) in [
            ("derivatives.limited_base_size", d.limited_base_size),
            ("derivatives.featured_base_size", d.featured_base_size),
            ("derivatives.tile_size", d.tile_size),
        ] {
            if value == 0 {
                problems.push(format!("{field} must be greater than zero"));
            }
        }
        for (field, sizes) in [
            ("derivatives.recommended_sizes", &d.recommended_sizes),
            ("derivatives.recommended_limited_sizes", &d.recommended_limited_sizes),
            ("derivatives.pre_generated_featured_sizes", &d.pre_generated_featured_sizes),
        ] {
            if sizes.contains(&0) {
                problems.push(format!("{field} must not contain 0"));
            }
        }
        if !(1..=100).contains(&d.jpeg_quality) {
            problems.push("derivatives.jpeg_quality must be 1-100".into());
        }

        let (Some(directory), Some(on_miss), Some(timeout), Some(retry_count)) = (
            self.raster_cache.directory,
            self.raster_cache.on_miss,
            timeout,
            self.lock.retry_count,
        ) else {
            return Err(ConfigError::Invalid(problems));
        };
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        Ok(Config {
            tmp_directory: self.tmp_directory.unwrap_or_else(std::env::temp_dir),
            lock: LockConfig {
                directory: self
                    .lock
                    .directory
                    .unwrap_or_else(|| directory.join(".locks")),
                timeout,
                retry_count,
                retry_delay,
                retry_jitter,
                key_prefix: self.lock.key_prefix,
            },
            raster_cache: RasterCacheConfig {
                directory,
                on_miss,
                access_stats_enabled: self.raster_cache.access_stats_enabled,
            },
            sources: self.sources,
            derivatives: self.derivatives,
            store: self.store,
            processing: self.processing,
        })
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock defaults as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged on top of. Required
/// values have no default and are absent.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(ConfigFile::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file as a raw TOML value.
pub fn load_raw_config(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<Config, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let file: ConfigFile = merged.try_into()?;
    file.into_config()
}

/// Load and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    resolve_config(stock_defaults_value()?, Some(load_raw_config(path)?))
}

/// Returns a fully-commented config with every key and an explanation.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# IIIF Raster Cache Configuration
# ===============================
# Keys marked "required" have no default. Everything else is optional and
# shows its default value. Unknown keys cause an error.

# Directory for rasters generated with on_miss = "generate_and_do_not_cache".
# Defaults to the OS temp directory.
# tmp_directory = "/tmp"

# ---------------------------------------------------------------------------
# Raster cache
# ---------------------------------------------------------------------------
[raster_cache]
# Root of the content-addressed cache tree (required).
directory = "cache"

# What a request does when its raster is not cached (required):
#   generate_and_cache         render under the lock and keep the result
#   generate_and_do_not_cache  render to a temporary file, serve, delete
#   error                      report not found (advertises IIIF level0)
on_miss = "generate_and_cache"

# Record accessed identifiers in the access-stat set.
access_stats_enabled = false

# ---------------------------------------------------------------------------
# Generation lock
# ---------------------------------------------------------------------------
[lock]
# Shared lease directory. Every process writing to the same cache must use
# the same directory. Defaults to {raster_cache.directory}/.locks.
# directory = "cache/.locks"

# Lease lifetime in seconds (required).
timeout = 30.0

# Retries after the first attempt before giving up (required).
retry_count = 10

# Wait between attempts in seconds (required).
retry_delay = 0.5

# Upper bound of the random extra wait per retry, in seconds.
retry_jitter = 0.05

# Prepended to every lock key.
key_prefix = ""

# ---------------------------------------------------------------------------
# Sources
# ---------------------------------------------------------------------------
[sources]
# Base directory for root:// source locators.
root = "."

# Directory holding {name}.png placeholder images.
placeholder_directory = "placeholders"

# ---------------------------------------------------------------------------
# Pre-generated derivatives
# ---------------------------------------------------------------------------
[derivatives]
# Long side of the limited and featured base renders.
limited_base_size = 768
featured_base_size = 768

# Best-fit sizes cut from each base after it is rendered.
recommended_sizes = [256, 768, 1280]
recommended_limited_sizes = [256, 768]
pre_generated_featured_sizes = [256]

# Tile edge length for the standard and limited tile pyramids.
tile_size = 512

# JPEG encoding quality (1 = worst, 100 = best).
jpeg_quality = 90

# ---------------------------------------------------------------------------
# Resource store
# ---------------------------------------------------------------------------
[store]
# Directory of JSON resource records used by the CLI.
directory = "resources"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel pipeline workers.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4
"##
}
