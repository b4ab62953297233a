//! Request-time raster serving.
//!
//! [`RasterService`] ties the pieces together for one request:
//!
//! ```text
//! request ─▶ normalize ─▶ fallback probes ─▶ hit ──────────────▶ Cached(path)
//!                                        └─▶ miss ─▶ on_miss policy
//!                                                   ├─ generate_and_cache ─▶ lock, recheck, render ─▶ Cached
//!                                                   ├─ generate_and_do_not_cache ─▶ Temporary
//!                                                   └─ error ─▶ NotFound
//! ```
//!
//! Every write into the cache, from requests and from the pipeline alike,
//! goes through [`RasterService::ensure_cached`]: check, take the lock keyed
//! on the destination path, check again, render.

use crate::access::AccessStatCache;
use crate::cache::RasterCache;
use crate::config::{Config, DerivativesConfig, OnMiss};
use crate::fallback::resolve_with_fallback;
use crate::iiif::{
    self, BaseType, ComplianceLevel, ImageInfo, NormalizeError, PlanError, RasterOpts,
    UnknownBaseType, normalize,
};
use crate::imaging::ImageBackend;
use crate::lock::{BlockingLock, FileLocker, LockError, Locker};
use crate::raster::{RasterError, RasterGenerator};
use crate::resource::{Resource, UNAVAILABLE_PLACEHOLDER};
use crate::source::{SourceError, SourceResolver};
use crate::store::{ResourceStore, StoreError};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    UnknownBaseType(#[from] UnknownBaseType),
    #[error("Resource {identifier} is missing {}", .fields.join(", "))]
    MissingBaseDependency {
        identifier: String,
        fields: Vec<&'static str>,
    },
    #[error("No {base_type} dimensions recorded for {identifier}")]
    MissingDimensions {
        identifier: String,
        base_type: BaseType,
    },
}

impl ServiceError {
    /// Worth retrying: the cache was busy, not broken.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Lock(LockError::Timeout { .. }))
    }
}

/// How an identifier resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Resource),
    /// A `placeholder:<name>` identifier backed by a placeholder image.
    Placeholder(Resource),
    /// Unknown identifier; serve this placeholder instead.
    Redirect(String),
    /// An unknown placeholder identifier. Nothing to redirect to.
    Missing,
}

#[derive(Debug)]
pub enum RasterResponse {
    Cached(PathBuf),
    /// Rendered outside the cache; deleted when dropped.
    Temporary(TempPath),
    /// Resource not ready; serve this placeholder identifier instead.
    Redirect(String),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// Already present, possibly written by someone else while we waited.
    Cached,
    Generated,
}

pub struct RasterService<'a, B: ImageBackend> {
    cache: RasterCache,
    generator: RasterGenerator<'a, B>,
    lock: BlockingLock,
    sources: SourceResolver,
    access: AccessStatCache,
    derivatives: DerivativesConfig,
    on_miss: OnMiss,
    access_stats_enabled: bool,
    tmp_directory: PathBuf,
}

impl<'a, B: ImageBackend> RasterService<'a, B> {
    /// Service with the production [`FileLocker`] in `lock.directory`.
    pub fn from_config(config: &Config, backend: &'a B) -> Self {
        Self::new(
            config,
            backend,
            Box::new(FileLocker::new(&config.lock.directory)),
        )
    }

    pub fn new(config: &Config, backend: &'a B, locker: Box<dyn Locker>) -> Self {
        Self {
            cache: RasterCache::new(&config.raster_cache.directory),
            generator: RasterGenerator::new(backend, config.jpeg_quality()),
            lock: BlockingLock::new(locker, config.lock_settings()),
            sources: SourceResolver::new(
                &config.sources.root,
                &config.sources.placeholder_directory,
            ),
            access: AccessStatCache::new(),
            derivatives: config.derivatives.clone(),
            on_miss: config.raster_cache.on_miss,
            access_stats_enabled: config.raster_cache.access_stats_enabled,
            tmp_directory: config.tmp_directory.clone(),
        }
    }

    pub fn cache(&self) -> &RasterCache {
        &self.cache
    }

    pub fn generator(&self) -> &RasterGenerator<'a, B> {
        &self.generator
    }

    pub fn backend(&self) -> &'a B {
        self.generator.backend()
    }

    pub fn sources(&self) -> &SourceResolver {
        &self.sources
    }

    pub fn access_stats(&self) -> &AccessStatCache {
        &self.access
    }

    pub fn derivatives(&self) -> &DerivativesConfig {
        &self.derivatives
    }

    pub fn resolve_resource(
        &self,
        store: &dyn ResourceStore,
        identifier: &str,
    ) -> Result<Lookup, ServiceError> {
        if let Some(resource) = store.get(identifier)? {
            return Ok(Lookup::Found(resource));
        }
        if let Some(resource) = self
            .sources
            .placeholder_resource(identifier, self.backend())?
        {
            return Ok(Lookup::Placeholder(resource));
        }
        if identifier.starts_with("placeholder:") {
            return Ok(Lookup::Missing);
        }
        debug!(identifier, "Unknown identifier, redirecting");
        Ok(Lookup::Redirect(UNAVAILABLE_PLACEHOLDER.to_string()))
    }

    /// Serve one raster request.
    #[instrument(
        skip(self, resource, original),
        fields(identifier = %resource.identifier, %base_type, request = %original)
    )]
    pub fn fetch(
        &self,
        resource: &Resource,
        base_type: BaseType,
        original: &RasterOpts,
    ) -> Result<RasterResponse, ServiceError> {
        if self.access_stats_enabled {
            self.access.add(&resource.identifier);
        }
        if !resource.is_ready() {
            let target = resource.placeholder_identifier();
            debug!(status = %resource.status, redirect = target, "Resource not ready");
            return Ok(RasterResponse::Redirect(target.to_string()));
        }

        let normalized = normalize(resource, original)?;
        let key = resource.cache_key();
        let found = resolve_with_fallback(original, &normalized, |opts| {
            self.cache.raster_exists(base_type, &key, opts)
        });
        if found.hit {
            return Ok(RasterResponse::Cached(
                self.cache.raster_path(base_type, &key, &found.opts),
            ));
        }

        let policy = if resource.is_placeholder_backed() {
            OnMiss::GenerateAndCache
        } else {
            self.on_miss
        };
        debug!(opts = %normalized, %policy, "Cache miss");
        match policy {
            OnMiss::GenerateAndCache => {
                let (path, _) = self.ensure_raster(resource, base_type, &normalized)?;
                Ok(RasterResponse::Cached(path))
            }
            OnMiss::GenerateAndDoNotCache => Ok(RasterResponse::Temporary(
                self.render_temporary(resource, base_type, &normalized)?,
            )),
            OnMiss::Error => Ok(RasterResponse::NotFound),
        }
    }

    /// Double-checked write of `dest`.
    ///
    /// `render` runs at most once, under the lock, and only if `dest` is
    /// still missing after the lock is taken.
    pub fn ensure_cached<F>(&self, dest: &Path, render: F) -> Result<Ensured, ServiceError>
    where
        F: FnOnce() -> Result<(), ServiceError>,
    {
        if dest.exists() {
            return Ok(Ensured::Cached);
        }
        let key = dest.to_string_lossy();
        self.lock.with_blocking_lock(&key, || {
            if dest.exists() {
                debug!(path = %dest.display(), "Written while waiting for lock");
                return Ok(Ensured::Cached);
            }
            match render() {
                Ok(()) => Ok(Ensured::Generated),
                Err(ServiceError::Raster(RasterError::AlreadyExists(_))) => Ok(Ensured::Cached),
                Err(e) => Err(e),
            }
        })
    }

    /// Make sure the base render for `base_type` exists.
    pub fn ensure_base(
        &self,
        resource: &Resource,
        base_type: BaseType,
    ) -> Result<(PathBuf, Ensured), ServiceError> {
        let dest = self.cache.base_path(base_type, &resource.cache_key());
        let ensured = self.ensure_cached(&dest, || {
            let opts = self.base_opts(resource, base_type)?;
            let source = self.source_path(resource)?;
            self.generator.generate(&source, &dest, &opts)?;
            Ok(())
        })?;
        if ensured == Ensured::Generated {
            info!(identifier = %resource.identifier, %base_type, "Generated base");
        }
        Ok((dest, ensured))
    }

    /// Make sure one derivative exists, rendering its base first if needed.
    pub fn ensure_raster(
        &self,
        resource: &Resource,
        base_type: BaseType,
        opts: &RasterOpts,
    ) -> Result<(PathBuf, Ensured), ServiceError> {
        let dest = self
            .cache
            .raster_path(base_type, &resource.cache_key(), opts);
        if dest.exists() {
            return Ok((dest, Ensured::Cached));
        }
        let (base, _) = self.ensure_base(resource, base_type)?;
        let ensured = self.ensure_cached(&dest, || {
            self.generator.generate(&base, &dest, opts)?;
            Ok(())
        })?;
        Ok((dest, ensured))
    }

    /// Options that produce the base render of `base_type` from the source.
    pub fn base_opts(
        &self,
        resource: &Resource,
        base_type: BaseType,
    ) -> Result<RasterOpts, ServiceError> {
        let bounded = |n: u32| RasterOpts::base().with_size(format!("!{n},{n}"));
        match base_type {
            BaseType::Standard => Ok(RasterOpts::base()),
            BaseType::Limited => Ok(bounded(self.derivatives.limited_base_size)),
            BaseType::Featured => {
                let region = resource.featured_region.ok_or_else(|| {
                    ServiceError::MissingBaseDependency {
                        identifier: resource.identifier.clone(),
                        fields: vec!["featured_region"],
                    }
                })?;
                Ok(bounded(self.derivatives.featured_base_size).with_region(region.to_string()))
            }
        }
    }

    fn source_path(&self, resource: &Resource) -> Result<PathBuf, ServiceError> {
        let source = resource
            .source
            .as_ref()
            .ok_or_else(|| ServiceError::MissingBaseDependency {
                identifier: resource.identifier.clone(),
                fields: vec!["source"],
            })?;
        Ok(self.sources.resolve(source)?)
    }

    /// Render without writing to the cache. A missing base is rendered to a
    /// temporary file too.
    fn render_temporary(
        &self,
        resource: &Resource,
        base_type: BaseType,
        opts: &RasterOpts,
    ) -> Result<TempPath, ServiceError> {
        let cached_base = self.cache.base_path(base_type, &resource.cache_key());
        if cached_base.exists() {
            return Ok(self
                .generator
                .generate_temporary(&cached_base, &self.tmp_directory, opts)?);
        }
        let source = self.source_path(resource)?;
        let base = self.generator.generate_temporary(
            &source,
            &self.tmp_directory,
            &self.base_opts(resource, base_type)?,
        )?;
        Ok(self
            .generator
            .generate_temporary(&base, &self.tmp_directory, opts)?)
    }

    /// Numbers for the `info.json` of one base type.
    pub fn image_info(
        &self,
        resource: &Resource,
        base_type: BaseType,
    ) -> Result<ImageInfo, ServiceError> {
        let dims = resource.dimensions.get(base_type).ok_or_else(|| {
            ServiceError::MissingDimensions {
                identifier: resource.identifier.clone(),
                base_type,
            }
        })?;
        let compliance = match self.on_miss {
            OnMiss::Error => ComplianceLevel::Level0,
            _ => ComplianceLevel::Level1,
        };
        Ok(iiif::image_info(
            dims,
            self.derivatives.sizes_for(base_type),
            self.derivatives.tile_size,
            compliance,
        )?)
    }
}
