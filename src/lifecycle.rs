//! Creating, updating, and deleting resources.
//!
//! Any write that changes what a resource renders to (source, featured
//! region, content type) drops the resource's cached derivatives, sends it
//! back to `pending`, and queues a pipeline job for it.

use crate::cache::RasterCache;
use crate::imaging::{BackendError, Dimensions, ImageBackend};
use crate::resource::{Resource, ResourceUpdate, Status};
use crate::source::{SourceError, SourceResolver};
use crate::store::{ResourceStore, StoreError};
use std::io;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
#[error("Could not enqueue {identifier}: {reason}")]
pub struct EnqueueError {
    pub identifier: String,
    pub reason: String,
}

/// Hands a pipeline job for one identifier to whatever runs jobs.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, identifier: &str) -> Result<(), EnqueueError>;
}

/// Queue that only records what was enqueued. The CLI drains it inline.
#[derive(Debug, Default)]
pub struct VecQueue {
    jobs: Mutex<Vec<String>>,
}

impl VecQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<String> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl JobQueue for VecQueue {
    fn enqueue(&self, identifier: &str) -> Result<(), EnqueueError> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(identifier.to_string());
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid resource: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("Resource {0} disappeared during the update")]
    Vanished(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Cache IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    pub resource: Resource,
    pub created: bool,
}

pub struct Lifecycle<'a, B: ImageBackend> {
    store: &'a dyn ResourceStore,
    cache: &'a RasterCache,
    sources: &'a SourceResolver,
    backend: &'a B,
    queue: &'a dyn JobQueue,
}

impl<'a, B: ImageBackend> Lifecycle<'a, B> {
    pub fn new(
        store: &'a dyn ResourceStore,
        cache: &'a RasterCache,
        sources: &'a SourceResolver,
        backend: &'a B,
        queue: &'a dyn JobQueue,
    ) -> Self {
        Self {
            store,
            cache,
            sources,
            backend,
            queue,
        }
    }

    /// Create `identifier`, or apply `update` to the existing record.
    ///
    /// A new or changed source is identified up front so the featured region
    /// can be checked against it. Nothing is written if validation fails.
    pub fn create_or_update(
        &self,
        identifier: &str,
        update: ResourceUpdate,
    ) -> Result<Upsert, LifecycleError> {
        let existing = self.store.get(identifier)?;
        let created = existing.is_none();
        let mut resource = existing.unwrap_or_else(|| Resource::new(identifier));
        let changed = resource.apply(update.clone()) || created;

        let standard = if changed {
            resource.reset();
            let dims = self.identify_source(&resource)?;
            resource.dimensions.standard = dims;
            dims
        } else {
            resource.dimensions.standard
        };

        let problems = resource.validate();
        if !problems.is_empty() {
            return Err(LifecycleError::Invalid(problems));
        }

        let resource = if created {
            self.store.insert(resource.clone())?;
            info!(identifier, "Resource created");
            resource
        } else {
            if changed {
                // Keyed on the identifier only: placeholder-backed files are shared
                if self.cache.purge(identifier)? {
                    info!(identifier, "Purged cached derivatives");
                }
            }
            let updated = self
                .store
                .update(identifier, &mut |r| {
                    r.apply(update.clone());
                    if changed {
                        r.reset();
                        r.dimensions.standard = standard;
                    }
                    true
                })?
                .ok_or_else(|| LifecycleError::Vanished(identifier.to_string()))?;
            // A running job stops writing only once it sees the reset
            if changed && self.cache.purge(identifier)? {
                info!(identifier, "Purged derivatives written during the update");
            }
            updated
        };

        if resource.status == Status::Pending && resource.source.is_some() {
            self.queue.enqueue(identifier)?;
            debug!(identifier, "Pipeline job enqueued");
        }
        Ok(Upsert { resource, created })
    }

    /// Remove the record and everything cached for it.
    ///
    /// Returns `false` if there was no record.
    pub fn delete(&self, identifier: &str) -> Result<bool, LifecycleError> {
        let existed = self.store.delete(identifier)?;
        if self.cache.purge(identifier)? {
            info!(identifier, "Purged cached derivatives");
        }
        Ok(existed)
    }

    fn identify_source(&self, resource: &Resource) -> Result<Option<Dimensions>, LifecycleError> {
        let Some(source) = &resource.source else {
            return Ok(None);
        };
        let path = self.sources.resolve(source)?;
        Ok(Some(self.backend.identify(&path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iiif::{BaseType, RasterOpts};
    use crate::imaging::backend::tests::MockBackend;
    use crate::resource::{FeaturedRegion, SourceLocator};
    use crate::store::MemoryStore;
    use crate::test_helpers::write_mock_image;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: MemoryStore,
        cache: RasterCache,
        sources: SourceResolver,
        backend: MockBackend,
        queue: VecQueue,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            write_mock_image(&tmp.path().join("sources/a.tif"), 1000, 800);
            write_mock_image(&tmp.path().join("sources/b.tif"), 400, 300);
            let cache = RasterCache::new(tmp.path().join("cache"));
            let sources = SourceResolver::new(
                tmp.path().join("sources"),
                tmp.path().join("placeholders"),
            );
            Self {
                _tmp: tmp,
                store: MemoryStore::new(),
                cache,
                sources,
                backend: MockBackend::new(),
                queue: VecQueue::new(),
            }
        }

        fn lifecycle(&self) -> Lifecycle<'_, MockBackend> {
            Lifecycle::new(
                &self.store,
                &self.cache,
                &self.sources,
                &self.backend,
                &self.queue,
            )
        }

        /// Put a file where a derivative of `key` would be cached.
        fn seed_cache(&self, key: &str) -> std::path::PathBuf {
            let path = self
                .cache
                .raster_path(BaseType::Standard, key, &RasterOpts::bounded(256));
            write_mock_image(&path, 256, 205);
            path
        }
    }

    fn with_source(rel: &str) -> ResourceUpdate {
        ResourceUpdate {
            source: Some(SourceLocator::Root(rel.into())),
            featured_region: Some(FeaturedRegion::new(0, 0, 200, 200)),
            ..ResourceUpdate::default()
        }
    }

    #[test]
    fn create_identifies_source_and_enqueues() {
        let f = Fixture::new();
        let upsert = f.lifecycle().create_or_update("cul:1", with_source("a.tif")).unwrap();

        assert!(upsert.created);
        assert_eq!(upsert.resource.status, Status::Pending);
        assert_eq!(
            upsert.resource.dimensions.standard,
            Some(Dimensions {
                width: 1000,
                height: 800
            })
        );
        assert_eq!(f.queue.jobs(), vec!["cul:1"]);
        assert!(f.store.get("cul:1").unwrap().is_some());
    }

    #[test]
    fn create_without_source_is_not_enqueued() {
        let f = Fixture::new();
        let upsert = f
            .lifecycle()
            .create_or_update("cul:1", ResourceUpdate::default())
            .unwrap();
        assert!(upsert.created);
        assert!(f.queue.jobs().is_empty());
    }

    #[test]
    fn source_change_purges_and_resets() {
        let f = Fixture::new();
        let lifecycle = f.lifecycle();
        lifecycle.create_or_update("cul:1", with_source("a.tif")).unwrap();
        f.store
            .update("cul:1", &mut |r| {
                r.status = Status::Ready;
                true
            })
            .unwrap();
        let cached = f.seed_cache("cul:1");
        let other = f.seed_cache("cul:2");
        f.queue.drain();

        let upsert = lifecycle.create_or_update("cul:1", with_source("b.tif")).unwrap();
        assert!(!upsert.created);
        assert_eq!(upsert.resource.status, Status::Pending);
        assert_eq!(
            upsert.resource.dimensions.standard,
            Some(Dimensions {
                width: 400,
                height: 300
            })
        );
        assert!(!cached.exists());
        assert!(other.exists());
        assert_eq!(f.queue.jobs(), vec!["cul:1"]);
    }

    #[test]
    fn view_limitation_change_keeps_cache() {
        let f = Fixture::new();
        let lifecycle = f.lifecycle();
        lifecycle.create_or_update("cul:1", with_source("a.tif")).unwrap();
        f.store
            .update("cul:1", &mut |r| {
                r.status = Status::Ready;
                true
            })
            .unwrap();
        let cached = f.seed_cache("cul:1");
        f.queue.drain();

        let update = ResourceUpdate {
            has_view_limitation: Some(true),
            ..ResourceUpdate::default()
        };
        let upsert = lifecycle.create_or_update("cul:1", update).unwrap();
        assert!(upsert.resource.has_view_limitation);
        assert_eq!(upsert.resource.status, Status::Ready);
        assert!(cached.exists());
        assert!(f.queue.jobs().is_empty());
    }

    #[test]
    fn region_outside_source_is_rejected() {
        let f = Fixture::new();
        let update = ResourceUpdate {
            featured_region: Some(FeaturedRegion::new(300, 0, 200, 200)),
            ..with_source("b.tif")
        };
        let err = f.lifecycle().create_or_update("cul:1", update).unwrap_err();
        assert!(matches!(&err, LifecycleError::Invalid(p) if p.len() == 1));
        assert!(f.store.get("cul:1").unwrap().is_none());
        assert!(f.queue.jobs().is_empty());
    }

    #[test]
    fn reserved_identifier_is_rejected() {
        let f = Fixture::new();
        let err = f
            .lifecycle()
            .create_or_update("placeholder:sound", ResourceUpdate::default())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Invalid(_)));
    }

    #[test]
    fn unreadable_source_is_rejected() {
        let f = Fixture::new();
        let err = f
            .lifecycle()
            .create_or_update("cul:1", with_source("missing.tif"))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Source(SourceError::Unreadable { .. })));
    }

    #[test]
    fn delete_removes_record_and_own_subtree_only() {
        let f = Fixture::new();
        let lifecycle = f.lifecycle();
        lifecycle.create_or_update("cul:1", with_source("a.tif")).unwrap();
        let cached = f.seed_cache("cul:1");
        let shared = f.seed_cache("placeholder://sound");

        assert!(lifecycle.delete("cul:1").unwrap());
        assert!(f.store.get("cul:1").unwrap().is_none());
        assert!(!cached.exists());
        assert!(shared.exists());
        assert!(!lifecycle.delete("cul:1").unwrap());
    }

    #[test]
    fn vec_queue_drain_empties() {
        let queue = VecQueue::new();
        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();
        assert_eq!(queue.drain(), vec!["a", "b"]);
        assert!(queue.jobs().is_empty());
    }
}
