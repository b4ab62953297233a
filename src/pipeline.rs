//! Ahead-of-time derivative generation.
//!
//! One [`DerivativePipeline::run`] call is one job: it claims a pending
//! resource, renders its three bases, pre-generates the common sizes and
//! tile pyramids in parallel, then marks the resource ready.
//!
//! ```text
//! pending ──claim──▶ processing ──▶ standard / limited / featured base
//!                                      │  (dimensions recorded)
//!                                      ▼
//!                        par_iter: !s,s sizes + tiles per base
//!                                      │
//!                 ready ◀──────────────┴──────────────▶ failure (+ error_message)
//! ```
//!
//! A failure anywhere (including a panic inside a codec) is recorded on the
//! resource and then re-raised, so the job runner sees it too.
//!
//! A job re-reads its record before every render and stops once the record
//! leaves `processing` or its source, featured region, or type changes. If
//! the rendered inputs changed, it purges the subtree again on the way out,
//! so nothing it rendered from the old inputs survives for the re-queued job
//! to find.

use crate::cache::CacheStats;
use crate::iiif::{BaseType, RasterOpts, plan_tiles};
use crate::imaging::{BackendError, ImageBackend};
use crate::resource::{Resource, Status};
use crate::service::{Ensured, RasterService, ServiceError};
use crate::store::{ResourceStore, StoreError};
use rayon::prelude::*;
use std::any::Any;
use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Resource {identifier} is missing {}", .fields.join(", "))]
    MissingBaseDependency {
        identifier: String,
        fields: Vec<&'static str>,
    },
    #[error("Resource {0} disappeared while processing")]
    Vanished(String),
    #[error("Resource {0} changed while processing")]
    Superseded(String),
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub identifier: String,
    pub bases: CacheStats,
    pub derivatives: CacheStats,
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: bases {}; derivatives {}",
            self.identifier, self.bases, self.derivatives
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed(PipelineReport),
    /// Missing, or not pending (another worker owns it, or it is done).
    Skipped,
    /// Reset while the job ran; left pending for the re-queued job.
    Superseded(PipelineReport),
}

pub struct DerivativePipeline<'a, B: ImageBackend> {
    service: &'a RasterService<'a, B>,
    store: &'a dyn ResourceStore,
}

impl<'a, B: ImageBackend> DerivativePipeline<'a, B> {
    pub fn new(service: &'a RasterService<'a, B>, store: &'a dyn ResourceStore) -> Self {
        Self { service, store }
    }

    /// Process one resource.
    #[instrument(skip(self))]
    pub fn run(&self, identifier: &str) -> Result<PipelineOutcome, PipelineError> {
        let Some(resource) = self.store.get(identifier)? else {
            warn!("Resource not found, skipping");
            return Ok(PipelineOutcome::Skipped);
        };
        if !self
            .store
            .transition(identifier, Status::Pending, Status::Processing)?
        {
            info!(status = %resource.status, "Resource not pending, skipping");
            return Ok(PipelineOutcome::Skipped);
        }
        info!("Processing started");
        let snapshot = self
            .store
            .get(identifier)?
            .ok_or_else(|| PipelineError::Vanished(identifier.to_string()))?;

        let mut report = PipelineReport {
            identifier: identifier.to_string(),
            bases: CacheStats::default(),
            derivatives: CacheStats::default(),
        };
        let result =
            panic::catch_unwind(AssertUnwindSafe(|| self.generate(&snapshot, &mut report)));
        match result {
            Ok(Ok(())) => {
                if self
                    .store
                    .transition(identifier, Status::Processing, Status::Ready)?
                {
                    info!(%report, "Processing finished");
                    Ok(PipelineOutcome::Completed(report))
                } else {
                    info!("Resource changed while processing, leaving it pending");
                    self.discard_stale(&snapshot)?;
                    Ok(PipelineOutcome::Superseded(report))
                }
            }
            Ok(Err(PipelineError::Superseded(_))) => {
                info!(%report, "Resource changed while processing, stopped early");
                self.discard_stale(&snapshot)?;
                Ok(PipelineOutcome::Superseded(report))
            }
            Ok(Err(e)) => {
                // A purge under a running job surfaces as missing files
                if let Ok(false) = self.is_current(&snapshot) {
                    warn!(error = %e, "Processing failed after the resource changed");
                    self.discard_stale(&snapshot)?;
                    return Ok(PipelineOutcome::Superseded(report));
                }
                error!(error = %e, "Processing failed");
                self.fail(identifier, &describe_error(&e));
                Err(e)
            }
            Err(payload) => {
                let message = format!(
                    "panic: {}\n\nBacktrace:\n{}",
                    panic_message(payload.as_ref()),
                    Backtrace::force_capture()
                );
                error!(panic = %panic_message(payload.as_ref()), "Processing panicked");
                self.fail(identifier, &message);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Run every pending resource that has a source, in identifier order.
    #[allow(clippy::type_complexity)]
    pub fn run_pending(
        &self,
    ) -> Result<Vec<(String, Result<PipelineOutcome, PipelineError>)>, PipelineError> {
        let pending: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.status == Status::Pending && r.source.is_some())
            .map(|r| r.identifier)
            .collect();
        Ok(pending
            .into_iter()
            .map(|id| {
                let outcome = self.run(&id);
                (id, outcome)
            })
            .collect())
    }

    fn fail(&self, identifier: &str, message: &str) {
        if let Err(e) = self.store.record_failure(identifier, message) {
            error!(error = %e, "Could not record failure");
        }
    }

    /// Still `processing`, with the inputs this job started from.
    fn is_current(&self, snapshot: &Resource) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&snapshot.identifier)?
            .is_some_and(|r| r.status == Status::Processing && r.same_output_as(snapshot)))
    }

    fn ensure_current(&self, snapshot: &Resource) -> Result<(), PipelineError> {
        if self.is_current(snapshot)? {
            Ok(())
        } else {
            Err(PipelineError::Superseded(snapshot.identifier.clone()))
        }
    }

    /// Purge what this job may have rendered after the lifecycle purge, unless
    /// the record still renders the same pixels.
    fn discard_stale(&self, snapshot: &Resource) -> Result<(), PipelineError> {
        let identifier = &snapshot.identifier;
        if let Some(current) = self.store.get(identifier)?
            && current.same_output_as(snapshot)
        {
            return Ok(());
        }
        if self.service.cache().purge(identifier)? {
            info!("Purged derivatives rendered from the previous inputs");
        }
        Ok(())
    }

    fn generate(
        &self,
        snapshot: &Resource,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        let identifier = snapshot.identifier.as_str();
        let missing = snapshot.missing_base_dependencies();
        if !missing.is_empty() {
            return Err(PipelineError::MissingBaseDependency {
                identifier: identifier.to_string(),
                fields: missing,
            });
        }

        let backend = self.service.backend();
        let mut resource = snapshot.clone();
        let mut bases = Vec::with_capacity(BaseType::ALL.len());
        for base_type in BaseType::ALL {
            self.ensure_current(snapshot)?;
            let (path, ensured) = self.service.ensure_base(&resource, base_type)?;
            tally(&mut report.bases, ensured);
            let dims = backend.identify(&path)?;
            resource.dimensions.set(base_type, dims);
            if !self.store.record_dimensions(identifier, base_type, dims)? {
                return Err(PipelineError::Superseded(identifier.to_string()));
            }
            bases.push((base_type, path, dims));
        }

        let key = resource.cache_key();
        let tile_size = self.service.derivatives().tile_size;
        for (base_type, path, dims) in bases {
            let mut jobs: Vec<RasterOpts> = self
                .service
                .derivatives()
                .sizes_for(base_type)
                .iter()
                .map(|&s| RasterOpts::bounded(s))
                .collect();
            if base_type != BaseType::Featured {
                jobs.extend(plan_tiles(dims.width, dims.height, tile_size));
            }

            let image = backend.decode(&path)?;
            let results: Vec<Ensured> = jobs
                .par_iter()
                .map(|opts| {
                    self.ensure_current(snapshot)?;
                    let dest = self.service.cache().raster_path(base_type, &key, opts);
                    let ensured = self.service.ensure_cached(&dest, || {
                        self.service.generator().generate_from(&image, &dest, opts)?;
                        Ok(())
                    })?;
                    Ok(ensured)
                })
                .collect::<Result<_, PipelineError>>()?;
            for ensured in results {
                tally(&mut report.derivatives, ensured);
            }
        }
        Ok(())
    }
}

fn tally(stats: &mut CacheStats, ensured: Ensured) {
    match ensured {
        Ensured::Cached => stats.hit(),
        Ensured::Generated => stats.generate(),
    }
}

/// Error, its cause chain, and a backtrace of the job boundary.
fn describe_error(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut cause = err.source();
    while let Some(c) = cause {
        message.push_str(&format!("\ncaused by: {c}"));
        cause = c.source();
    }
    message.push_str(&format!("\n\nBacktrace:\n{}", Backtrace::force_capture()));
    message
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::imaging::Dimensions;
    use crate::imaging::backend::tests::MockBackend;
    use crate::lock::MemoryLocker;
    use crate::resource::{FeaturedRegion, SourceLocator};
    use crate::cache::RasterCache;
    use crate::imaging::ConvertPlan;
    use crate::lifecycle::{Lifecycle, VecQueue};
    use crate::resource::ResourceUpdate;
    use crate::source::SourceResolver;
    use crate::store::MemoryStore;
    use crate::test_helpers::{pending_resource, test_config, write_mock_image};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        config: Config,
        store: MemoryStore,
    }

    /// A pending 2000x1000 resource with a featured square at the origin.
    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let source = tmp.path().join("sources/master.tif");
        write_mock_image(&source, 2000, 1000);
        let store = MemoryStore::new();
        let mut resource = pending_resource("cul:1", &source);
        resource.featured_region = Some(FeaturedRegion::new(0, 0, 1000, 1000));
        store.insert(resource).unwrap();
        Fixture {
            _tmp: tmp,
            config,
            store,
        }
    }

    fn service<'a>(config: &Config, backend: &'a MockBackend) -> RasterService<'a, MockBackend> {
        RasterService::new(config, backend, Box::new(MemoryLocker::new()))
    }

    #[test]
    fn run_generates_bases_sizes_and_tiles() {
        let f = fixture();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);
        let pipeline = DerivativePipeline::new(&svc, &f.store);

        let outcome = pipeline.run("cul:1").unwrap();
        let PipelineOutcome::Completed(report) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        let resource = f.store.get("cul:1").unwrap().unwrap();
        assert_eq!(resource.status, Status::Ready);
        assert_eq!(
            resource.dimensions.standard,
            Some(Dimensions {
                width: 2000,
                height: 1000
            })
        );
        assert_eq!(
            resource.dimensions.limited,
            Some(Dimensions {
                width: 768,
                height: 384
            })
        );
        assert_eq!(
            resource.dimensions.featured,
            Some(Dimensions {
                width: 768,
                height: 768
            })
        );

        // Featured bases get sizes only, no tiles
        let standard_tiles = plan_tiles(2000, 1000, 512).len() as u32;
        let limited_tiles = plan_tiles(768, 384, 512).len() as u32;
        assert_eq!(report.bases.generated, 3);
        assert_eq!(
            report.derivatives.generated,
            2 + standard_tiles + 1 + limited_tiles + 1
        );
        assert_eq!(backend.convert_count() as u32, 3 + report.derivatives.generated);

        let cache = svc.cache();
        assert!(cache.raster_exists(BaseType::Standard, "cul:1", &RasterOpts::bounded(256)));
        assert!(cache.raster_exists(BaseType::Featured, "cul:1", &RasterOpts::bounded(256)));
        assert!(!cache.raster_exists(BaseType::Featured, "cul:1", &RasterOpts::bounded(768)));
        for tile in plan_tiles(768, 384, 512) {
            assert!(cache.raster_exists(BaseType::Limited, "cul:1", &tile));
        }
    }

    #[test]
    fn second_run_is_skipped() {
        let f = fixture();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);
        let pipeline = DerivativePipeline::new(&svc, &f.store);

        pipeline.run("cul:1").unwrap();
        let converts = backend.convert_count();
        assert_eq!(pipeline.run("cul:1").unwrap(), PipelineOutcome::Skipped);
        assert_eq!(backend.convert_count(), converts);
    }

    #[test]
    fn rerun_after_reset_reuses_cached_files() {
        let f = fixture();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);
        let pipeline = DerivativePipeline::new(&svc, &f.store);
        pipeline.run("cul:1").unwrap();
        let converts = backend.convert_count();

        f.store
            .update("cul:1", &mut |r| {
                r.reset();
                true
            })
            .unwrap();
        let PipelineOutcome::Completed(report) = pipeline.run("cul:1").unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(report.bases.generated, 0);
        assert_eq!(report.derivatives.generated, 0);
        assert_eq!(report.bases.hits, 3);
        assert_eq!(backend.convert_count(), converts);
    }

    #[test]
    fn unknown_identifier_is_skipped() {
        let f = fixture();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);
        let outcome = DerivativePipeline::new(&svc, &f.store).run("cul:404").unwrap();
        assert_eq!(outcome, PipelineOutcome::Skipped);
    }

    #[test]
    fn missing_featured_region_fails_the_resource() {
        let f = fixture();
        f.store
            .update("cul:1", &mut |r| {
                r.featured_region = None;
                true
            })
            .unwrap();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);

        let err = DerivativePipeline::new(&svc, &f.store).run("cul:1").unwrap_err();
        assert!(matches!(
            &err,
            PipelineError::MissingBaseDependency { fields, .. }
                if fields == &vec!["featured_region"]
        ));
        let resource = f.store.get("cul:1").unwrap().unwrap();
        assert_eq!(resource.status, Status::Failure);
        assert!(resource
            .error_message
            .unwrap()
            .starts_with("Resource cul:1 is missing featured_region"));
        assert_eq!(backend.convert_count(), 0);
    }

    #[test]
    fn unreadable_source_records_cause_chain() {
        let f = fixture();
        f.store
            .update("cul:1", &mut |r| {
                r.source = Some(SourceLocator::Root("gone.tif".into()));
                true
            })
            .unwrap();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);

        let err = DerivativePipeline::new(&svc, &f.store).run("cul:1").unwrap_err();
        assert!(matches!(err, PipelineError::Service(ServiceError::Source(_))));
        let message = f.store.get("cul:1").unwrap().unwrap().error_message.unwrap();
        assert!(message.contains("root://gone.tif is unreadable"));
        assert!(message.contains("Backtrace:"));
    }

    #[test]
    fn panic_is_recorded_then_propagated() {
        let f = fixture();
        let backend = MockBackend {
            panic_on_convert: true,
            ..MockBackend::default()
        };
        let svc = service(&f.config, &backend);
        let pipeline = DerivativePipeline::new(&svc, &f.store);

        let result = panic::catch_unwind(AssertUnwindSafe(|| pipeline.run("cul:1")));
        assert!(result.is_err());

        let resource = f.store.get("cul:1").unwrap().unwrap();
        assert_eq!(resource.status, Status::Failure);
        assert!(resource
            .error_message
            .unwrap()
            .starts_with("panic: mock codec crashed"));
    }

    #[test]
    fn reset_during_processing_leaves_resource_pending() {
        let f = fixture();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);

        /// Store whose first `record_dimensions` call simulates an API write
        /// that invalidates the running job.
        struct ResettingStore<'s> {
            inner: &'s MemoryStore,
            fired: std::sync::atomic::AtomicBool,
        }
        impl ResourceStore for ResettingStore<'_> {
            fn get(&self, id: &str) -> Result<Option<Resource>, StoreError> {
                self.inner.get(id)
            }
            fn insert(&self, r: Resource) -> Result<(), StoreError> {
                self.inner.insert(r)
            }
            fn update(
                &self,
                id: &str,
                f: &mut dyn FnMut(&mut Resource) -> bool,
            ) -> Result<Option<Resource>, StoreError> {
                self.inner.update(id, f)
            }
            fn delete(&self, id: &str) -> Result<bool, StoreError> {
                self.inner.delete(id)
            }
            fn list(&self) -> Result<Vec<Resource>, StoreError> {
                self.inner.list()
            }
            fn record_dimensions(
                &self,
                id: &str,
                _base_type: BaseType,
                _dims: Dimensions,
            ) -> Result<bool, StoreError> {
                if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    self.inner.update(id, &mut |r| {
                        r.reset();
                        true
                    })?;
                }
                Ok(false)
            }
        }

        let store = ResettingStore {
            inner: &f.store,
            fired: Default::default(),
        };
        let outcome = DerivativePipeline::new(&svc, &store).run("cul:1").unwrap();
        assert!(matches!(outcome, PipelineOutcome::Superseded(_)));
        assert_eq!(f.store.get("cul:1").unwrap().unwrap().status, Status::Pending);
    }

    /// Runs `hook` once, around the first decode of a path ending in
    /// `suffix`, so an API write lands in the middle of a job.
    struct HookedBackend<'h> {
        inner: MockBackend,
        suffix: &'static str,
        before_decode: bool,
        hook: Box<dyn Fn() + Sync + 'h>,
        fired: AtomicBool,
    }

    impl ImageBackend for HookedBackend<'_> {
        type Image = Dimensions;

        fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
            self.inner.identify(path)
        }

        fn decode(&self, path: &Path) -> Result<Dimensions, BackendError> {
            let fire = path.ends_with(self.suffix) && !self.fired.swap(true, Ordering::SeqCst);
            if fire && self.before_decode {
                (self.hook)();
            }
            let image = self.inner.decode(path)?;
            if fire && !self.before_decode {
                (self.hook)();
            }
            Ok(image)
        }

        fn dimensions(&self, image: &Dimensions) -> Dimensions {
            *image
        }

        fn convert(
            &self,
            image: &Dimensions,
            output: &Path,
            plan: &ConvertPlan,
        ) -> Result<(), BackendError> {
            self.inner.convert(image, output, plan)
        }
    }

    /// Swap the 2000x1000 source for a 400x300 one while the first job is
    /// about to cut derivatives from its standard base, then run the
    /// re-queued job.
    fn change_source_mid_run(before_decode: bool) -> (Fixture, PipelineOutcome, VecQueue) {
        let f = fixture();
        let revised = f.config.sources.root.join("revised.tif");
        write_mock_image(&revised, 400, 300);

        let cache = RasterCache::new(&f.config.raster_cache.directory);
        let sources = SourceResolver::new(
            &f.config.sources.root,
            &f.config.sources.placeholder_directory,
        );
        let identify_backend = MockBackend::new();
        let queue = VecQueue::new();
        let lifecycle = Lifecycle::new(&f.store, &cache, &sources, &identify_backend, &queue);

        let backend = HookedBackend {
            inner: MockBackend::new(),
            suffix: "standard/base.png",
            before_decode,
            hook: Box::new(|| {
                let update = ResourceUpdate {
                    source: Some(SourceLocator::File(revised.clone())),
                    featured_region: Some(FeaturedRegion::new(0, 0, 300, 300)),
                    ..ResourceUpdate::default()
                };
                lifecycle.create_or_update("cul:1", update).unwrap();
            }),
            fired: AtomicBool::new(false),
        };
        let svc = RasterService::new(&f.config, &backend, Box::new(MemoryLocker::new()));
        let outcome = DerivativePipeline::new(&svc, &f.store).run("cul:1").unwrap();
        drop(svc);
        drop(backend);
        (f, outcome, queue)
    }

    fn assert_rerun_renders_revised_source(f: &Fixture, queue: &VecQueue) {
        assert_eq!(queue.jobs(), vec!["cul:1".to_string()]);
        let resource = f.store.get("cul:1").unwrap().unwrap();
        assert_eq!(resource.status, Status::Pending);
        assert_eq!(resource.error_message, None);

        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);
        let outcome = DerivativePipeline::new(&svc, &f.store).run("cul:1").unwrap();
        let PipelineOutcome::Completed(report) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(report.bases.hits, 0);
        assert_eq!(report.derivatives.hits, 0);

        let path = svc.cache().raster_path(BaseType::Standard, "cul:1", &RasterOpts::bounded(256));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "256x192");
        assert_eq!(
            f.store.get("cul:1").unwrap().unwrap().dimensions.standard,
            Some(Dimensions {
                width: 400,
                height: 300
            })
        );
    }

    #[test]
    fn source_change_stops_the_job_and_discards_its_renders() {
        let (f, outcome, queue) = change_source_mid_run(false);
        let PipelineOutcome::Superseded(report) = outcome else {
            panic!("expected the job to be superseded, got {outcome:?}");
        };
        assert_eq!(report.bases.generated, 3);
        assert_eq!(report.derivatives.total(), 0);
        assert_rerun_renders_revised_source(&f, &queue);
    }

    #[test]
    fn failure_caused_by_a_source_change_is_not_recorded() {
        // The purge removes the base the job is about to decode
        let (f, outcome, queue) = change_source_mid_run(true);
        assert!(matches!(outcome, PipelineOutcome::Superseded(_)));
        assert_rerun_renders_revised_source(&f, &queue);
    }

    #[test]
    fn run_pending_processes_only_pending_with_source() {
        let f = fixture();
        f.store.insert(Resource::new("cul:no-source")).unwrap();
        let backend = MockBackend::new();
        let svc = service(&f.config, &backend);

        let results = DerivativePipeline::new(&svc, &f.store).run_pending().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "cul:1");
        assert!(matches!(results[0].1, Ok(PipelineOutcome::Completed(_))));
    }

    #[test]
    fn report_display() {
        let report = PipelineReport {
            identifier: "cul:1".into(),
            bases: CacheStats {
                hits: 0,
                generated: 3,
            },
            derivatives: CacheStats {
                hits: 2,
                generated: 5,
            },
        };
        assert_eq!(
            report.to_string(),
            "cul:1: bases 3 generated; derivatives 2 cached, 5 generated (7 total)"
        );
    }
}
