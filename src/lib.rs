//! # IIIF Raster Cache
//!
//! Serves derived rasters (crops, scales, rotations) of archival master
//! images through an IIIF Image API surface, without doing the same
//! expensive image work twice.
//!
//! # Architecture: Two Writers, One Cache
//!
//! The cache directory is filled from two sides:
//!
//! ```text
//! request time   request → normalize → fallback probes → hit: serve
//!                                                     → miss: on_miss policy
//! ingest time    pending → processing → bases + sizes + tiles → ready | failure
//! ```
//!
//! Both sides write through the same double-checked, lock-guarded path
//! ([`service::RasterService::ensure_cached`]), so concurrent workers in
//! many processes never render the same file twice within a contention
//! window.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`cache`] | Content-addressed layout: identifier → sharded directory → raster path |
//! | [`iiif`] | Request grammar, the normalizer, tile planning, `info.json` numbers |
//! | [`imaging`] | Pure-Rust decode, crop, resize, rotate, encode behind [`imaging::ImageBackend`] |
//! | [`raster`] | Renders one raster and moves it into place without clobbering |
//! | [`lock`] | Blocking lock over a pluggable lease store (`FileLocker`, `MemoryLocker`) |
//! | [`fallback`] | Probes alternate cache names left by rounding drift |
//! | [`resource`] | The resource record and its status state machine |
//! | [`store`] | Resource persistence with an atomic status compare-and-set |
//! | [`source`] | Resolves `file://`, `root://`, and `placeholder://` locators |
//! | [`service`] | Request-time flow and the miss policies |
//! | [`pipeline`] | Ingest-time derivative generation |
//! | [`lifecycle`] | Create, update, delete; invalidation and job enqueueing |
//! | [`access`] | Set of identifiers accessed since the last flush |
//! | [`config`] | `config.toml` loading, merging over stock defaults, validation |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Canonical Names
//!
//! `!768,768`, `573,`, `,768` and `573,768` all describe the same raster of
//! a 6485x8690 source. The normalizer rewrites each of them to explicit
//! `W,H` before the path is computed, so they share one cache entry.
//! Rasters written under older names stay reachable through the fallback
//! probes.
//!
//! ## Paths Are Derived, Never Stored
//!
//! A raster's location is a pure function of identifier, base type, and
//! options. Nothing indexes the cache; purging a resource is a single
//! `remove_dir_all` of its subtree.
//!
//! ## No Partial Files
//!
//! Every raster is encoded into a temporary file beside its destination and
//! renamed into place with no-clobber semantics. A reader never sees a
//! half-written file, and a writer that loses a race discards its copy.

pub mod access;
pub mod cache;
pub mod config;
pub mod fallback;
mod file_guard;
pub mod iiif;
pub mod imaging;
pub mod lifecycle;
pub mod lock;
pub mod output;
pub mod pipeline;
pub mod raster;
pub mod resource;
pub mod service;
pub mod source;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;
