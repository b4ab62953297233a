//! CLI output formatting.
//!
//! # Information-First Display
//!
//! Every entity leads with its identity (the resource identifier, or the
//! request being served) and shows paths and derived numbers as indented
//! context lines beneath it.
//!
//! ## Resource
//!
//! ```text
//! cul:123 (ready)
//!     Source: root://masters/cul-123.tif
//!     Featured region: 100,100,2000,2000
//!     Type: Image
//!     standard: 6485x8690
//!     limited: 573x768
//!     featured: 768x768
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! cul:123 ready
//!     Bases: 3 generated
//!     Derivatives: 4 cached, 212 generated (216 total)
//! ```
//!
//! ## Raster
//!
//! ```text
//! full/573,768/0/color.jpg
//!     Cached: /var/cache/iiif/5f/2c/.../standard/iiif/full/573,768/0/color.jpg
//! ```
//!
//! # Architecture
//!
//! Each entity has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure.

use crate::config::Config;
use crate::fallback::Resolution;
use crate::iiif::{BaseType, RasterOpts};
use crate::lifecycle::Upsert;
use crate::pipeline::{PipelineError, PipelineOutcome};
use crate::resource::{Resource, Status};
use crate::service::RasterResponse;
use std::path::Path;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn context(label: &str, value: impl std::fmt::Display) -> String {
    format!("{}{}: {}", indent(1), label, value)
}

// ============================================================================
// Resources
// ============================================================================

pub fn format_resource(resource: &Resource) -> Vec<String> {
    let mut lines = vec![format!("{} ({})", resource.identifier, resource.status)];
    match &resource.source {
        Some(source) => lines.push(context("Source", source)),
        None => lines.push(context("Source", "none")),
    }
    if let Some(region) = resource.featured_region {
        lines.push(context("Featured region", region));
    }
    if let Some(pcdm_type) = &resource.pcdm_type {
        lines.push(context("Type", pcdm_type));
    }
    if resource.has_view_limitation {
        lines.push(context("View limitation", "yes"));
    }
    for base_type in BaseType::ALL {
        if let Some(dims) = resource.dimensions.get(base_type) {
            lines.push(context(base_type.as_str(), dims));
        }
    }
    if let Some(message) = &resource.error_message {
        // Only the headline; the full chain is in the record
        let first = message.lines().next().unwrap_or_default();
        lines.push(context("Error", first));
    }
    lines
}

pub fn print_resource(resource: &Resource) {
    for line in format_resource(resource) {
        println!("{}", line);
    }
}

pub fn format_upsert(upsert: &Upsert) -> Vec<String> {
    let verb = if upsert.created { "Created" } else { "Updated" };
    let mut lines = vec![format!("{} {}", verb, upsert.resource.identifier)];
    lines.extend(
        format_resource(&upsert.resource)
            .into_iter()
            .map(|l| format!("{}{}", indent(1), l)),
    );
    lines
}

pub fn print_upsert(upsert: &Upsert) {
    for line in format_upsert(upsert) {
        println!("{}", line);
    }
}

/// One line per status, in lifecycle order, with a total.
pub fn format_status_counts(resources: &[Resource]) -> Vec<String> {
    let statuses = [
        Status::Pending,
        Status::Processing,
        Status::Ready,
        Status::Failure,
    ];
    let mut lines: Vec<String> = statuses
        .iter()
        .map(|s| {
            let n = resources.iter().filter(|r| r.status == *s).count();
            format!("{}: {}", s, n)
        })
        .collect();
    lines.push(format!("total: {}", resources.len()));
    lines
}

// ============================================================================
// Pipeline
// ============================================================================

pub fn format_pipeline_outcome(
    identifier: &str,
    outcome: &Result<PipelineOutcome, PipelineError>,
) -> Vec<String> {
    match outcome {
        Ok(PipelineOutcome::Completed(report)) => vec![
            format!("{} ready", identifier),
            context("Bases", report.bases),
            context("Derivatives", report.derivatives),
        ],
        Ok(PipelineOutcome::Superseded(report)) => vec![
            format!("{} superseded (left pending)", identifier),
            context("Bases", report.bases),
            context("Derivatives", report.derivatives),
        ],
        Ok(PipelineOutcome::Skipped) => vec![format!("{} skipped", identifier)],
        Err(e) => vec![format!("{} failed", identifier), context("Error", e)],
    }
}

pub fn print_pipeline_outcome(identifier: &str, outcome: &Result<PipelineOutcome, PipelineError>) {
    for line in format_pipeline_outcome(identifier, outcome) {
        println!("{}", line);
    }
}

// ============================================================================
// Rasters
// ============================================================================

pub fn format_raster_response(opts: &RasterOpts, response: &RasterResponse) -> Vec<String> {
    let detail = match response {
        RasterResponse::Cached(path) => context("Cached", path.display()),
        RasterResponse::Temporary(path) => context("Temporary", path.display()),
        RasterResponse::Redirect(target) => context("Redirect", target),
        RasterResponse::NotFound => context("Not found", "not cached and on_miss = error"),
    };
    vec![opts.to_string(), detail]
}

pub fn print_raster_response(opts: &RasterOpts, response: &RasterResponse) {
    for line in format_raster_response(opts, response) {
        println!("{}", line);
    }
}

/// Where a request lands in the cache, and whether anything is there yet.
pub fn format_cache_path(
    normalized: &RasterOpts,
    resolution: &Resolution,
    path: &Path,
) -> Vec<String> {
    let mut lines = vec![normalized.to_string(), context("Path", path.display())];
    if !resolution.hit {
        lines.push(context("Status", "missing"));
    } else if resolution.opts == *normalized {
        lines.push(context("Status", "cached"));
    } else {
        lines.push(context("Status", format!("cached as {}", resolution.opts)));
    }
    lines
}

pub fn print_cache_path(normalized: &RasterOpts, resolution: &Resolution, path: &Path) {
    for line in format_cache_path(normalized, resolution, path) {
        println!("{}", line);
    }
}

// ============================================================================
// Config
// ============================================================================

pub fn format_config_summary(config: &Config) -> Vec<String> {
    vec![
        "Config".to_string(),
        context("Cache", config.raster_cache.directory.display()),
        context("On miss", config.raster_cache.on_miss),
        context("Locks", config.lock.directory.display()),
        context("Resources", config.store.directory.display()),
        context("Sources", config.sources.root.display()),
    ]
}

pub fn print_config_summary(config: &Config) {
    for line in format_config_summary(config) {
        println!("{}", line);
    }
}
