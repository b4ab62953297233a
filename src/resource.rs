//! The resource record and its readiness state machine.
//!
//! A [`Resource`] names one source image and tracks how far the derivative
//! pipeline has got with it. Status only moves forward:
//!
//! ```text
//! pending → processing → ready
//!                      ↘ failure
//! ```
//!
//! The only way back is [`Resource::reset`], which the lifecycle layer calls
//! when a change to the source, featured region or content type invalidates
//! everything rendered so far.

use crate::iiif::BaseType;
use crate::imaging::Dimensions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Placeholder shown for resources with no better match.
pub const UNAVAILABLE_PLACEHOLDER: &str = "placeholder:unavailable";

const PLACEHOLDER_PREFIX: &str = "placeholder:";

const PCDM_TEXT_TYPES: [&str; 5] = [
    "Email",
    "PageDescription",
    "StructuredText",
    "Text",
    "UnstructuredText",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Processing,
    Failure,
    Ready,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Failure => "failure",
            Status::Ready => "ready",
        }
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Processing)
                | (Status::Processing, Status::Ready)
                | (Status::Processing, Status::Failure)
        )
    }

    pub fn check_transition(self, next: Status) -> Result<(), StateError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(StateError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rectangle `(x, y, w, h)` in source pixel space, written `"x,y,w,h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeaturedRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FeaturedRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl fmt::Display for FeaturedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for FeaturedRegion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u32> = s
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| format!("featured region must be x,y,w,h (got {s})"))?;
        match parts.as_slice() {
            [x, y, w, h] => Ok(Self::new(*x, *y, *w, *h)),
            _ => Err(format!("featured region must be x,y,w,h (got {s})")),
        }
    }
}

impl TryFrom<String> for FeaturedRegion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeaturedRegion> for String {
    fn from(region: FeaturedRegion) -> Self {
        region.to_string()
    }
}

/// Where a resource's source bytes live.
///
/// | Form | Meaning |
/// |---|---|
/// | `file:///abs/path` | absolute path |
/// | `root://rel/path` | relative to `sources.root` (`railsroot://` is accepted as an alias) |
/// | `placeholder://name` | `{sources.placeholder_directory}/name.png` |
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceLocator {
    File(PathBuf),
    Root(String),
    Placeholder(String),
}

impl SourceLocator {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, SourceLocator::Placeholder(_))
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::File(path) => write!(f, "file://{}", path.display()),
            SourceLocator::Root(rel) => write!(f, "root://{rel}"),
            SourceLocator::Placeholder(name) => write!(f, "placeholder://{name}"),
        }
    }
}

impl FromStr for SourceLocator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| format!("source must be scheme://location (got {s})"))?;
        if rest.is_empty() {
            return Err(format!("source has an empty location: {s}"));
        }
        match scheme {
            "file" => Ok(SourceLocator::File(PathBuf::from(rest))),
            "root" | "railsroot" => Ok(SourceLocator::Root(rest.to_string())),
            "placeholder" => Ok(SourceLocator::Placeholder(rest.to_string())),
            other => Err(format!("unsupported source scheme: {other}")),
        }
    }
}

impl TryFrom<String> for SourceLocator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceLocator> for String {
    fn from(locator: SourceLocator) -> Self {
        locator.to_string()
    }
}

/// Width and height of each base render, as recorded by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseDimensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard: Option<Dimensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limited: Option<Dimensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub featured: Option<Dimensions>,
}

impl BaseDimensions {
    pub fn get(&self, base_type: BaseType) -> Option<Dimensions> {
        match base_type {
            BaseType::Standard => self.standard,
            BaseType::Limited => self.limited,
            BaseType::Featured => self.featured,
        }
    }

    pub fn set(&mut self, base_type: BaseType, dims: Dimensions) {
        let slot = match base_type {
            BaseType::Standard => &mut self.standard,
            BaseType::Limited => &mut self.limited,
            BaseType::Featured => &mut self.featured,
        };
        *slot = Some(dims);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub featured_region: Option<FeaturedRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcdm_type: Option<String>,
    #[serde(default)]
    pub has_view_limitation: bool,
    #[serde(default)]
    pub dimensions: BaseDimensions,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Fields an API write may change. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUpdate {
    pub source: Option<SourceLocator>,
    pub featured_region: Option<FeaturedRegion>,
    pub pcdm_type: Option<String>,
    pub has_view_limitation: Option<bool>,
}

impl Resource {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            source: None,
            featured_region: None,
            pcdm_type: None,
            has_view_limitation: false,
            dimensions: BaseDimensions::default(),
            status: Status::Pending,
            error_message: None,
        }
    }

    /// A ready, synthesized resource for `placeholder:<name>`.
    ///
    /// Placeholders are never stored. Their featured region is the top-left
    /// square over the short side.
    pub fn placeholder(name: &str, standard: Dimensions) -> Self {
        let side = standard.width.min(standard.height);
        let mut resource = Self::new(format!("{PLACEHOLDER_PREFIX}{name}"));
        resource.source = Some(SourceLocator::Placeholder(name.to_string()));
        resource.featured_region = Some(FeaturedRegion::new(0, 0, side, side));
        resource.dimensions.standard = Some(standard);
        resource.status = Status::Ready;
        resource
    }

    pub fn is_ready(&self) -> bool {
        self.status == Status::Ready
    }

    pub fn is_placeholder_backed(&self) -> bool {
        self.source.as_ref().is_some_and(SourceLocator::is_placeholder)
    }

    /// Key the cache is addressed by.
    ///
    /// Placeholder-backed resources use the locator itself, so every
    /// resource showing the same placeholder shares one cache subtree.
    pub fn cache_key(&self) -> String {
        match &self.source {
            Some(locator @ SourceLocator::Placeholder(_)) => locator.to_string(),
            _ => self.identifier.clone(),
        }
    }

    /// The placeholder a not-ready request for this resource redirects to.
    pub fn placeholder_identifier(&self) -> &'static str {
        match self.pcdm_type.as_deref() {
            Some("Audio") => "placeholder:sound",
            Some("Video") => "placeholder:moving_image",
            Some(t) if PCDM_TEXT_TYPES.contains(&t) => "placeholder:text",
            Some("Software") => "placeholder:software",
            _ => UNAVAILABLE_PLACEHOLDER,
        }
    }

    /// Fields that must be set before base renders can be generated.
    pub fn missing_base_dependencies(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.source.is_none() {
            missing.push("source");
        }
        if self.featured_region.is_none() {
            missing.push("featured_region");
        }
        missing
    }

    /// Apply an API update and report whether rendered output is affected.
    ///
    /// Changes to `has_view_limitation` alone never invalidate the cache.
    pub fn apply(&mut self, update: ResourceUpdate) -> bool {
        let mut output_changed = false;
        if let Some(source) = update.source
            && self.source.as_ref() != Some(&source)
        {
            self.source = Some(source);
            output_changed = true;
        }
        if let Some(region) = update.featured_region
            && self.featured_region != Some(region)
        {
            self.featured_region = Some(region);
            output_changed = true;
        }
        if let Some(pcdm_type) = update.pcdm_type
            && self.pcdm_type.as_deref() != Some(pcdm_type.as_str())
        {
            self.pcdm_type = Some(pcdm_type);
            output_changed = true;
        }
        if let Some(limited) = update.has_view_limitation {
            self.has_view_limitation = limited;
        }
        output_changed
    }

    /// Whether both records render the same pixels: same source, featured
    /// region, and content type.
    pub fn same_output_as(&self, other: &Resource) -> bool {
        self.source == other.source
            && self.featured_region == other.featured_region
            && self.pcdm_type == other.pcdm_type
    }

    /// Send the resource back to `pending`, dropping anything the pipeline
    /// derived from the previous source.
    pub fn reset(&mut self) {
        self.status = Status::Pending;
        self.error_message = None;
        self.dimensions = BaseDimensions::default();
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.identifier.trim().is_empty() {
            problems.push("identifier must not be empty".to_string());
        }
        if self.identifier.starts_with(PLACEHOLDER_PREFIX) {
            problems.push(format!(
                "identifier must not start with the reserved prefix {PLACEHOLDER_PREFIX}"
            ));
        }
        if let Some(region) = self.featured_region {
            if region.width == 0 || region.height == 0 {
                problems.push(format!("featured region {region} must have a non-zero size"));
            }
            if let Some(standard) = self.dimensions.standard
                && (region.x as u64 + region.width as u64 > standard.width as u64
                    || region.y as u64 + region.height as u64 > standard.height as u64)
            {
                problems.push(format!(
                    "featured region {region} lies outside the {}x{} source",
                    standard.width, standard.height
                ));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_resource() -> Resource {
        let mut r = Resource::new("cul:123");
        r.source = Some(SourceLocator::File("/data/cul-123.tif".into()));
        r.featured_region = Some(FeaturedRegion::new(0, 0, 100, 100));
        r.status = Status::Ready;
        r
    }

    // =========================================================================
    // Status transitions
    // =========================================================================

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(Status::Pending.can_transition_to(Status::Processing));
        assert!(Status::Processing.can_transition_to(Status::Ready));
        assert!(Status::Processing.can_transition_to(Status::Failure));
    }

    #[test]
    fn backward_and_skipping_transitions_are_rejected() {
        let illegal = [
            (Status::Pending, Status::Ready),
            (Status::Pending, Status::Failure),
            (Status::Ready, Status::Processing),
            (Status::Ready, Status::Pending),
            (Status::Failure, Status::Processing),
            (Status::Processing, Status::Processing),
        ];
        for (from, to) in illegal {
            assert_eq!(
                from.check_transition(to),
                Err(StateError::IllegalTransition { from, to }),
                "{from} -> {to} should be illegal"
            );
        }
    }

    #[test]
    fn default_status_is_pending() {
        assert_eq!(Status::default(), Status::Pending);
        assert_eq!(Resource::new("x").status, Status::Pending);
    }

    // =========================================================================
    // Locators and regions
    // =========================================================================

    #[test]
    fn source_locator_schemes() {
        assert_eq!(
            "file:///data/a.tif".parse::<SourceLocator>(),
            Ok(SourceLocator::File("/data/a.tif".into()))
        );
        assert_eq!(
            "railsroot://spec/fixtures/a.jpg".parse::<SourceLocator>(),
            Ok(SourceLocator::Root("spec/fixtures/a.jpg".into()))
        );
        assert_eq!(
            "placeholder://sound".parse::<SourceLocator>(),
            Ok(SourceLocator::Placeholder("sound".into()))
        );
        assert!("s3://bucket/key".parse::<SourceLocator>().is_err());
        assert!("/no/scheme".parse::<SourceLocator>().is_err());
    }

    #[test]
    fn featured_region_string_form() {
        let region: FeaturedRegion = "10,20,300,400".parse().unwrap();
        assert_eq!(region, FeaturedRegion::new(10, 20, 300, 400));
        assert_eq!(region.to_string(), "10,20,300,400");
        assert!("10,20,300".parse::<FeaturedRegion>().is_err());
    }

    #[test]
    fn resource_serializes_locators_as_strings() {
        let json = serde_json::to_value(ready_resource()).unwrap();
        assert_eq!(json["source"], "file:///data/cul-123.tif");
        assert_eq!(json["featured_region"], "0,0,100,100");
        assert_eq!(json["status"], "ready");
    }

    // =========================================================================
    // Cache key and placeholders
    // =========================================================================

    #[test]
    fn cache_key_is_identifier_for_real_sources() {
        assert_eq!(ready_resource().cache_key(), "cul:123");
    }

    #[test]
    fn cache_key_is_locator_for_placeholder_sources() {
        let mut r = Resource::new("cul:999");
        r.source = Some(SourceLocator::Placeholder("sound".into()));
        assert_eq!(r.cache_key(), "placeholder://sound");
    }

    #[test]
    fn placeholder_resource_is_ready_with_square_region() {
        let r = Resource::placeholder(
            "unavailable",
            Dimensions {
                width: 2000,
                height: 1500,
            },
        );
        assert_eq!(r.identifier, "placeholder:unavailable");
        assert!(r.is_ready());
        assert!(r.is_placeholder_backed());
        assert_eq!(r.featured_region, Some(FeaturedRegion::new(0, 0, 1500, 1500)));
    }

    #[test]
    fn placeholder_identifier_follows_pcdm_type() {
        let mut r = Resource::new("a");
        assert_eq!(r.placeholder_identifier(), "placeholder:unavailable");
        for (pcdm, expected) in [
            ("Audio", "placeholder:sound"),
            ("Video", "placeholder:moving_image"),
            ("PageDescription", "placeholder:text"),
            ("Software", "placeholder:software"),
            ("StillImage", "placeholder:unavailable"),
        ] {
            r.pcdm_type = Some(pcdm.to_string());
            assert_eq!(r.placeholder_identifier(), expected, "for {pcdm}");
        }
    }

    // =========================================================================
    // Updates
    // =========================================================================

    #[test]
    fn apply_detects_output_affecting_changes() {
        let mut r = ready_resource();
        let changed = r.apply(ResourceUpdate {
            featured_region: Some(FeaturedRegion::new(5, 5, 50, 50)),
            ..ResourceUpdate::default()
        });
        assert!(changed);
        assert_eq!(r.featured_region, Some(FeaturedRegion::new(5, 5, 50, 50)));
    }

    #[test]
    fn apply_same_values_is_not_a_change() {
        let mut r = ready_resource();
        let changed = r.apply(ResourceUpdate {
            source: r.source.clone(),
            featured_region: r.featured_region,
            has_view_limitation: Some(true),
            ..ResourceUpdate::default()
        });
        assert!(!changed);
        assert!(r.has_view_limitation);
    }

    #[test]
    fn same_output_ignores_status_and_view_limitation() {
        let a = ready_resource();
        let mut b = a.clone();
        b.reset();
        b.has_view_limitation = !a.has_view_limitation;
        assert!(a.same_output_as(&b));

        b.source = Some(SourceLocator::Root("other.tif".into()));
        assert!(!a.same_output_as(&b));
    }

    #[test]
    fn reset_clears_derived_state() {
        let mut r = ready_resource();
        r.dimensions.standard = Some(Dimensions {
            width: 10,
            height: 10,
        });
        r.error_message = Some("boom".into());
        r.reset();
        assert_eq!(r.status, Status::Pending);
        assert_eq!(r.error_message, None);
        assert_eq!(r.dimensions, BaseDimensions::default());
    }

    #[test]
    fn missing_base_dependencies_lists_fields() {
        assert_eq!(
            Resource::new("a").missing_base_dependencies(),
            vec!["source", "featured_region"]
        );
        assert!(ready_resource().missing_base_dependencies().is_empty());
    }

    #[test]
    fn validate_flags_region_outside_source() {
        let mut r = ready_resource();
        r.dimensions.standard = Some(Dimensions {
            width: 50,
            height: 50,
        });
        let problems = r.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("outside the 50x50 source"));
    }

    #[test]
    fn validate_rejects_reserved_and_empty_identifiers() {
        assert_eq!(Resource::new("").validate().len(), 1);
        assert_eq!(Resource::new("placeholder:x").validate().len(), 1);
    }
}
