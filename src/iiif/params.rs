//! IIIF Image API request parameters.
//!
//! [`RasterOpts`] is the raw string form that flows through the normalizer,
//! the fallback chain and the cache path. Each component also has a typed
//! form ([`Region`], [`SizeSpec`], [`ColorQuality`], [`OutputFormat`]) that
//! validation and the converter work with.
//!
//! ## Grammar
//!
//! | Field | Accepted values |
//! |---|---|
//! | region | `full`, `square`, `featured`, `x,y,w,h`, `pct:x,y,w,h` |
//! | size | `full`, `max`, `w,`, `,h`, `w,h`, `!w,h`, `pct:n` |
//! | rotation | `0`, `90`, `180`, `270` |
//! | quality | `default`, `color`, `gray`, `bitonal` |
//! | format | `jpg`, `png` |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Quality that `default` resolves to, and the quality of every base render.
pub const BASE_QUALITY: &str = "color";
/// Extension of base renders (`{baseType}/base.png`).
pub const BASE_IMAGE_FORMAT: &str = "png";
/// Format of pre-generated derivatives and tiles.
pub const DEFAULT_FORMAT: &str = "jpg";

pub const ALLOWED_ROTATIONS: [u16; 4] = [0, 90, 180, 270];
pub const ALLOWED_QUALITIES: [&str; 4] = ["default", "color", "gray", "bitonal"];
pub const ALLOWED_FORMATS: [&str; 2] = ["jpg", "png"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown base type: {0}")]
pub struct UnknownBaseType(pub String);

/// Which base render a derivative is cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseType {
    /// Full resolution.
    Standard,
    /// Bounded to `derivatives.limited_base_size`.
    Limited,
    /// Featured region crop, bounded to `derivatives.featured_base_size`.
    Featured,
}

impl BaseType {
    pub const ALL: [BaseType; 3] = [BaseType::Standard, BaseType::Limited, BaseType::Featured];

    pub fn as_str(self) -> &'static str {
        match self {
            BaseType::Standard => "standard",
            BaseType::Limited => "limited",
            BaseType::Featured => "featured",
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseType {
    type Err = UnknownBaseType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(BaseType::Standard),
            "limited" => Ok(BaseType::Limited),
            "featured" => Ok(BaseType::Featured),
            other => Err(UnknownBaseType(other.to_string())),
        }
    }
}

/// One IIIF raster request, minus the identifier and base type.
///
/// Fields are kept as request strings so that a raw size token like `573,`
/// can be carried through to the cache path unchanged when the fallback
/// chain needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterOpts {
    pub region: String,
    pub size: String,
    pub rotation: u16,
    pub quality: String,
    pub format: String,
}

impl RasterOpts {
    pub fn new(
        region: impl Into<String>,
        size: impl Into<String>,
        rotation: u16,
        quality: impl Into<String>,
        format: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            size: size.into(),
            rotation,
            quality: quality.into(),
            format: format.into(),
        }
    }

    /// `full/full/0/color.png`: an unmodified render of the source.
    pub fn base() -> Self {
        Self::new("full", "full", 0, BASE_QUALITY, BASE_IMAGE_FORMAT)
    }

    /// `full/!n,n/0/color.jpg`: the shape of every pre-generated size.
    pub fn bounded(long_side: u32) -> Self {
        Self::new(
            "full",
            format!("!{long_side},{long_side}"),
            0,
            BASE_QUALITY,
            DEFAULT_FORMAT,
        )
    }

    pub fn with_size(&self, size: impl Into<String>) -> Self {
        Self {
            size: size.into(),
            ..self.clone()
        }
    }

    pub fn with_region(&self, region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for RasterOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.{}",
            self.region, self.size, self.rotation, self.quality, self.format
        )
    }
}

/// Parsed IIIF region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Region {
    Full,
    Square,
    Featured,
    Pixels { x: u32, y: u32, w: u32, h: u32 },
    Percent { x: f64, y: f64, w: f64, h: f64 },
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => return Ok(Region::Full),
            "square" => return Ok(Region::Square),
            "featured" => return Ok(Region::Featured),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("pct:") {
            let [x, y, w, h] = parse_components::<f64, 4>(rest)
                .ok_or_else(|| format!("is not a valid percentage region: {s}"))?;
            if [x, y, w, h].iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(format!("is not a valid percentage region: {s}"));
            }
            return Ok(Region::Percent { x, y, w, h });
        }
        let [x, y, w, h] = parse_components::<u32, 4>(s).ok_or_else(|| {
            format!("must be full, square, featured, x,y,w,h or pct:x,y,w,h (got {s})")
        })?;
        Ok(Region::Pixels { x, y, w, h })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Full => f.write_str("full"),
            Region::Square => f.write_str("square"),
            Region::Featured => f.write_str("featured"),
            Region::Pixels { x, y, w, h } => write!(f, "{x},{y},{w},{h}"),
            Region::Percent { x, y, w, h } => write!(f, "pct:{x},{y},{w},{h}"),
        }
    }
}

/// Parsed IIIF size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSpec {
    Full,
    Max,
    /// `w,`
    Width(u32),
    /// `,h`
    Height(u32),
    /// `pct:n`
    Percent(f64),
    /// `w,h`
    Exact(u32, u32),
    /// `!w,h`
    BestFit(u32, u32),
}

impl FromStr for SizeSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("must be full, max, w,, ,h, w,h, !w,h or pct:n (got {s})");
        match s {
            "full" => return Ok(SizeSpec::Full),
            "max" => return Ok(SizeSpec::Max),
            _ => {}
        }
        if let Some(pct) = s.strip_prefix("pct:") {
            let n: f64 = pct.parse().map_err(|_| invalid())?;
            if !n.is_finite() || n <= 0.0 {
                return Err(format!("percentage must be greater than zero (got {s})"));
            }
            return Ok(SizeSpec::Percent(n));
        }
        if let Some(bounds) = s.strip_prefix('!') {
            let [w, h] = parse_components::<u32, 2>(bounds).ok_or_else(invalid)?;
            return nonzero(SizeSpec::BestFit(w, h), &[w, h], s);
        }
        let (w, h) = s.split_once(',').ok_or_else(invalid)?;
        let parsed = match (w.is_empty(), h.is_empty()) {
            (false, true) => {
                let w = parse_digits(w).ok_or_else(invalid)?;
                nonzero(SizeSpec::Width(w), &[w], s)?
            }
            (true, false) => {
                let h = parse_digits(h).ok_or_else(invalid)?;
                nonzero(SizeSpec::Height(h), &[h], s)?
            }
            (false, false) => {
                let w = parse_digits(w).ok_or_else(invalid)?;
                let h = parse_digits(h).ok_or_else(invalid)?;
                nonzero(SizeSpec::Exact(w, h), &[w, h], s)?
            }
            (true, true) => return Err(invalid()),
        };
        Ok(parsed)
    }
}

fn nonzero(spec: SizeSpec, values: &[u32], raw: &str) -> Result<SizeSpec, String> {
    if values.contains(&0) {
        Err(format!("dimensions must be greater than zero (got {raw})"))
    } else {
        Ok(spec)
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSpec::Full => f.write_str("full"),
            SizeSpec::Max => f.write_str("max"),
            SizeSpec::Width(w) => write!(f, "{w},"),
            SizeSpec::Height(h) => write!(f, ",{h}"),
            SizeSpec::Percent(p) => write!(f, "pct:{p}"),
            SizeSpec::Exact(w, h) => write!(f, "{w},{h}"),
            SizeSpec::BestFit(w, h) => write!(f, "!{w},{h}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorQuality {
    Default,
    Color,
    Gray,
    Bitonal,
}

impl FromStr for ColorQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(ColorQuality::Default),
            "color" => Ok(ColorQuality::Color),
            "gray" => Ok(ColorQuality::Gray),
            "bitonal" => Ok(ColorQuality::Bitonal),
            other => Err(format!(
                "must be one of {} (got {other})",
                ALLOWED_QUALITIES.join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpg,
    Png,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jpg" => Ok(OutputFormat::Jpg),
            "png" => Ok(OutputFormat::Png),
            other => Err(format!(
                "must be one of {} (got {other})",
                ALLOWED_FORMATS.join(", ")
            )),
        }
    }
}

pub fn parse_rotation(s: &str) -> Result<u16, String> {
    s.parse::<u16>()
        .ok()
        .filter(|r| ALLOWED_ROTATIONS.contains(r))
        .ok_or_else(|| format!("must be one of 0, 90, 180, 270 (got {s})"))
}

/// A single rejected request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

impl std::error::Error for FieldError {}

/// Validate the five request components and assemble them into [`RasterOpts`].
///
/// Every offending field is reported, not only the first.
pub fn parse_request(
    region: &str,
    size: &str,
    rotation: &str,
    quality: &str,
    format: &str,
) -> Result<RasterOpts, Vec<FieldError>> {
    let mut errors = Vec::new();
    let mut check = |field: &'static str, result: Result<(), String>| {
        if let Err(message) = result {
            errors.push(FieldError { field, message });
        }
    };

    check("region", region.parse::<Region>().map(|_| ()));
    check("size", size.parse::<SizeSpec>().map(|_| ()));
    let parsed_rotation = parse_rotation(rotation);
    check("rotation", parsed_rotation.clone().map(|_| ()));
    check("quality", quality.parse::<ColorQuality>().map(|_| ()));
    check("format", format.parse::<OutputFormat>().map(|_| ()));

    match parsed_rotation {
        Ok(rotation) if errors.is_empty() => {
            Ok(RasterOpts::new(region, size, rotation, quality, format))
        }
        _ => Err(errors),
    }
}

/// Split the last URL segment (`default.jpg`) into quality and format.
pub fn split_quality_format(segment: &str) -> Result<(&str, &str), FieldError> {
    segment.rsplit_once('.').ok_or_else(|| FieldError {
        field: "format",
        message: format!("is missing from {segment} (expected quality.format)"),
    })
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_components<T: FromStr, const N: usize>(s: &str) -> Option<[T; N]> {
    let parts: Vec<T> = s
        .split(',')
        .map(|p| p.trim().parse::<T>().ok())
        .collect::<Option<Vec<T>>>()?;
    parts.try_into().ok()
}
