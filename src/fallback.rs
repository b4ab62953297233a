//! Cache lookup tolerant of size drift.
//!
//! Normalized sizes are computed with floating point rounding, so a request
//! may land one pixel away from the entry the pipeline wrote earlier. The
//! lookup probes a fixed list of alternates before declaring a miss:
//!
//! 1. the normalized options;
//! 2. the normalized options with the size exactly as requested;
//! 3. for `full` regions with an explicit `W,H` size, the best-fit `!L,L`
//!    where `L = max(W, H)`;
//! 4. `!(L-1),(L-1)`;
//! 5. `!(L+1),(L+1)`.
//!
//! The order matters: existing caches were populated expecting it.

use crate::iiif::RasterOpts;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub opts: RasterOpts,
    pub hit: bool,
}

/// Explicit `W,H` size; `None` for every other form.
fn explicit_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.split_once(',')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Candidates in probe order. Duplicates are kept; probing one twice is
/// harmless.
pub fn fallback_candidates(original: &RasterOpts, normalized: &RasterOpts) -> Vec<RasterOpts> {
    let mut candidates = vec![
        normalized.clone(),
        normalized.with_size(original.size.clone()),
    ];

    if normalized.region == "full"
        && let Some((w, h)) = explicit_size(&normalized.size)
    {
        let long = w.max(h);
        for l in [Some(long), long.checked_sub(1), long.checked_add(1)]
            .into_iter()
            .flatten()
            .filter(|&l| l > 0)
        {
            candidates.push(normalized.with_size(format!("!{l},{l}")));
        }
    }
    candidates
}

/// Probe the candidates with `exists` and return the first hit.
///
/// On a complete miss the normalized options come back with `hit = false`;
/// that is where a newly generated entry belongs.
pub fn resolve_with_fallback<F>(
    original: &RasterOpts,
    normalized: &RasterOpts,
    exists: F,
) -> Resolution
where
    F: Fn(&RasterOpts) -> bool,
{
    for (i, candidate) in fallback_candidates(original, normalized).into_iter().enumerate() {
        if exists(&candidate) {
            if i > 0 {
                warn!(requested = %original, found = %candidate, "Cache hit through fallback");
            }
            return Resolution {
                opts: candidate,
                hit: true,
            };
        }
        debug!(probe = i + 1, opts = %candidate, "Cache probe missed");
    }
    Resolution {
        opts: normalized.clone(),
        hit: false,
    }
}
