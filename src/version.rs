//! Coercion of loosely formatted image tags into comparable semantic versions

use semver::Version;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("tag {tag:?} is not a semantic version: {source}")]
pub struct CoercionError {
    pub tag: String,
    #[source]
    pub source: semver::Error,
}

/// A semantic version extracted from an image tag.
///
/// Ordering follows semver precedence (major, minor, patch, pre-release). Build metadata
/// is kept for display but does not take part in comparisons, so two distinct tags may
/// coerce to equal versions.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct ComparableVersion(Version);

impl PartialEq for ComparableVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ComparableVersion {}

impl PartialOrd for ComparableVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComparableVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (&self.0, &other.0);
        a.major
            .cmp(&b.major)
            .then(a.minor.cmp(&b.minor))
            .then(a.patch.cmp(&b.patch))
            .then_with(|| a.pre.cmp(&b.pre))
    }
}

impl fmt::Display for ComparableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Coerce an image tag into a [`ComparableVersion`].
///
/// A single leading `v` is stripped and missing minor/patch components are padded with
/// `.0`, so `v1` becomes `1.0.0` and `1.2` becomes `1.2.0`. Anything the semver grammar
/// rejects afterwards (`latest`, `1.2-alpine`, `01.2.3`) is not comparable.
pub fn coerce(tag: &str) -> Result<ComparableVersion, CoercionError> {
    let mut normalized = tag.strip_prefix('v').unwrap_or(tag).to_string();
    while normalized.matches('.').count() < 2 {
        normalized.push_str(".0");
    }

    Version::parse(&normalized)
        .map(ComparableVersion)
        .map_err(|source| CoercionError {
            tag: tag.to_string(),
            source,
        })
}
