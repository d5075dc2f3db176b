//! # Version Specifiers
//!
//! A desired module version is either the literal `stable` ("latest release
//! tag of the source") or a pinned semantic version. The sentinel is a proper
//! sum type; resolution against a source happens in
//! [`crate::sources::SourceSet::resolve_module`], never through string tests
//! elsewhere.

use semver::Version;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// Resolve to the latest release tag of the source.
    Stable,
    /// An explicit semantic version.
    Pinned(Version),
}

impl Default for VersionSpec {
    fn default() -> Self {
        VersionSpec::Stable
    }
}

impl VersionSpec {
    pub fn as_pinned(&self) -> Option<&Version> {
        match self {
            VersionSpec::Stable => None,
            VersionSpec::Pinned(v) => Some(v),
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Stable => f.write_str("stable"),
            VersionSpec::Pinned(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for VersionSpec {
    type Err = semver::Error;

    /// An empty string normalizes to `stable`. A leading `v` is accepted
    /// because release tags are commonly written that way.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("stable") {
            return Ok(VersionSpec::Stable);
        }
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        Ok(VersionSpec::Pinned(Version::parse(bare)?))
    }
}

impl Serialize for VersionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VersionSpecVisitor;

        impl Visitor<'_> for VersionSpecVisitor {
            type Value = VersionSpec;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("\"stable\" or a semantic version string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<VersionSpec, E> {
                VersionSpec::from_str(value).map_err(|e| {
                    de::Error::custom(format!("invalid version '{value}': {e}"))
                })
            }
        }

        deserializer.deserialize_str(VersionSpecVisitor)
    }
}

/// Parse a release tag into a semantic version, tolerating a leading `v`.
pub fn parse_release_tag(tag: &str) -> Option<Version> {
    let bare = tag.trim().strip_prefix('v').unwrap_or_else(|| tag.trim());
    Version::parse(bare).ok()
}
