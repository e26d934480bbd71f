//! Lenient version parsing.
//!
//! Manifests and package-store folders use `major[.minor[.build[.revision]]]`
//! strings that are not always valid semver. Missing components default to
//! zero and a fourth component is ignored.

use semver::Version;

use crate::config::defaults::FALLBACK_VERSION;
use crate::error::{Error, Result};

/// Parse `major[.minor[.build[.revision]]][-pre]`.
pub fn parse_lenient(input: &str) -> Result<Version> {
    let trimmed = input.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        return Err(Error::VersionParse(input.to_string()));
    }
    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    let (core, pre) = match trimmed.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (trimmed, None),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 4 {
        return Err(Error::VersionParse(input.to_string()));
    }
    let mut numbers = [0u64; 3];
    for (i, part) in parts.iter().enumerate().take(3) {
        numbers[i] = part
            .parse()
            .map_err(|_| Error::VersionParse(input.to_string()))?;
    }
    if let Some(revision) = parts.get(3) {
        revision
            .parse::<u64>()
            .map_err(|_| Error::VersionParse(input.to_string()))?;
    }

    let mut version = Version::new(numbers[0], numbers[1], numbers[2]);
    if let Some(pre) = pre {
        version.pre =
            semver::Prerelease::new(pre).map_err(|_| Error::VersionParse(input.to_string()))?;
    }
    Ok(version)
}

/// Parse a version, substituting `1.0.0` and logging a warning on failure.
pub fn parse_or_default(input: &str, field: &str) -> Version {
    match parse_lenient(input) {
        Ok(version) => version,
        Err(_) => {
            tracing::warn!(
                field,
                value = input,
                "Malformed version, substituting {}",
                FALLBACK_VERSION
            );
            fallback()
        }
    }
}

pub fn fallback() -> Version {
    Version::new(1, 0, 0)
}

/// `major.minor.build` without pre-release or build metadata.
pub fn short_string(version: &Version) -> String {
    format!("{}.{}.{}", version.major, version.minor, version.patch)
}
