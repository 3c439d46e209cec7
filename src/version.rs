//! Version resolution for dependencies.
//!
//! A version specifier is a dot-separated pattern where any segment may be a
//! wildcard (`x`, `X` or `*`). Specifiers shorter than the dependency's
//! expected number of parts are padded with `.x`, so `"7"` behaves like
//! `"7.x.x"`. Among the candidates matching the pattern the highest version
//! wins.

use anyhow::Result;
use log::debug;
use semver::Version;

use crate::error::SupplyError;

/// Picks one manifest version for a dependency's specifier.
pub struct VersionResolver;

impl VersionResolver {
    /// Resolve `spec` against `candidates`, returning the highest match.
    pub fn resolve(name: &str, spec: &str, version_parts: usize, candidates: &[String]) -> Result<String> {
        let pattern = Self::pad(spec, version_parts);
        debug!("Resolving {} '{}' as '{}' against {:?}", name, spec, pattern, candidates);

        Self::find_matching(&pattern, candidates).ok_or_else(|| {
            SupplyError::VersionResolution {
                name: name.to_string(),
                spec: spec.to_string(),
            }
            .into()
        })
    }

    /// Append `.x` until the specifier has `version_parts` segments.
    pub fn pad(spec: &str, version_parts: usize) -> String {
        let spec = spec.trim();
        let mut padded = spec.to_string();
        let mut segments = if spec.is_empty() { 0 } else { spec.split('.').count() };
        while segments < version_parts {
            if padded.is_empty() {
                padded.push('x');
            } else {
                padded.push_str(".x");
            }
            segments += 1;
        }
        padded
    }

    /// Highest candidate satisfying `pattern`, as it was spelled in the candidate list.
    pub fn find_matching(pattern: &str, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .filter_map(|c| parse_lenient(c).map(|v| (c, v)))
            .filter(|(_, v)| Self::matches(pattern, v))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(c, _)| c.clone())
    }

    /// Check whether `version` satisfies the wildcard `pattern`.
    ///
    /// Missing trailing segments act as wildcards. Pre-release versions only
    /// match a pattern naming them exactly.
    pub fn matches(pattern: &str, version: &Version) -> bool {
        let pattern = pattern.trim().trim_start_matches('v');
        if pattern.is_empty() {
            return version.pre.is_empty();
        }

        if !version.pre.is_empty() {
            return parse_lenient(pattern).is_some_and(|p| &p == version);
        }

        let actual = [version.major, version.minor, version.patch];
        for (i, segment) in pattern.split('.').enumerate() {
            if is_wildcard(segment) {
                continue;
            }
            let Some(&actual) = actual.get(i) else {
                return false;
            };
            match segment.parse::<u64>() {
                Ok(n) if n == actual => {}
                _ => return false,
            }
        }
        true
    }
}

fn is_wildcard(segment: &str) -> bool {
    matches!(segment, "x" | "X" | "*")
}

/// Parse a version, tolerating a `v` prefix and fewer than three numeric parts.
pub(crate) fn parse_lenient(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }

    let (core, rest) = match raw.find(['-', '+']) {
        Some(idx) => raw.split_at(idx),
        None => (raw, ""),
    };
    let segments = core.split('.').count();
    if segments == 0 || segments >= 3 {
        return None;
    }
    let padded = format!("{}{}{}", core, ".0".repeat(3 - segments), rest);
    Version::parse(&padded).ok()
}
