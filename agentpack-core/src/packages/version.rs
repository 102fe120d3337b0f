//! Version ordering for installed and catalog versions.
//!
//! Versions are semver-like: `MAJOR.MINOR.PATCH` with an optional leading
//! `v`/`V`, an optional `-prerelease` and optional `+build` metadata.
//!
//! Comparison rules:
//! - Numeric components compared numerically: `1.10.0 > 1.9.0`
//! - Missing components count as zero: `1.2 == 1.2.0`
//! - Prerelease comes before release: `1.0.0-beta < 1.0.0`
//! - Build metadata is ignored

use std::cmp::Ordering;
use std::fmt;

/// A parsed version for comparison.
#[derive(Debug, Clone)]
pub struct Version {
    release: Vec<Component>,
    prerelease: Vec<Component>,
    original: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Numeric(u64),
    Alpha(String),
}

impl Component {
    fn parse(part: &str) -> Self {
        match part.parse::<u64>() {
            Ok(n) => Self::Numeric(n),
            Err(_) => Self::Alpha(part.to_string()),
        }
    }

    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.cmp(b),
            (Self::Alpha(a), Self::Alpha(b)) => a.cmp(b),
            // Numeric identifiers have lower precedence than alphanumeric ones
            (Self::Numeric(_), Self::Alpha(_)) => Ordering::Less,
            (Self::Alpha(_), Self::Numeric(_)) => Ordering::Greater,
        }
    }
}

impl Version {
    /// Parses a version string. Parsing never fails; unrecognised parts
    /// compare lexically.
    pub fn parse(s: &str) -> Self {
        let original = s.trim().to_string();
        let stripped = original
            .strip_prefix('v')
            .or_else(|| original.strip_prefix('V'))
            .unwrap_or(&original);

        let without_build = stripped.split('+').next().unwrap_or_default();
        let (release, prerelease) = match without_build.split_once('-') {
            Some((release, pre)) => (release, pre),
            None => (without_build, ""),
        };

        Self {
            release: split_components(release),
            prerelease: split_components(prerelease),
            original,
        }
    }

    /// Returns true if this version sorts before `other`.
    pub fn is_older_than(&self, other: &Version) -> bool {
        self.cmp(other) == Ordering::Less
    }

    /// Returns the string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.original
    }
}

fn split_components(s: &str) -> Vec<Component> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split('.').map(Component::parse).collect()
}

fn compare_release(a: &[Component], b: &[Component]) -> Ordering {
    let zero = Component::Numeric(0);
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).unwrap_or(&zero);
        let right = b.get(i).unwrap_or(&zero);
        match left.cmp(right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn compare_prerelease(a: &[Component], b: &[Component]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            for (left, right) in a.iter().zip(b.iter()) {
                match left.cmp(right) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_release(&self.release, &other.release)
            .then_with(|| compare_prerelease(&self.prerelease, &other.prerelease))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

/// Compares two version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_ordering() {
        assert_eq!(compare_versions("1.0.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn test_numeric_not_lexical() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
    }

    #[test]
    fn test_leading_prefix_ignored() {
        assert_eq!(compare_versions("v1.2.0", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("V1.2.0", "v1.3.0"), Ordering::Less);
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn test_prerelease_before_release() {
        assert_eq!(compare_versions("1.0.0-beta", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-alpha", "1.0.0-beta"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-rc.2", "1.0.0-rc.10"), Ordering::Less);
    }

    #[test]
    fn test_build_metadata_ignored() {
        assert_eq!(compare_versions("1.0.0+abc", "1.0.0+def"), Ordering::Equal);
    }

    #[test]
    fn test_is_older_than() {
        assert!(Version::parse("1.0.0").is_older_than(&Version::parse("1.2.0")));
        assert!(!Version::parse("1.2.0").is_older_than(&Version::parse("1.2.0")));
    }
}
