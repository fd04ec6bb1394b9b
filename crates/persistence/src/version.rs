use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
    #[error("malformed version string '{0}' (expected MAJOR.MINOR.PATCH[-BUILD])")]
    Malformed(String),
    #[error("version component '{component}' in '{input}' is out of range")]
    OutOfRange { input: String, component: String },
}

/// Save-format version. Ordering and equality ignore the build tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: Option<String>,
}

impl SaveVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build: None,
        }
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let malformed = || VersionParseError::Malformed(input.to_string());
        let (core, build) = match input.split_once('-') {
            Some((core, build)) => (core, Some(build)),
            None => (input, None),
        };

        let mut parts = core.split('.');
        let major = parse_component(parts.next(), input)?;
        let minor = parse_component(parts.next(), input)?;
        let patch = parse_component(parts.next(), input)?;
        if parts.next().is_some() {
            return Err(malformed());
        }

        let build = match build {
            Some(tag) if !tag.is_empty() && tag.chars().all(is_build_char) => Some(tag.to_string()),
            Some(_) => return Err(malformed()),
            None => None,
        };

        Ok(Self {
            major,
            minor,
            patch,
            build,
        })
    }

    pub fn is_valid_version_string(input: &str) -> bool {
        Self::parse(input).is_ok()
    }

    /// Integer form handed to subsystems as their format version.
    pub fn to_int(&self) -> u32 {
        self.major * 10_000 + self.minor * 100 + self.patch
    }

    pub fn is_compatible_with(&self, required: &SaveVersion) -> bool {
        self.major == required.major && self >= required
    }

    fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

fn parse_component(part: Option<&str>, input: &str) -> Result<u32, VersionParseError> {
    let part = part.ok_or_else(|| VersionParseError::Malformed(input.to_string()))?;
    if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(VersionParseError::Malformed(input.to_string()));
    }
    part.parse::<u32>()
        .map_err(|_| VersionParseError::OutOfRange {
            input: input.to_string(),
            component: part.to_string(),
        })
}

fn is_build_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'
}

impl PartialEq for SaveVersion {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for SaveVersion {}

impl PartialOrd for SaveVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SaveVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl std::hash::Hash for SaveVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
    }
}

impl fmt::Display for SaveVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(build) = &self.build {
            write!(f, "-{build}")?;
        }
        Ok(())
    }
}

impl FromStr for SaveVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_tagged_versions() {
        let plain = SaveVersion::parse("1.2.3").expect("plain");
        assert_eq!(plain, SaveVersion::new(1, 2, 3));
        assert_eq!(plain.build, None);

        let tagged = SaveVersion::parse("2.0.10-rc_1-x").expect("tagged");
        assert_eq!(tagged.build.as_deref(), Some("rc_1-x"));
        assert_eq!(tagged.to_string(), "2.0.10-rc_1-x");
    }

    #[test]
    fn rejects_malformed_strings() {
        for input in ["", "1", "1.2", "1.2.3.4", "a.b.c", "1.2.3-", "1.2.3-bad tag", "-1.2.3", "1..3"] {
            assert!(
                SaveVersion::parse(input).is_err(),
                "expected '{input}' to be rejected"
            );
        }
        assert!(!SaveVersion::is_valid_version_string("v1.0.0"));
    }

    #[test]
    fn ordering_ignores_build_tag() {
        let a = SaveVersion::new(1, 1, 0).with_build("dev");
        let b = SaveVersion::new(1, 1, 0);
        assert_eq!(a, b);
        assert!(SaveVersion::new(1, 0, 9) < SaveVersion::new(1, 1, 0));
        assert!(SaveVersion::new(2, 0, 0) > SaveVersion::new(1, 99, 99));
    }

    #[test]
    fn int_form_and_compatibility() {
        assert_eq!(SaveVersion::new(1, 2, 3).to_int(), 10_203);
        let required = SaveVersion::new(1, 1, 0);
        assert!(SaveVersion::new(1, 2, 0).is_compatible_with(&required));
        assert!(!SaveVersion::new(1, 0, 5).is_compatible_with(&required));
        assert!(!SaveVersion::new(2, 0, 0).is_compatible_with(&required));
    }
}
