//! Odoo version handling.
//!
//! Odoo releases are versioned `major.minor` (`"15.0"`). The installed `base`
//! module reports a longer form such as `"15.0.1.3"`; only the first two
//! components identify the release, so parsing keeps those and drops the rest.

use crate::error::{self, Error};
use std::fmt;
use std::str::FromStr;

/// Majors this tool knows how to reach through OpenUpgrade.
pub(crate) const SUPPORTED_MAJORS: std::ops::RangeInclusive<u32> = 10..=18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct OdooVersion {
    pub(crate) major: u32,
    pub(crate) minor: u32,
}

impl OdooVersion {
    pub(crate) fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub(crate) fn is_supported(&self) -> bool {
        SUPPORTED_MAJORS.contains(&self.major)
    }

    /// The next step in an incremental upgrade chain is always the next major.
    pub(crate) fn next_major(&self) -> OdooVersion {
        OdooVersion::new(self.major + 1, 0)
    }
}

impl FromStr for OdooVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut components = trimmed.split('.');

        let major = components
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| {
                error::VersionParseSnafu { version: trimmed }.build()
            })?;
        let minor = match components.next() {
            Some(c) => c.parse::<u32>().map_err(|_| {
                error::VersionParseSnafu { version: trimmed }.build()
            })?,
            None => 0,
        };

        Ok(OdooVersion::new(major, minor))
    }
}

impl fmt::Display for OdooVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

serde_plain::derive_serialize_from_display!(OdooVersion);
serde_plain::derive_deserialize_from_fromstr!(OdooVersion, "a version like '15.0'");

/// Renders the supported set the way the CLI help and errors print it,
/// e.g. `10.0, 11.0, ..., 18.0`.
pub(crate) fn supported_versions() -> String {
    SUPPORTED_MAJORS
        .map(|major| format!("{}.0", major))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_major_minor() {
        let v: OdooVersion = "15.0".parse().unwrap();
        assert_eq!(v, OdooVersion::new(15, 0));
    }

    #[test]
    fn parse_full_module_version() {
        let v: OdooVersion = "15.0.1.3".parse().unwrap();
        assert_eq!(v, OdooVersion::new(15, 0));
    }

    #[test]
    fn parse_trims_whitespace() {
        let v: OdooVersion = " 16.0\n".parse().unwrap();
        assert_eq!(v, OdooVersion::new(16, 0));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<OdooVersion>().is_err());
        assert!("abc".parse::<OdooVersion>().is_err());
        assert!("15.x".parse::<OdooVersion>().is_err());
    }

    #[test]
    fn ordering_follows_major_then_minor() {
        let old: OdooVersion = "14.0".parse().unwrap();
        let new: OdooVersion = "15.0".parse().unwrap();
        assert!(old < new);
    }

    #[test]
    fn next_major_resets_minor() {
        let v = OdooVersion::new(14, 2);
        assert_eq!(v.next_major(), OdooVersion::new(15, 0));
    }

    #[test]
    fn supported_bounds() {
        assert!(OdooVersion::new(10, 0).is_supported());
        assert!(OdooVersion::new(18, 0).is_supported());
        assert!(!OdooVersion::new(9, 0).is_supported());
        assert!(!OdooVersion::new(19, 0).is_supported());
    }
}
