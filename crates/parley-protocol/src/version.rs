//! Protocol versioning for Parley.
//!
//! Clients may announce the version they speak; the gateway refuses
//! clients whose major version differs from [`PROTOCOL_VERSION`].

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Pick the version to speak with a client.
    ///
    /// Returns `None` when the client's major version is not supported.
    #[must_use]
    pub fn negotiate(&self, client: &Version) -> Option<Version> {
        if !self.is_compatible_with(client) {
            return None;
        }
        Some(Version::new(self.major, self.minor.min(client.minor)))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
        let major = major.parse().map_err(|_| "Invalid major version")?;
        let minor = minor.parse().map_err(|_| "Invalid minor version")?;
        Ok(Self::new(major, minor))
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_negotiation() {
        let server = Version::new(1, 2);

        assert_eq!(server.negotiate(&Version::new(1, 0)), Some(Version::new(1, 0)));
        assert_eq!(server.negotiate(&Version::new(1, 5)), Some(Version::new(1, 2)));
        assert_eq!(server.negotiate(&Version::new(2, 0)), None);
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("1.3".parse::<Version>(), Ok(Version::new(1, 3)));
        assert_eq!("2".parse::<Version>(), Ok(Version::new(2, 0)));
        assert!("one.two".parse::<Version>().is_err());
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
