//! Kext version codec.
//!
//! Versions have the form `major[.minor[.revision]][stage[level]]` where
//! stage is one of `d` (development), `a` (alpha), `b` (beta) or `f`/`fc`
//! (final candidate). They are encoded into a single signed integer whose
//! numeric order is the version order:
//!
//! ```text
//! major * 10^8 + minor * 10^6 + revision * 10^4 + stage * 10^3 + level
//! ```
//!
//! A release has stage 9 and level 0, so `1.0` sorts after `1.0fc3`.
//! Malformed strings map to [`Version::INVALID`] when using the raw API.

use crate::error::VersionError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Identifier and version strings must fit in a kmod name buffer.
pub const KMOD_MAX_NAME: usize = 64;

const MAJOR_MULT: i64 = 100_000_000;
const MINOR_MULT: i64 = 1_000_000;
const REVISION_MULT: i64 = 10_000;
const STAGE_MULT: i64 = 1_000;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d{1,4})(?:\.(\d{1,2})(?:\.(\d{1,2}))?)?(?:(fc|d|a|b|f)(\d{1,3}))?\s*$")
        .expect("static version regex")
});

/// Release stage of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Development = 1,
    Alpha = 3,
    Beta = 5,
    Candidate = 7,
    Release = 9,
}

impl Stage {
    fn from_code(code: i64) -> Option<Stage> {
        match code {
            1 => Some(Stage::Development),
            3 => Some(Stage::Alpha),
            5 => Some(Stage::Beta),
            7 => Some(Stage::Candidate),
            9 => Some(Stage::Release),
            _ => None,
        }
    }

    fn from_marker(marker: &str) -> Option<Stage> {
        match marker {
            "d" => Some(Stage::Development),
            "a" => Some(Stage::Alpha),
            "b" => Some(Stage::Beta),
            "f" | "fc" => Some(Stage::Candidate),
            _ => None,
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            Stage::Development => "d",
            Stage::Alpha => "a",
            Stage::Beta => "b",
            Stage::Candidate => "fc",
            Stage::Release => "",
        }
    }
}

/// An encoded, totally ordered kext version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(i64);

impl Version {
    /// Sentinel produced by [`Version::parse_raw`] for malformed input.
    pub const INVALID: i64 = -1;

    /// Parse a version string.
    pub fn parse(s: &str) -> Result<Version, VersionError> {
        if s.len() > KMOD_MAX_NAME - 1 {
            return Err(VersionError::TooLong {
                value: s.to_string(),
                len: s.len(),
                max: KMOD_MAX_NAME - 1,
            });
        }
        let caps = VERSION_RE
            .captures(s)
            .ok_or_else(|| VersionError::Malformed(s.to_string()))?;

        let number = |index: usize| -> i64 {
            caps.get(index)
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .unwrap_or(0)
        };

        let major = number(1);
        let minor = number(2);
        let revision = number(3);

        let (stage, level) = match caps.get(4) {
            Some(marker) => {
                let stage = Stage::from_marker(marker.as_str())
                    .ok_or_else(|| VersionError::Malformed(s.to_string()))?;
                let level = number(5);
                if level == 0 || level > 255 {
                    return Err(VersionError::Malformed(s.to_string()));
                }
                (stage, level)
            }
            None => (Stage::Release, 0),
        };

        Ok(Version(
            major * MAJOR_MULT
                + minor * MINOR_MULT
                + revision * REVISION_MULT
                + (stage as i64) * STAGE_MULT
                + level,
        ))
    }

    /// Parse to the raw encoding, returning [`Version::INVALID`] on failure.
    pub fn parse_raw(s: &str) -> i64 {
        Version::parse(s).map(|v| v.0).unwrap_or(Version::INVALID)
    }

    /// Rebuild a version from its raw encoding.
    pub fn from_raw(raw: i64) -> Option<Version> {
        if raw < 0 {
            return None;
        }
        let version = Version(raw);
        Stage::from_code(version.stage_code())?;
        Some(version)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn major(&self) -> i64 {
        self.0 / MAJOR_MULT
    }

    pub fn minor(&self) -> i64 {
        (self.0 % MAJOR_MULT) / MINOR_MULT
    }

    pub fn revision(&self) -> i64 {
        (self.0 % MINOR_MULT) / REVISION_MULT
    }

    fn stage_code(&self) -> i64 {
        (self.0 % REVISION_MULT) / STAGE_MULT
    }

    pub fn stage(&self) -> Stage {
        Stage::from_code(self.stage_code()).unwrap_or(Stage::Release)
    }

    pub fn stage_level(&self) -> i64 {
        self.0 % STAGE_MULT
    }
}

impl fmt::Display for Version {
    /// Canonical form: `major.minor`, `.revision` only when nonzero, then the
    /// stage marker and level for prereleases.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())?;
        if self.revision() != 0 {
            write!(f, ".{}", self.revision())?;
        }
        let stage = self.stage();
        if stage != Stage::Release {
            write!(f, "{}{}", stage.marker(), self.stage_level())?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}
