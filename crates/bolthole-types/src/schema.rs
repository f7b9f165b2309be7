//! Schema version parsing and ordering
//!
//! Wire versions in the field are short dotted numbers (`"1.0"`, `"2.0"`,
//! `"2.1"`), which are not valid semver, so this is a local type with a
//! total order over (major, minor, patch). `Display` re-emits the exact
//! string that was parsed, since the version travels inside signed
//! payloads.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to parse schema version {0:?}")]
pub struct ParseVersionError(pub String);

/// A dotted schema version with one to three numeric segments
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    major: u64,
    minor: u64,
    patch: u64,
    raw: String,
}

impl SchemaVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        let raw = format!("{major}.{minor}.{patch}");
        Self {
            major,
            minor,
            patch,
            raw,
        }
    }

    pub fn parts(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for SchemaVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseVersionError(s.to_string()));
        }

        let mut segments = [0u64; 3];
        let mut count = 0;
        for part in trimmed.split('.') {
            if count == 3 {
                return Err(ParseVersionError(s.to_string()));
            }
            segments[count] = part
                .parse::<u64>()
                .map_err(|_| ParseVersionError(s.to_string()))?;
            count += 1;
        }

        Ok(Self {
            major: segments[0],
            minor: segments[1],
            patch: segments[2],
            raw: trimmed.to_string(),
        })
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts() == other.parts()
    }
}

impl Eq for SchemaVersion {}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts().cmp(&other.parts())
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
