//! Changelog versions: dotted numeric identifiers with two or three components.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{Result, StrataError};

/// A parsed changelog version such as `1.2` or `1.2.3`.
///
/// Ordering is numeric per segment; a missing third segment counts as zero,
/// so `1.2` and `1.2.0` compare equal.
#[derive(Debug, Clone)]
pub struct Version {
    pub segments: Vec<u64>,
    pub raw: String,
}

impl Version {
    /// Parse `x.y` or `x.y.z`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StrataError::InvalidChangelog(
                "Version string is empty".to_string(),
            ));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(StrataError::InvalidChangelog(format!(
                "Wrong version format '{}'. Must be x.y or x.y.z",
                raw
            )));
        }

        let mut segments = Vec::with_capacity(parts.len());
        for part in parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(StrataError::InvalidChangelog(format!(
                    "Invalid version segment '{}' in '{}'",
                    part, raw
                )));
            }
            let value = part.parse::<u64>().map_err(|e| {
                StrataError::InvalidChangelog(format!(
                    "Invalid version segment in '{}': {}",
                    raw, e
                ))
            })?;
            segments.push(value);
        }

        Ok(Version {
            segments,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Version {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let max_len = self.segments.len().max(other.segments.len());
        for i in 0..max_len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}
