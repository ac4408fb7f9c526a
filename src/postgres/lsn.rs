//! Log sequence numbers.
//!
//! An [`Lsn`] is a 64-bit byte position in the write-ahead log. PostgreSQL
//! renders it as two upper-case hexadecimal 32-bit halves separated by `/`,
//! e.g. `16/B374D848`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Position `len` bytes past this one, saturating at the maximum.
    pub fn advance(self, len: usize) -> Self {
        Lsn(self.0.saturating_add(len as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN '{0}', expected two hexadecimal halves like 16/B374D848")]
pub struct ParseLsnError(String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ParseLsnError(s.to_string()))?;

        let high = u32::from_str_radix(high, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| ParseLsnError(s.to_string()))?;

        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
