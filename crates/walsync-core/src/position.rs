//! Write-ahead log positions (LSNs).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A log sequence number: a byte offset into the server's write-ahead log.
///
/// Text form is `X/Y`, the upper and lower 32 bits in hexadecimal, which is
/// what Postgres prints for `pg_lsn` values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Parse a position from its `X/Y` text form.
    pub fn parse(text: &str) -> Result<Self> {
        let (high, low) = text
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidPosition(text.to_string()))?;

        let high =
            u32::from_str_radix(high, 16).map_err(|_| Error::InvalidPosition(text.to_string()))?;
        let low =
            u32::from_str_radix(low, 16).map_err(|_| Error::InvalidPosition(text.to_string()))?;

        Ok(Self(((high as u64) << 32) | low as u64))
    }

    /// Move forward by `delta` bytes of WAL.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<u64> for Position {
    fn from(lsn: u64) -> Self {
        Self(lsn)
    }
}

impl From<Position> for u64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Position::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(Position::parse("0/16B3748").unwrap().as_u64(), 0x16B3748);
        assert_eq!(
            Position::parse("1/16B3748").unwrap().as_u64(),
            0x100000000 + 0x16B3748
        );
        assert!(Position::parse("invalid").is_err());
        assert!(Position::parse("0/").is_err());
        assert!(Position::parse("1/2/3").is_err());
        assert!(Position::parse("100000000/0").is_err());
    }

    #[test]
    fn test_format_position() {
        assert_eq!(Position::new(0x16B3748).to_string(), "0/16B3748");
        assert_eq!(Position::new(0x100000000 + 0x16B3748).to_string(), "1/16B3748");
        assert_eq!(Position::ZERO.to_string(), "0/0");
    }

    #[test]
    fn test_lowercase_hex_accepted() {
        assert_eq!(Position::parse("a/ff").unwrap(), Position::new(0xA_0000_00FF));
    }

    #[test]
    fn test_advance_and_order() {
        let start = Position::parse("0/100").unwrap();
        let next = start.advance(0x20);
        assert_eq!(next.to_string(), "0/120");
        assert!(start < next);
        assert_eq!(Position::new(u64::MAX).advance(1), Position::new(u64::MAX));
    }

    #[test]
    fn test_serde_as_text() {
        let position = Position::new(0x100000010);
        let json = serde_json::to_string(&position).unwrap();
        assert_eq!(json, "\"1/10\"");
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, position);
        assert!(serde_json::from_str::<Position>("\"nope\"").is_err());
    }
}
