//! The backend's opaque 64-bit message/channel/guild identifier, and the
//! creation timestamp it carries in its high bits.
//!
//! Grounded on the bit layout used by
//! `examples/other_examples/b2ed49a6_kebabtent-discord-types-rs__src-types.rs.rs`,
//! trimmed to only the fields DCFS actually consults (timestamp).

use std::fmt;
use std::str::FromStr;

use crate::error::DcfsError;

/// Discord's epoch, in milliseconds since the Unix epoch. The high 42 bits
/// of a snowflake are milliseconds since this instant.
const BACKEND_EPOCH_MS: u64 = 1_420_070_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(u64);

impl Snowflake {
    pub fn new(id: u64) -> Self {
        Snowflake(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Second-granularity creation timestamp: `((id >> 22) + epoch_ms) / 1000`.
    pub fn created_at_secs(&self) -> u64 {
        ((self.0 >> 22) + BACKEND_EPOCH_MS) / 1000
    }

    pub fn worker(&self) -> u8 {
        ((self.0 & 0x3E0000) >> 17) as u8
    }

    pub fn process(&self) -> u8 {
        ((self.0 & 0x1F000) >> 12) as u8
    }

    pub fn increment(&self) -> u16 {
        (self.0 & 0xFFF) as u16
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Snowflake {
    type Err = DcfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Snowflake)
            .map_err(|_| DcfsError::Codec(format!("not a valid snowflake: {s:?}")))
    }
}

impl From<u64> for Snowflake {
    fn from(id: u64) -> Self {
        Snowflake(id)
    }
}

impl From<Snowflake> for u64 {
    fn from(sf: Snowflake) -> Self {
        sf.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_matches_known_snowflake() {
        // A real Discord message id minted 2021-01-01T00:00:00Z-ish.
        let sf = Snowflake::new(175_928_847_299_117_063);
        // ((175928847299117063 >> 22) + 1420070400000) / 1000
        let expected = ((175_928_847_299_117_063u64 >> 22) + BACKEND_EPOCH_MS) / 1000;
        assert_eq!(sf.created_at_secs(), expected);
    }

    #[test]
    fn round_trips_through_string() {
        let sf: Snowflake = "123456789012345".parse().unwrap();
        assert_eq!(sf.value(), 123_456_789_012_345);
        assert_eq!(sf.to_string(), "123456789012345");
    }

    #[test]
    fn rejects_non_numeric() {
        assert!("not-a-number".parse::<Snowflake>().is_err());
    }
}
