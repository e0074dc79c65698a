//! Caller-facing throttle configuration.
//!
//! Rates are written in human units ("1 MiB", "512 kB") and converted to
//! the throttle core's integral units per second here, failing loudly on
//! values the core cannot represent.

use std::num::NonZeroU32;

use byte_unit::Byte;
use serde::{Deserialize, Serialize};

use trickle_throttle::Throttle;

/// Error converting a [`Limit`] to the internal throttle configuration.
#[derive(Debug, thiserror::Error, Clone, Copy)]
pub enum ConversionError {
    /// Value exceeds u32 capacity
    #[error("Throttle value {0} exceeds maximum supported value")]
    ValueTooLarge(Byte),
    /// Value is zero
    #[error("Throttle value must not be zero")]
    Zero,
}

/// Rate limit for one transfer direction.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Limit {
    /// The sustained rate in bytes per second (e.g. "1MB", "512KiB").
    pub bytes_per_second: Byte,
    /// Burst capacity in bytes. Defaults to half a second of traffic at
    /// `bytes_per_second`.
    #[serde(default)]
    pub burst_bytes: Option<Byte>,
}

impl Limit {
    /// A limit of `bytes_per_second` with the default burst.
    #[must_use]
    pub fn per_second(bytes_per_second: Byte) -> Self {
        Self {
            bytes_per_second,
            burst_bytes: None,
        }
    }
}

impl TryFrom<&Limit> for trickle_throttle::Config {
    type Error = ConversionError;

    fn try_from(limit: &Limit) -> Result<Self, Self::Error> {
        let rate = to_units(limit.bytes_per_second)?;
        let burst = match limit.burst_bytes {
            Some(bytes) => Some(to_units(bytes)?),
            None => None,
        };
        Ok(trickle_throttle::Config::Bucket { rate, burst })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_units(bytes: Byte) -> Result<NonZeroU32, ConversionError> {
    let value = bytes.as_u128();
    if value > u128::from(u32::MAX) {
        return Err(ConversionError::ValueTooLarge(bytes));
    }
    NonZeroU32::new(value as u32).ok_or(ConversionError::Zero)
}

/// Per-direction throttle configuration for a wrapped stream.
///
/// A missing direction is unlimited: requests pass through immediately and
/// only the running total is kept.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Limit on the receive direction.
    #[serde(default)]
    pub read: Option<Limit>,
    /// Limit on the send direction.
    #[serde(default)]
    pub write: Option<Limit>,
}

impl Config {
    /// Build the receive-direction throttle.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured values do not fit the throttle
    /// core's range.
    pub fn read_throttle(&self) -> Result<Throttle, ConversionError> {
        build(self.read.as_ref())
    }

    /// Build the send-direction throttle.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured values do not fit the throttle
    /// core's range.
    pub fn write_throttle(&self) -> Result<Throttle, ConversionError> {
        build(self.write.as_ref())
    }
}

fn build(limit: Option<&Limit>) -> Result<Throttle, ConversionError> {
    match limit {
        None => Ok(Throttle::unlimited()),
        Some(limit) => Ok(Throttle::new_with_config(limit.try_into()?)),
    }
}

#[cfg(test)]
mod test {
    use byte_unit::Byte;

    use super::{Config, Limit};
    use crate::throttle;

    #[test]
    fn limits_deserialize_from_human_units() {
        let config: Config = serde_json::from_str(
            r#"{"read": {"bytes_per_second": "1 MiB"}, "write": {"bytes_per_second": "512 KiB", "burst_bytes": "64 KiB"}}"#,
        )
        .unwrap();

        let read = config.read.unwrap();
        assert_eq!(read.bytes_per_second.as_u128(), 1_048_576);
        assert!(read.burst_bytes.is_none());

        let write = config.write.unwrap();
        assert_eq!(write.bytes_per_second.as_u128(), 524_288);
        assert_eq!(write.burst_bytes.unwrap().as_u128(), 65_536);
    }

    #[test]
    fn missing_direction_is_unlimited() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.read_throttle().unwrap().is_unlimited());
        assert!(config.write_throttle().unwrap().is_unlimited());
    }

    #[test]
    fn oversized_rate_is_rejected() {
        let limit = Limit::per_second(Byte::from_u64(u64::from(u32::MAX) + 1));
        assert!(throttle::Config::try_from(&limit).is_err());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let limit = Limit::per_second(Byte::from_u64(0));
        assert!(throttle::Config::try_from(&limit).is_err());
    }
}
