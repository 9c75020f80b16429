//! Lease statistic counters.
//!
//! Kea reports counters that may exceed the signed 64-bit range, and the
//! numeric values must round-trip through JSON without precision loss:
//! JSON consumers parse number literals as double-precision floats, which
//! are exact only up to 2^53 - 1. Counters therefore serialize as decimal
//! strings and parse back into `i128`, the widest integer type available.
//! Kea uses `-1` to mark a counter whose value overflowed its own range;
//! that sentinel propagates as NaN through utilization math.

use std::collections::BTreeMap;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The invalid-value sentinel reported by Kea.
const INVALID: i128 = -1;

/// A single statistic counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatValue(i128);

impl StatValue {
    pub fn new(value: i128) -> Self {
        StatValue(value)
    }

    pub fn invalid() -> Self {
        StatValue(INVALID)
    }

    pub fn get(&self) -> i128 {
        self.0
    }

    /// True when this counter carries the Kea overflow sentinel.
    pub fn is_invalid(&self) -> bool {
        self.0 == INVALID
    }

    /// The value as a float for aggregation; NaN when invalid.
    pub fn as_f64(&self) -> f64 {
        if self.is_invalid() {
            f64::NAN
        } else {
            self.0 as f64
        }
    }
}

impl From<i64> for StatValue {
    fn from(value: i64) -> Self {
        StatValue(value as i128)
    }
}

impl From<u64> for StatValue {
    fn from(value: u64) -> Self {
        StatValue(value as i128)
    }
}

impl Serialize for StatValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for StatValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StatValueVisitor;

        impl Visitor<'_> for StatValueVisitor {
            type Value = StatValue;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an integer or a decimal string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<StatValue, E> {
                Ok(StatValue(v as i128))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<StatValue, E> {
                Ok(StatValue(v as i128))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<StatValue, E> {
                // Kea only emits integral values; a fractional part here is
                // a malformed feed.
                if v.fract() != 0.0 || !v.is_finite() {
                    return Err(E::custom(format!("not an integral counter: {v}")));
                }
                Ok(StatValue(v as i128))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<StatValue, E> {
                v.parse::<i128>()
                    .map(StatValue)
                    .map_err(|_| E::custom(format!("not a decimal counter: {v:?}")))
            }
        }

        deserializer.deserialize_any(StatValueVisitor)
    }
}

/// Open keyed map of counters for one subnet or local subnet.
/// Key semantics are the stable Kea statistic names
/// (`total-addresses`, `assigned-nas`, `total-pds`, ...).
pub type SubnetStats = BTreeMap<String, StatValue>;
