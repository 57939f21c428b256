use std::{
    fmt::{self, Debug, Display},
    iter::Sum,
    ops::{Add, AddAssign, Mul, Sub, SubAssign},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// A quantity of bytes. Used for memory budgets, transfer sizes, and
/// progress reporting.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteUnit(u64);

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;

impl ByteUnit {
    pub const ZERO: ByteUnit = ByteUnit(0);
    pub const MAX: ByteUnit = ByteUnit(u64::MAX);

    pub const fn new(bytes: u64) -> Self {
        ByteUnit(bytes)
    }

    pub const fn from_kb(kb: u64) -> Self {
        ByteUnit(kb.saturating_mul(KB))
    }

    pub const fn from_mb(mb: u64) -> Self {
        ByteUnit(mb.saturating_mul(MB))
    }

    pub const fn from_gb(gb: u64) -> Self {
        ByteUnit(gb.saturating_mul(GB))
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn saturating_add(self, other: ByteUnit) -> ByteUnit {
        ByteUnit(self.0.saturating_add(other.0))
    }

    pub const fn saturating_sub(self, other: ByteUnit) -> ByteUnit {
        ByteUnit(self.0.saturating_sub(other.0))
    }

    /// Scales by a float factor, rounding up. Used for memory estimates
    /// derived from expected transfer sizes.
    pub fn scale(self, factor: f64) -> ByteUnit {
        ByteUnit((self.0 as f64 * factor).ceil() as u64)
    }
}

impl Display for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        if b >= GB && b % MB == 0 {
            write!(f, "{:.1}GB", b as f64 / GB as f64)
        } else if b >= MB {
            write!(f, "{:.1}MB", b as f64 / MB as f64)
        } else if b >= KB {
            write!(f, "{:.1}KB", b as f64 / KB as f64)
        } else {
            write!(f, "{b}B")
        }
    }
}

impl Debug for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[derive(Debug, Error)]
#[error("invalid byte unit: {0}")]
pub struct ByteUnitParseErr(String);

impl FromStr for ByteUnit {
    type Err = ByteUnitParseErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, suffix) = s.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| ByteUnitParseErr(s.to_string()))?;
        match suffix.trim().to_ascii_uppercase().as_str() {
            "" | "B" => Ok(ByteUnit::new(value)),
            "KB" | "K" => Ok(ByteUnit::from_kb(value)),
            "MB" | "M" => Ok(ByteUnit::from_mb(value)),
            "GB" | "G" => Ok(ByteUnit::from_gb(value)),
            _ => Err(ByteUnitParseErr(s.to_string())),
        }
    }
}

impl Serialize for ByteUnit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteUnit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = ByteUnit;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a string like \"512MB\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<ByteUnit, E> {
                Ok(ByteUnit::new(v))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ByteUnit, E> {
                v.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

impl Add for ByteUnit {
    type Output = ByteUnit;

    fn add(self, rhs: ByteUnit) -> ByteUnit {
        ByteUnit(self.0 + rhs.0)
    }
}

impl AddAssign for ByteUnit {
    fn add_assign(&mut self, rhs: ByteUnit) {
        self.0 += rhs.0;
    }
}

impl Sub for ByteUnit {
    type Output = ByteUnit;

    fn sub(self, rhs: ByteUnit) -> ByteUnit {
        ByteUnit(self.0 - rhs.0)
    }
}

impl SubAssign for ByteUnit {
    fn sub_assign(&mut self, rhs: ByteUnit) {
        self.0 -= rhs.0;
    }
}

impl Mul<u64> for ByteUnit {
    type Output = ByteUnit;

    fn mul(self, rhs: u64) -> ByteUnit {
        ByteUnit(self.0 * rhs)
    }
}

impl Sum for ByteUnit {
    fn sum<I: Iterator<Item = ByteUnit>>(iter: I) -> ByteUnit {
        iter.fold(ByteUnit::ZERO, |acc, b| acc.saturating_add(b))
    }
}

impl From<u64> for ByteUnit {
    fn from(value: u64) -> Self {
        ByteUnit(value)
    }
}

impl From<usize> for ByteUnit {
    fn from(value: usize) -> Self {
        ByteUnit(value as u64)
    }
}
