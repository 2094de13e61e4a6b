//! Fixed-point credit amounts.
//!
//! Every credit, token, acreage and price value is held as an integer count of
//! nano-units (9 decimal places). Binary floats only appear at the input
//! boundary (JSON numbers from collaborators) and are converted once.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimal places carried by [`Amount`].
pub const DECIMALS: u32 = 9;
/// Nano-units per whole unit.
pub const UNIT: u64 = 1_000_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")]
    Empty,
    #[error("not a number: {0}")]
    Invalid(String),
    #[error("amount must not be negative")]
    Negative,
    #[error("amount must be finite")]
    NotFinite,
    #[error("more than {DECIMALS} decimal places")]
    Precision,
    #[error("amount out of range")]
    Overflow,
}

/// Non-negative fixed-point decimal with 9 fractional digits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    /// Largest amount the store can hold (SQLite INTEGER is i64).
    pub const MAX: Amount = Amount(i64::MAX as u64);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn nanos(self) -> u64 {
        self.0
    }

    pub fn from_whole(units: u64) -> Result<Self, AmountError> {
        units
            .checked_mul(UNIT)
            .filter(|n| *n <= Self::MAX.0)
            .map(Self)
            .ok_or(AmountError::Overflow)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0
            .checked_add(rhs.0)
            .filter(|n| *n <= Self::MAX.0)
            .map(Self)
    }

    pub fn saturating_add(self, rhs: Amount) -> Amount {
        self.checked_add(rhs).unwrap_or(Self::MAX)
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Multiply by an integer factor (e.g. the tokenisation multiplier).
    pub fn checked_mul(self, factor: u64) -> Option<Amount> {
        self.0
            .checked_mul(factor)
            .filter(|n| *n <= Self::MAX.0)
            .map(Self)
    }

    /// Truncating integer division, used for per-day averages.
    pub fn div_floor(self, divisor: u64) -> Amount {
        if divisor == 0 {
            return Self::ZERO;
        }
        Self(self.0 / divisor)
    }

    /// Convert a binary float from an external source. Rounds to the nearest nano-unit.
    pub fn from_f64(value: f64) -> Result<Self, AmountError> {
        if !value.is_finite() {
            return Err(AmountError::NotFinite);
        }
        if value < 0.0 {
            return Err(AmountError::Negative);
        }
        let formatted = format!("{:.*}", DECIMALS as usize, value);
        parse_decimal(&formatted)
    }

    /// Parse a JSON value: decimal strings and numbers are accepted.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, AmountError> {
        match value {
            serde_json::Value::Number(n) => n.to_string().parse(),
            serde_json::Value::String(s) => s.parse(),
            serde_json::Value::Null => Err(AmountError::Empty),
            other => Err(AmountError::Invalid(other.to_string())),
        }
    }

    /// Float view for presentation only.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / UNIT as f64
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        match parse_decimal(s) {
            Ok(a) => Ok(a),
            Err(AmountError::Invalid(_)) if s.contains(['e', 'E']) => {
                let f: f64 = s
                    .parse()
                    .map_err(|_| AmountError::Invalid(s.to_string()))?;
                Self::from_f64(f)
            }
            Err(e) => Err(e),
        }
    }
}

/// Plain decimal notation: optional sign, digits, optional fraction.
fn parse_decimal(s: &str) -> Result<Amount, AmountError> {
    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let lowered = body.to_ascii_lowercase();
    if lowered == "inf" || lowered == "infinity" || lowered == "nan" {
        return Err(AmountError::NotFinite);
    }
    let (whole, frac) = match body.split_once('.') {
        Some((w, f)) => (w, f),
        None => (body, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::Invalid(s.to_string()));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Invalid(s.to_string()));
    }
    let frac = frac.trim_end_matches('0');
    if frac.len() > DECIMALS as usize {
        return Err(AmountError::Precision);
    }
    let whole_units: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| AmountError::Overflow)?
    };
    let frac_nanos: u64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = DECIMALS as usize);
        padded
            .parse()
            .map_err(|_| AmountError::Invalid(s.to_string()))?
    };
    let nanos = whole_units
        .checked_mul(UNIT)
        .and_then(|n| n.checked_add(frac_nanos))
        .filter(|n| *n <= Amount::MAX.0)
        .ok_or(AmountError::Overflow)?;
    if negative && nanos > 0 {
        return Err(AmountError::Negative);
    }
    Ok(Amount(nanos))
}

impl fmt::Display for Amount {
    /// Shortest exact decimal form: `20`, `12.5`, `0.000000001`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNIT;
        let frac = self.0 % UNIT;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let digits = format!("{:0width$}", frac, width = DECIMALS as usize);
        write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Amount::from_json(&value).map_err(serde::de::Error::custom)
    }
}

impl ToSql for Amount {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let v = i64::try_from(self.0)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(v))
    }
}

impl FromSql for Amount {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let v = i64::column_result(value)?;
        u64::try_from(v)
            .map(Amount)
            .map_err(|_| FromSqlError::OutOfRange(v))
    }
}
