//! Small shared utilities.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A byte count parsed from strings like `500M` or `16K`.
///
/// Units are binary (K = 1024) and an optional trailing `B` is accepted, so
/// `500M`, `500MB` and `524288000` all parse to the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ByteSizeError {
    #[error("empty byte size")]
    Empty,
    #[error("invalid byte size {0:?}")]
    Invalid(String),
}

impl FromStr for ByteSize {
    type Err = ByteSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ByteSizeError::Empty);
        }
        let digits_end = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(digits_end);
        let value: u64 = digits
            .parse()
            .map_err(|_| ByteSizeError::Invalid(s.to_string()))?;
        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" => 1 << 10,
            "M" | "MB" => 1 << 20,
            "G" | "GB" => 1 << 30,
            "T" | "TB" => 1 << 40,
            _ => return Err(ByteSizeError::Invalid(s.to_string())),
        };
        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| ByteSizeError::Invalid(s.to_string()))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [(1 << 40, "T"), (1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
        for (size, suffix) in UNITS {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl From<ByteSize> for usize {
    fn from(size: ByteSize) -> Self {
        size.0 as usize
    }
}
