use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Monetary amount with 2 decimal places, stored as integer cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Amount(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("'{0}' is not a decimal amount")]
    Malformed(String),
    #[error("'{0}' has more than 2 decimal places")]
    TooPrecise(String),
}

impl Amount {
    const SCALE: i64 = 100;

    pub fn from_cents(cents: i64) -> Self {
        Amount(cents)
    }

    pub fn from_whole(units: i64) -> Self {
        Amount(units * Self::SCALE)
    }

    pub fn cents(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / Self::SCALE;
        let frac = abs % Self::SCALE;
        write!(f, "{sign}{whole}.{frac:02}")
    }
}

/// Parses `600`, `600.5`, `600.50`, `-12.34` (an optional leading `$` is accepted).
impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AmountError::Malformed(s.to_string());
        let trimmed = s.trim();
        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let rest = rest.strip_prefix('$').unwrap_or(rest);

        let (whole, frac) = match rest.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (rest, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        if frac.len() > 2 {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let whole: i64 = whole.parse().map_err(|_| malformed())?;
        let frac_cents = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| malformed())? * 10,
            _ => frac.parse::<i64>().map_err(|_| malformed())?,
        };
        let cents = whole
            .checked_mul(Self::SCALE)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or_else(malformed)?;

        Ok(Amount(if negative { -cents } else { cents }))
    }
}
