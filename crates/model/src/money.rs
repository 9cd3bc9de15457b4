//! Monetary amounts in integer micros of a currency unit.
//!
//! All prices flowing through the router are per-impression amounts kept in
//! micros (millionths of the currency unit) to avoid floating point
//! accounting. The textual form is `<integer><CCY>/<denomination>`, so
//! `100000USD/1M` is 100,000 millionths of a dollar and `40USD/1K` is a
//! 40-dollars-per-mille CPM.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// ISO-4217 style currency code. Only a small set is traded on the exchanges
/// we connect to, but the type is open so new codes parse without a release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Currency(pub [u8; 3]);

impl Default for Currency {
    fn default() -> Self {
        Self::USD
    }
}

impl Serialize for Currency {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        code.parse().map_err(serde::de::Error::custom)
    }
}

impl Currency {
    pub const USD: Self = Self(*b"USD");

    pub fn as_str(&self) -> &str {
        // The parser only admits ASCII uppercase.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(ParseAmountError::Currency(s.to_owned()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }
}

/// An amount of money in micros of one currency unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub currency: Currency,
    pub micros: i64,
}

impl Amount {
    pub const fn zero(currency: Currency) -> Self {
        Self {
            currency,
            micros: 0,
        }
    }

    pub const fn usd_micros(micros: i64) -> Self {
        Self {
            currency: Currency::USD,
            micros,
        }
    }

    /// A USD CPM price: whole currency units per thousand impressions, which
    /// is thousandths of a unit per impression.
    pub const fn usd_cpm(units_per_mille: i64) -> Self {
        Self::usd_micros(units_per_mille * 1_000)
    }

    /// The minimum price increment added to the runner up under second price
    /// clearing.
    pub const fn bid_increment(currency: Currency) -> Self {
        Self { currency, micros: 1 }
    }

    pub fn is_zero(&self) -> bool {
        self.micros == 0
    }

    /// Saturating addition. Mismatched currencies are a programming error and
    /// surface as `None`.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        (self.currency == other.currency).then(|| Self {
            currency: self.currency,
            micros: self.micros.saturating_add(other.micros),
        })
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        (self.currency == other.currency).then(|| Self {
            currency: self.currency,
            micros: self.micros.saturating_sub(other.micros),
        })
    }

    /// Ordering is only defined within one currency.
    pub fn cmp_same_currency(&self, other: &Self) -> Option<std::cmp::Ordering> {
        (self.currency == other.currency).then(|| self.micros.cmp(&other.micros))
    }

    pub fn exceeds(&self, other: &Self) -> bool {
        matches!(
            self.cmp_same_currency(other),
            Some(std::cmp::Ordering::Greater)
        )
    }

    pub fn min_same_currency(self, other: Self) -> Self {
        match self.cmp_same_currency(&other) {
            Some(std::cmp::Ordering::Greater) => other,
            _ => self,
        }
    }

    pub fn max_same_currency(self, other: Self) -> Self {
        match self.cmp_same_currency(&other) {
            Some(std::cmp::Ordering::Less) => other,
            _ => self,
        }
    }

    /// Parses amount expressions of the `<integer><CCY>/<denomination>` form
    /// used on the command line and in configuration, e.g. `100000USD/1M`
    /// (micros) or `40USD/1K` (per-mille). A bare `<integer><CCY>` is whole
    /// currency units.
    pub fn parse_expr(s: &str) -> Result<Self, ParseAmountError> {
        let (amount, denom) = match s.split_once('/') {
            Some((amount, denom)) => (amount, denom),
            None => (s, ""),
        };

        let split = amount
            .find(|c: char| c.is_ascii_uppercase())
            .ok_or_else(|| ParseAmountError::Currency(amount.to_owned()))?;
        let (units, currency) = amount.split_at(split);
        let units: i64 = units
            .parse()
            .map_err(|_| ParseAmountError::Number(units.to_owned()))?;
        let currency: Currency = currency.parse()?;

        let scale = match denom {
            "" => 1_000_000,
            "1K" => 1_000,
            "1M" => 1,
            other => return Err(ParseAmountError::Denomination(other.to_owned())),
        };

        Ok(Self {
            currency,
            micros: units
                .checked_mul(scale)
                .ok_or_else(|| ParseAmountError::Number(amount.to_owned()))?,
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/1M", self.micros, self.currency)
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_expr(s)
    }
}

#[derive(Debug, Error)]
pub enum ParseAmountError {
    #[error("invalid currency code {0:?}")]
    Currency(String),
    #[error("invalid number {0:?}")]
    Number(String),
    #[error("invalid denomination {0:?}, expected 1K or 1M")]
    Denomination(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_amount_expressions() {
        let limit = Amount::parse_expr("100000USD/1M").unwrap();
        assert_eq!(limit, Amount::usd_micros(100_000));
        assert_eq!(limit.to_string(), "100000USD/1M");
        assert_eq!(limit.to_string().parse::<Amount>().unwrap(), limit);

        let cpm = Amount::parse_expr("40USD/1K").unwrap();
        assert_eq!(cpm, Amount::usd_cpm(40));

        let whole = Amount::parse_expr("2USD").unwrap();
        assert_eq!(whole, Amount::usd_micros(2_000_000));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["USD/1M", "100000usd/1M", "100000USD/2M", "x"] {
            assert!(Amount::parse_expr(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn amount_arithmetic_is_currency_checked() {
        let a = Amount::usd_micros(5_000);
        let b = Amount {
            currency: Currency(*b"EUR"),
            micros: 1,
        };
        assert!(a.checked_add(b).is_none());
        assert_eq!(
            a.checked_add(Amount::usd_micros(1)).unwrap(),
            Amount::usd_micros(5_001)
        );
        assert!(Amount::usd_micros(2).exceeds(&Amount::usd_micros(1)));
    }
}
