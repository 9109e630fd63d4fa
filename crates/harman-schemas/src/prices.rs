//! The dollar-string ↔ integer-cents conversion pair.
//!
//! Binary contracts trade strictly inside (0, 1) dollars. The wire carries
//! decimal strings; storage and arithmetic use integer cents. Keeping both
//! directions here prevents the two representations from drifting.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// A wire price could not be converted to valid integer cents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    /// Not a decimal number at all.
    Malformed(String),
    /// Finer than one cent, e.g. `"0.455"`.
    SubCentPrecision(String),
    /// Outside (0, 1) exclusive; the binary bounds 0 and 1 are invalid.
    OutOfRange(String),
}

impl fmt::Display for PriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceError::Malformed(s) => write!(f, "malformed price {s:?}"),
            PriceError::SubCentPrecision(s) => {
                write!(f, "price {s:?} has sub-cent precision")
            }
            PriceError::OutOfRange(s) => {
                write!(f, "price {s:?} outside (0, 1) exclusive")
            }
        }
    }
}

impl std::error::Error for PriceError {}

/// Parse a wire dollar string into integer cents, enforcing the binary
/// price domain `0 < cents < 100`.
pub fn parse_price_dollars(s: &str) -> Result<i32, PriceError> {
    let d = Decimal::from_str(s.trim()).map_err(|_| PriceError::Malformed(s.to_string()))?;

    let cents = d
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or_else(|| PriceError::Malformed(s.to_string()))?;
    if cents.fract() != Decimal::ZERO {
        return Err(PriceError::SubCentPrecision(s.to_string()));
    }

    let cents = cents
        .to_i32()
        .ok_or_else(|| PriceError::OutOfRange(s.to_string()))?;
    if cents <= 0 || cents >= 100 {
        return Err(PriceError::OutOfRange(s.to_string()));
    }
    Ok(cents)
}

/// Render integer cents as the canonical wire dollar string (`45` → `"0.45"`).
pub fn format_price_cents(cents: i32) -> String {
    format!("0.{:02}", cents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_prices() {
        assert_eq!(parse_price_dollars("0.45").unwrap(), 45);
        assert_eq!(parse_price_dollars("0.01").unwrap(), 1);
        assert_eq!(parse_price_dollars("0.99").unwrap(), 99);
        assert_eq!(parse_price_dollars("0.5").unwrap(), 50);
        assert_eq!(parse_price_dollars(" 0.30 ").unwrap(), 30);
    }

    #[test]
    fn rejects_binary_bounds() {
        assert_eq!(
            parse_price_dollars("0"),
            Err(PriceError::OutOfRange("0".to_string()))
        );
        assert_eq!(
            parse_price_dollars("0.00"),
            Err(PriceError::OutOfRange("0.00".to_string()))
        );
        assert_eq!(
            parse_price_dollars("1.00"),
            Err(PriceError::OutOfRange("1.00".to_string()))
        );
        assert_eq!(
            parse_price_dollars("1.50"),
            Err(PriceError::OutOfRange("1.50".to_string()))
        );
        assert_eq!(
            parse_price_dollars("-0.10"),
            Err(PriceError::OutOfRange("-0.10".to_string()))
        );
    }

    #[test]
    fn rejects_sub_cent_precision() {
        assert_eq!(
            parse_price_dollars("0.455"),
            Err(PriceError::SubCentPrecision("0.455".to_string()))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_price_dollars("forty five cents"),
            Err(PriceError::Malformed(_))
        ));
        assert!(matches!(parse_price_dollars(""), Err(PriceError::Malformed(_))));
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(format_price_cents(45), "0.45");
        assert_eq!(format_price_cents(5), "0.05");
        assert_eq!(format_price_cents(99), "0.99");
    }

    #[test]
    fn round_trips() {
        for cents in 1..100 {
            let wire = format_price_cents(cents);
            assert_eq!(parse_price_dollars(&wire).unwrap(), cents);
        }
    }
}
