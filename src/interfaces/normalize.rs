//! Collapses the loosely typed amounts found in gateway exports and booking
//! documents into `Decimal`.
//!
//! Accepted shapes: JSON numbers, strings such as `"$1,250.50"` or
//! `"AUD 150.00"`, and `{"$numberDecimal": "150.00"}` wrappers.

use crate::domain::money::Money;
use crate::error::{ReconcileError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// An amount in any accepted shape, already normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "LooseShape")]
pub struct LooseDecimal(pub Decimal);

impl LooseDecimal {
    pub fn into_money(self) -> Money {
        Money::new(self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseShape {
    Number(serde_json::Number),
    Text(String),
    Wrapped {
        #[serde(rename = "$numberDecimal")]
        value: String,
    },
}

impl TryFrom<LooseShape> for LooseDecimal {
    type Error = ReconcileError;

    fn try_from(shape: LooseShape) -> Result<Self> {
        let raw = match shape {
            LooseShape::Number(n) => n.to_string(),
            LooseShape::Text(s) => s,
            LooseShape::Wrapped { value } => value,
        };
        parse_amount(&raw).map(LooseDecimal)
    }
}

/// Parses a human-formatted amount, ignoring currency symbols, codes and
/// thousands separators.
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic() || c.is_whitespace())
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return Err(ReconcileError::ValidationError(format!(
            "empty amount '{raw}'"
        )));
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|_| ReconcileError::ValidationError(format!("invalid amount '{raw}'")))
}

/// Trims and drops empty strings.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_amount_strips_formatting() {
        assert_eq!(parse_amount("150.00").unwrap(), dec!(150.00));
        assert_eq!(parse_amount(" $1,250.50 ").unwrap(), dec!(1250.50));
        assert_eq!(parse_amount("AUD 75.5").unwrap(), dec!(75.5));
        assert_eq!(parse_amount("-$12.00").unwrap(), dec!(-12.00));
        assert!(parse_amount("").is_err());
        assert!(parse_amount("abc").is_err());
    }

    #[test]
    fn test_every_shape_deserializes_to_the_same_value() {
        let shapes = [
            r#"150.25"#,
            r#""150.25""#,
            r#""$150.25""#,
            r#"{"$numberDecimal": "150.25"}"#,
        ];
        for shape in shapes {
            let parsed: LooseDecimal = serde_json::from_str(shape).unwrap();
            assert_eq!(parsed.0, dec!(150.25), "shape {shape}");
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(serde_json::from_str::<LooseDecimal>(r#""n/a""#).is_err());
        assert!(serde_json::from_str::<LooseDecimal>(r#"{"value": 1}"#).is_err());
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some(" x ".into())), Some("x".into()));
    }
}
