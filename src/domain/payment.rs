use super::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External processor that supplied a payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gateway {
    Square,
    Stripe,
    #[serde(untagged)]
    Other(String),
}

impl Gateway {
    pub fn as_str(&self) -> &str {
        match self {
            Gateway::Square => "square",
            Gateway::Stripe => "stripe",
            Gateway::Other(name) => name,
        }
    }
}

impl std::str::FromStr for Gateway {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "square" => Gateway::Square,
            "stripe" => Gateway::Stripe,
            other => Gateway::Other(other.to_string()),
        })
    }
}

/// Who paid, as far as the gateway knows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayerHints {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Matching and invoicing results attached to a persisted payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentLinkage {
    pub registration_id: String,
    pub confidence: f64,
    pub customer_invoice_number: String,
    pub supplier_invoice_number: String,
}

/// A normalized payment as produced by the ingestion adapter.
///
/// `payment_id` is the gateway-assigned identifier and the unique key of the
/// payment store. Only `linkage` is ever written after the first insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub gateway: Gateway,
    pub amount: Money,
    pub currency: String,
    pub paid_at: DateTime<Utc>,
    #[serde(default)]
    pub payer: PayerHints,
    /// Registration id carried in the gateway metadata, if any.
    #[serde(default)]
    pub registration_ref: Option<String>,
    #[serde(default)]
    pub raw_ref: Option<String>,
    #[serde(default)]
    pub linkage: Option<PaymentLinkage>,
}

/// Inclusive time range used to filter adapter reads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn unbounded() -> Self {
        Self {
            from: None,
            to: None,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gateway_parse_is_case_insensitive() {
        assert_eq!("Square".parse::<Gateway>().unwrap(), Gateway::Square);
        assert_eq!(" STRIPE ".parse::<Gateway>().unwrap(), Gateway::Stripe);
        assert_eq!(
            "paypal".parse::<Gateway>().unwrap(),
            Gateway::Other("paypal".to_string())
        );
    }

    #[test]
    fn test_date_range_bounds_are_inclusive() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let range = DateRange {
            from: Some(from),
            to: Some(to),
        };
        assert!(range.contains(from));
        assert!(range.contains(to));
        assert!(!range.contains(to + chrono::Duration::seconds(1)));
        assert!(DateRange::unbounded().contains(from));
    }
}
