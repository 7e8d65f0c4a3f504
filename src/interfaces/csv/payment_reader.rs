use crate::domain::payment::{Gateway, PayerHints, PaymentRecord};
use crate::error::{ReconcileError, Result};
use crate::interfaces::normalize::{non_empty, parse_amount};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::io::Read;

/// One row of a gateway export, before normalization.
#[derive(Debug, Deserialize)]
struct PaymentRow {
    payment_id: String,
    gateway: String,
    amount: String,
    #[serde(default)]
    currency: Option<String>,
    paid_at: String,
    #[serde(default)]
    payer_name: Option<String>,
    #[serde(default)]
    payer_email: Option<String>,
    #[serde(default)]
    registration_ref: Option<String>,
    #[serde(default)]
    raw_ref: Option<String>,
}

/// Reads gateway payment exports from a CSV source.
///
/// Wraps `csv::Reader` and yields one normalized `PaymentRecord` per row.
/// Whitespace is trimmed and rows may omit trailing optional columns.
pub struct PaymentReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> PaymentReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and normalizes payments. A malformed row yields an error
    /// without ending the stream.
    pub fn payments(self) -> impl Iterator<Item = Result<PaymentRecord>> {
        self.reader
            .into_deserialize::<PaymentRow>()
            .map(|row| row.map_err(ReconcileError::from).and_then(normalize))
    }
}

fn normalize(row: PaymentRow) -> Result<PaymentRecord> {
    let payment_id = row.payment_id.trim().to_string();
    if payment_id.is_empty() {
        return Err(ReconcileError::ValidationError(
            "payment row without payment_id".to_string(),
        ));
    }
    let amount = parse_amount(&row.amount)?;
    if amount <= rust_decimal::Decimal::ZERO {
        return Err(ReconcileError::ValidationError(format!(
            "payment {payment_id} has non-positive amount {amount}"
        )));
    }
    let Ok(gateway) = row.gateway.parse::<Gateway>();
    Ok(PaymentRecord {
        gateway,
        amount: amount.into(),
        currency: non_empty(row.currency)
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_else(|| "AUD".to_string()),
        paid_at: parse_timestamp(&row.paid_at)?,
        payer: PayerHints {
            name: non_empty(row.payer_name),
            email: non_empty(row.payer_email).map(|e| e.to_lowercase()),
        },
        registration_ref: non_empty(row.registration_ref),
        raw_ref: non_empty(row.raw_ref),
        linkage: None,
        payment_id,
    })
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
        .map_err(|_| ReconcileError::ValidationError(format!("invalid timestamp '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    const HEADER: &str =
        "payment_id,gateway,amount,currency,paid_at,payer_name,payer_email,registration_ref,raw_ref";

    #[test]
    fn test_reader_valid_stream() {
        let data = format!(
            "{HEADER}\n\
             sq_1, Square, $150.00, aud, 2025-05-10T09:00:00Z, Alice Brown, Alice@Example.com,,\n\
             pi_2, stripe, 75.50, , 2025-05-11 10:30:00, J Smith, , reg-9, evt_1"
        );
        let results: Vec<_> = PaymentReader::new(data.as_bytes()).payments().collect();
        assert_eq!(results.len(), 2);

        let first = results[0].as_ref().unwrap();
        assert_eq!(first.gateway, Gateway::Square);
        assert_eq!(first.amount, Money::new(dec!(150.00)));
        assert_eq!(first.currency, "AUD");
        assert_eq!(first.payer.email.as_deref(), Some("alice@example.com"));
        assert!(first.registration_ref.is_none());

        let second = results[1].as_ref().unwrap();
        assert_eq!(second.gateway, Gateway::Stripe);
        assert_eq!(
            second.paid_at,
            Utc.with_ymd_and_hms(2025, 5, 11, 10, 30, 0).unwrap()
        );
        assert_eq!(second.registration_ref.as_deref(), Some("reg-9"));
        assert!(second.payer.email.is_none());
    }

    #[test]
    fn test_reader_malformed_line_does_not_stop_stream() {
        let data = format!(
            "{HEADER}\n\
             sq_1, square, abc, AUD, 2025-05-10T09:00:00Z,,,,\n\
             sq_2, square, 0, AUD, 2025-05-10T09:00:00Z,,,,\n\
             sq_3, square, 10, AUD, yesterday,,,,\n\
             sq_4, square, 10, AUD, 2025-05-10T09:00:00Z,,,,"
        );
        let results: Vec<_> = PaymentReader::new(data.as_bytes()).payments().collect();
        assert_eq!(results.len(), 4);
        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert!(results[2].is_err());
        assert_eq!(results[3].as_ref().unwrap().payment_id, "sq_4");
    }
}
