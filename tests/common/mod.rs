#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use payrecon::application::Services;
use payrecon::config::Config;
use payrecon::domain::money::Money;
use payrecon::domain::payment::{Gateway, PayerHints, PaymentRecord};
use payrecon::domain::ports::Stores;
use payrecon::domain::registration::{Contact, Registration};
use payrecon::infrastructure::in_memory::in_memory_stores;
use rust_decimal::Decimal;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const PAYMENTS_HEADER: &str =
    "payment_id,gateway,amount,currency,paid_at,payer_name,payer_email,registration_ref,raw_ref";

pub fn may(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, day, hour, 0, 0).unwrap()
}

pub fn payment(
    id: &str,
    amount: Decimal,
    paid_at: DateTime<Utc>,
    name: Option<&str>,
    email: Option<&str>,
) -> PaymentRecord {
    PaymentRecord {
        payment_id: id.to_string(),
        gateway: Gateway::Square,
        amount: Money::new(amount),
        currency: "AUD".to_string(),
        paid_at,
        payer: PayerHints {
            name: name.map(str::to_string),
            email: email.map(str::to_string),
        },
        registration_ref: None,
        raw_ref: None,
        linkage: None,
    }
}

pub fn registration(
    id: &str,
    amount: Decimal,
    created_at: DateTime<Utc>,
    name: &str,
    email: Option<&str>,
) -> Registration {
    Registration {
        registration_id: id.to_string(),
        confirmation_number: format!("IND-{id}"),
        event_name: Some("Grand Banquet".to_string()),
        total_amount: Money::new(amount),
        processing_fees: None,
        created_at,
        contact: Contact {
            name: Some(name.to_string()),
            email: email.map(str::to_string),
            ..Contact::default()
        },
        payment_refs: Vec::new(),
        items: Vec::new(),
    }
}

/// In-memory stores seeded with `registrations`, plus services on the default config.
pub async fn setup(registrations: Vec<Registration>) -> (Stores, Services, Config) {
    let stores = in_memory_stores();
    for registration in registrations {
        stores.registrations.upsert(registration).await.unwrap();
    }
    let mut config = Config::default();
    config.pipeline.retry_backoff_ms = 1;
    let services = Services::new(&stores, &config);
    (stores, services, config)
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

/// One auto-matchable payment (Alice) and one ambiguous one (J Smith).
pub fn sample_payments_csv() -> String {
    format!(
        "{PAYMENTS_HEADER}\n\
         sq_1,square,$150.00,AUD,2025-05-10T09:00:00Z,Alice Brown,alice@example.com,,\n\
         pi_2,stripe,75.50,AUD,2025-05-10T10:00:00Z,J Smith,,,\n"
    )
}

pub fn sample_registrations_json() -> &'static str {
    r#"[
        {
            "registrationId": "reg-1",
            "confirmationNumber": "IND-100",
            "functionName": "Grand Banquet",
            "totalAmountPaid": {"$numberDecimal": "150.00"},
            "createdAt": "2025-05-10T07:00:00Z",
            "bookingContact": {"firstName": "Alice", "lastName": "Brown", "email": "alice@example.com"}
        },
        {
            "registrationId": "reg-john",
            "totalAmountPaid": "200.00",
            "createdAt": "2025-04-30T12:00:00Z",
            "bookingContact": {"firstName": "John", "lastName": "Smith"}
        },
        {
            "registrationId": "reg-jane",
            "totalAmountPaid": "120.00",
            "createdAt": "2025-05-07T12:00:00Z",
            "bookingContact": {"firstName": "Jane", "lastName": "Smith"}
        }
    ]"#
}
