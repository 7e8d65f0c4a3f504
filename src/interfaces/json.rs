//! Loader for registration snapshots exported from the booking system.
//!
//! The export is a JSON array of booking documents with camelCase fields.
//! Amounts may be numbers, strings or `$numberDecimal` wrappers.

use crate::domain::registration::{Contact, Registration, RegistrationItem};
use crate::error::{ReconcileError, Result};
use crate::interfaces::normalize::{LooseDecimal, non_empty};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRegistration {
    #[serde(alias = "id")]
    registration_id: String,
    #[serde(default)]
    confirmation_number: Option<String>,
    #[serde(default, alias = "eventName")]
    function_name: Option<String>,
    #[serde(alias = "totalAmount", alias = "total")]
    total_amount_paid: LooseDecimal,
    #[serde(default)]
    processing_fees: Option<LooseDecimal>,
    #[serde(alias = "registrationDate")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    booking_contact: Option<RawContact>,
    #[serde(default)]
    square_payment_id: Option<String>,
    #[serde(default)]
    stripe_payment_intent_id: Option<String>,
    #[serde(default)]
    items: Vec<RawItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContact {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default, alias = "emailAddress")]
    email: Option<String>,
    #[serde(default)]
    business_name: Option<String>,
    #[serde(default, alias = "addressLine")]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
    description: String,
    #[serde(default = "one")]
    quantity: u32,
    #[serde(alias = "price")]
    unit_price: LooseDecimal,
}

fn one() -> u32 {
    1
}

impl From<RawRegistration> for Registration {
    fn from(raw: RawRegistration) -> Self {
        let contact = raw.booking_contact.unwrap_or_default();
        let name = [non_empty(contact.first_name), non_empty(contact.last_name)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        let payment_refs = [raw.square_payment_id, raw.stripe_payment_intent_id]
            .into_iter()
            .filter_map(non_empty)
            .collect();
        Registration {
            confirmation_number: non_empty(raw.confirmation_number)
                .unwrap_or_else(|| raw.registration_id.clone()),
            registration_id: raw.registration_id,
            event_name: non_empty(raw.function_name),
            total_amount: raw.total_amount_paid.into_money().round2(),
            processing_fees: raw.processing_fees.map(|f| f.into_money().round2()),
            created_at: raw.created_at,
            contact: Contact {
                name: Some(name).filter(|n| !n.is_empty()),
                email: non_empty(contact.email).map(|e| e.to_lowercase()),
                business_name: non_empty(contact.business_name),
                address: non_empty(contact.address),
            },
            payment_refs,
            items: raw
                .items
                .into_iter()
                .map(|item| RegistrationItem {
                    description: item.description,
                    quantity: item.quantity,
                    unit_price: item.unit_price.into_money(),
                })
                .collect(),
        }
    }
}

/// Parses a JSON array of registrations.
pub fn read_registrations<R: Read>(source: R) -> Result<Vec<Registration>> {
    let raw: Vec<RawRegistration> = serde_json::from_reader(source)?;
    let registrations: Vec<Registration> = raw.into_iter().map(Registration::from).collect();
    if let Some(bad) = registrations.iter().find(|r| r.registration_id.trim().is_empty()) {
        return Err(ReconcileError::ValidationError(format!(
            "registration with empty id (confirmation {})",
            bad.confirmation_number
        )));
    }
    Ok(registrations)
}

pub fn load_registrations(path: &Path) -> Result<Vec<Registration>> {
    let file = std::fs::File::open(path)?;
    read_registrations(std::io::BufReader::new(file))
}
