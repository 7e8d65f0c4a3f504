use super::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A party named on an invoice (bill-to or supplier).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    #[serde(default)]
    pub business_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Booking contact of a registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
}

/// An event registration, the reconciliation target of a payment.
///
/// Registrations are owned by the booking system; the pipeline only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub registration_id: String,
    pub confirmation_number: String,
    #[serde(default)]
    pub event_name: Option<String>,
    pub total_amount: Money,
    #[serde(default)]
    pub processing_fees: Option<Money>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub contact: Contact,
    /// Gateway payment ids recorded by the booking flow.
    #[serde(default)]
    pub payment_refs: Vec<String>,
    #[serde(default)]
    pub items: Vec<RegistrationItem>,
}

impl Registration {
    pub fn references_payment(&self, payment_id: &str) -> bool {
        self.payment_refs.iter().any(|r| r == payment_id)
    }

    pub fn bill_to(&self) -> Party {
        Party {
            name: self
                .contact
                .business_name
                .clone()
                .or_else(|| self.contact.name.clone())
                .unwrap_or_else(|| "Unknown Customer".to_string()),
            business_number: None,
            email: self.contact.email.clone(),
            address: self.contact.address.clone(),
        }
    }
}
