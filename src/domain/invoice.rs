use super::money::Money;
use super::registration::Party;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceType {
    Customer,
    Supplier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl LineItem {
    pub fn amount(&self) -> Money {
        (self.unit_price * rust_decimal::Decimal::from(self.quantity)).round2()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_number: String,
    pub invoice_type: InvoiceType,
    pub issued_at: DateTime<Utc>,
    pub bill_to: Party,
    pub supplier: Party,
    pub items: Vec<LineItem>,
    pub subtotal: Money,
    pub processing_fees: Money,
    pub total: Money,
    pub gst_included: Money,
    pub payment_id: String,
    pub registration_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoicePairStatus {
    Active,
    Superseded,
}

/// Customer and supplier invoices issued together for one payment/registration.
///
/// At most one `Active` pair exists per idempotency key. A regenerate inserts a
/// new pair and flips the previous one to `Superseded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePair {
    pub pair_id: Uuid,
    pub payment_id: String,
    pub registration_id: String,
    pub customer: Invoice,
    pub supplier: Invoice,
    pub transaction_ids: Vec<u64>,
    pub status: InvoicePairStatus,
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl InvoicePair {
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(&self.payment_id, &self.registration_id)
    }
}

/// The (payment id, registration id) pair that guards against double issuance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub payment_id: String,
    pub registration_id: String,
}

impl IdempotencyKey {
    pub fn new(payment_id: &str, registration_id: &str) -> Self {
        Self {
            payment_id: payment_id.to_string(),
            registration_id: registration_id.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}\u{1f}{}", self.payment_id, self.registration_id)
    }
}

/// Ledger row for one invoice line. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: u64,
    pub pair_id: Uuid,
    pub invoice_number: String,
    pub invoice_type: InvoiceType,
    pub payment_id: String,
    pub registration_id: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}
