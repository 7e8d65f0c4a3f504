use super::batch::ImportBatch;
use super::invoice::{IdempotencyKey, InvoicePair, Transaction};
use super::money::Money;
use super::payment::{DateRange, PayerHints, PaymentLinkage, PaymentRecord};
use super::registration::Registration;
use super::review::{FailedImportRecord, PendingImportRecord, ReviewAction};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Persisted payments, unique by gateway payment id.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn exists(&self, payment_id: &str) -> Result<bool>;
    /// Fails with `DuplicatePayment` when the id is already stored.
    async fn insert(&self, payment: PaymentRecord) -> Result<()>;
    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>>;
    async fn attach_linkage(&self, payment_id: &str, linkage: PaymentLinkage) -> Result<()>;
    async fn get_all(&self) -> Result<Vec<PaymentRecord>>;
}

/// Read side of the booking system's registrations.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn upsert(&self, registration: Registration) -> Result<()>;
    async fn get(&self, registration_id: &str) -> Result<Option<Registration>>;
    /// Registrations that recorded `payment_id` as their gateway payment.
    async fn find_by_payment_ref(&self, payment_id: &str) -> Result<Vec<Registration>>;
    async fn find_by_amount_window(
        &self,
        amount: Money,
        tolerance: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Registration>>;
    /// Registrations whose contact shares a name token or the email with `payer`.
    async fn find_by_party(&self, payer: &PayerHints) -> Result<Vec<Registration>>;
}

/// Pending queue, terminal failed store and the review action log.
///
/// Every mutation of a pending record is a compare-and-swap on its
/// `attempts` counter and fails with `ReviewTransitionConflict` on mismatch.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Returns false if the payment already has an active record.
    async fn insert_pending(&self, record: PendingImportRecord) -> Result<bool>;
    async fn get_pending(&self, payment_id: &str) -> Result<Option<PendingImportRecord>>;
    /// All pending records, oldest `pending_since` first.
    async fn list_pending(&self) -> Result<Vec<PendingImportRecord>>;
    async fn replace_pending(
        &self,
        record: PendingImportRecord,
        expected_attempts: u32,
    ) -> Result<()>;
    async fn remove_pending(
        &self,
        payment_id: &str,
        expected_attempts: u32,
    ) -> Result<PendingImportRecord>;
    /// Removes the pending record and stores it as failed in one step.
    async fn fail_pending(&self, failed: FailedImportRecord, expected_attempts: u32) -> Result<()>;
    async fn get_failed(&self, payment_id: &str) -> Result<Option<FailedImportRecord>>;
    async fn list_failed(&self) -> Result<Vec<FailedImportRecord>>;
    async fn append_action(&self, action: ReviewAction) -> Result<()>;
    async fn actions_for(&self, payment_id: &str) -> Result<Vec<ReviewAction>>;
}

/// Invoice pairs and their ledger rows.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn find_active(&self, key: &IdempotencyKey) -> Result<Option<InvoicePair>>;
    async fn get_pair(&self, pair_id: Uuid) -> Result<Option<InvoicePair>>;
    async fn pairs_for(&self, key: &IdempotencyKey) -> Result<Vec<InvoicePair>>;
    /// Enforces one active pair per key. A pair whose `supersedes` names the
    /// current active pair replaces it; anything else fails with `DuplicateInvoice`.
    /// This is the commit point of an issuance: ledger rows are written first.
    async fn insert_pair(&self, pair: InvoicePair) -> Result<()>;
    async fn insert_transaction(&self, transaction: Transaction) -> Result<()>;
    async fn delete_transactions(&self, transaction_ids: &[u64]) -> Result<()>;
    async fn transactions_for(&self, pair_id: Uuid) -> Result<Vec<Transaction>>;
}

/// Named integer cells with an atomic increment-and-fetch.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `name` and returns the new value; a missing cell starts at 1.
    async fn increment(&self, name: &str) -> Result<u64>;
    async fn reset(&self, name: &str, value: u64) -> Result<()>;
    async fn current(&self, name: &str) -> Result<Option<u64>>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn save(&self, batch: ImportBatch) -> Result<()>;
    async fn get(&self, batch_id: Uuid) -> Result<Option<ImportBatch>>;
    async fn get_all(&self) -> Result<Vec<ImportBatch>>;
}

/// One page of normalized payments from an ingestion adapter.
#[derive(Debug, Clone, Default)]
pub struct PaymentPage {
    pub payments: Vec<PaymentRecord>,
    pub next_cursor: Option<String>,
}

/// Normalized view over one or more payment gateways.
///
/// Reading from any cursor previously returned must be safe to repeat.
#[async_trait]
pub trait PaymentSource: Send + Sync {
    fn name(&self) -> &str;
    async fn list_payments(&self, range: &DateRange, cursor: Option<&str>) -> Result<PaymentPage>;
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Extension, without the dot, of the documents this renderer produces.
    fn file_extension(&self) -> &str;
    async fn render(&self, pair: &InvoicePair) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `path` and returns a URL to it.
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub file_name: String,
    pub url: String,
}

#[async_trait]
pub trait EmailClient: Send + Sync {
    async fn send(&self, to: &str, subject: &str, attachments: &[Attachment]) -> Result<()>;
}

pub type PaymentStoreArc = Arc<dyn PaymentStore>;
pub type RegistrationStoreArc = Arc<dyn RegistrationStore>;
pub type ReviewStoreArc = Arc<dyn ReviewStore>;
pub type InvoiceStoreArc = Arc<dyn InvoiceStore>;
pub type CounterStoreArc = Arc<dyn CounterStore>;
pub type BatchStoreArc = Arc<dyn BatchStore>;
pub type PaymentSourceArc = Arc<dyn PaymentSource>;
pub type DocumentRendererArc = Arc<dyn DocumentRenderer>;
pub type ObjectStorageArc = Arc<dyn ObjectStorage>;
pub type EmailClientArc = Arc<dyn EmailClient>;

/// Every logical store the pipeline persists to.
#[derive(Clone)]
pub struct Stores {
    pub payments: PaymentStoreArc,
    pub registrations: RegistrationStoreArc,
    pub reviews: ReviewStoreArc,
    pub invoices: InvoiceStoreArc,
    pub counters: CounterStoreArc,
    pub batches: BatchStoreArc,
}
