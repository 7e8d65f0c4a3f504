use crate::domain::batch::ImportBatch;
use crate::domain::invoice::{IdempotencyKey, InvoicePair, InvoicePairStatus, Transaction};
use crate::domain::matching::PartyOverlap;
use crate::domain::money::Money;
use crate::domain::payment::{PayerHints, PaymentLinkage, PaymentRecord};
use crate::domain::ports::{
    BatchStore, CounterStore, InvoiceStore, PaymentStore, RegistrationStore, ReviewStore, Stores,
};
use crate::domain::registration::Registration;
use crate::domain::review::{FailedImportRecord, PendingImportRecord, ReviewAction};
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CF_PAYMENTS: &str = "payments";
pub const CF_REGISTRATIONS: &str = "registrations";
pub const CF_PENDING: &str = "pending_imports";
pub const CF_FAILED: &str = "failed_imports";
pub const CF_REVIEW_ACTIONS: &str = "review_actions";
pub const CF_INVOICE_PAIRS: &str = "invoice_pairs";
pub const CF_ACTIVE_INVOICES: &str = "active_invoices";
pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_COUNTERS: &str = "counters";
pub const CF_BATCHES: &str = "import_batches";

const COLUMN_FAMILIES: [&str; 10] = [
    CF_PAYMENTS,
    CF_REGISTRATIONS,
    CF_PENDING,
    CF_FAILED,
    CF_REVIEW_ACTIONS,
    CF_INVOICE_PAIRS,
    CF_ACTIVE_INVOICES,
    CF_TRANSACTIONS,
    CF_COUNTERS,
    CF_BATCHES,
];

/// Persistent implementation of every logical store, one column family each.
///
/// Values are JSON. Read-modify-write paths (unique inserts, compare-and-swap
/// on review records, counter increments) run under a process-local mutex and
/// commit through a single `WriteBatch`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// All logical stores backed by this database.
    pub fn stores(&self) -> Stores {
        Stores {
            payments: Arc::new(self.clone()),
            registrations: Arc::new(self.clone()),
            reviews: Arc::new(self.clone()),
            invoices: Arc::new(self.clone()),
            counters: Arc::new(self.clone()),
            batches: Arc::new(self.clone()),
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ReconcileError::StoreUnavailable(format!("{name} column family not found")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_pinned_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        self.db.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Every value of `cf`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn scan_prefix_json<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn checked_pending(&self, payment_id: &str, expected: u32) -> Result<PendingImportRecord> {
        match self.get_json::<PendingImportRecord>(CF_PENDING, payment_id.as_bytes())? {
            Some(record) if record.attempts == expected => Ok(record),
            _ => Err(ReconcileError::ReviewTransitionConflict(payment_id.to_string())),
        }
    }

    fn registrations_where(&self, keep: impl Fn(&Registration) -> bool) -> Result<Vec<Registration>> {
        Ok(self
            .scan_json::<Registration>(CF_REGISTRATIONS)?
            .into_iter()
            .filter(|r| keep(r))
            .collect())
    }
}

fn action_prefix(payment_id: &str) -> Vec<u8> {
    format!("{payment_id}\u{1f}").into_bytes()
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn exists(&self, payment_id: &str) -> Result<bool> {
        let cf = self.cf(CF_PAYMENTS)?;
        Ok(self.db.get_pinned_cf(cf, payment_id.as_bytes())?.is_some())
    }

    async fn insert(&self, payment: PaymentRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.exists(&payment.payment_id).await? {
            return Err(ReconcileError::DuplicatePayment(payment.payment_id));
        }
        self.put_json(CF_PAYMENTS, payment.payment_id.as_bytes(), &payment)
    }

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>> {
        self.get_json(CF_PAYMENTS, payment_id.as_bytes())
    }

    async fn attach_linkage(&self, payment_id: &str, linkage: PaymentLinkage) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut payment: PaymentRecord = self
            .get_json(CF_PAYMENTS, payment_id.as_bytes())?
            .ok_or_else(|| ReconcileError::not_found("payment", payment_id))?;
        payment.linkage = Some(linkage);
        self.put_json(CF_PAYMENTS, payment_id.as_bytes(), &payment)
    }

    async fn get_all(&self) -> Result<Vec<PaymentRecord>> {
        let mut all: Vec<PaymentRecord> = self.scan_json(CF_PAYMENTS)?;
        all.sort_by(|a, b| a.paid_at.cmp(&b.paid_at).then_with(|| a.payment_id.cmp(&b.payment_id)));
        Ok(all)
    }
}

#[async_trait]
impl RegistrationStore for RocksDBStore {
    async fn upsert(&self, registration: Registration) -> Result<()> {
        self.put_json(
            CF_REGISTRATIONS,
            registration.registration_id.as_bytes(),
            &registration,
        )
    }

    async fn get(&self, registration_id: &str) -> Result<Option<Registration>> {
        self.get_json(CF_REGISTRATIONS, registration_id.as_bytes())
    }

    async fn find_by_payment_ref(&self, payment_id: &str) -> Result<Vec<Registration>> {
        self.registrations_where(|r| r.references_payment(payment_id))
    }

    async fn find_by_amount_window(
        &self,
        amount: Money,
        tolerance: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Registration>> {
        self.registrations_where(|r| {
            r.total_amount.within(amount, tolerance) && r.created_at >= from && r.created_at <= to
        })
    }

    async fn find_by_party(&self, payer: &PayerHints) -> Result<Vec<Registration>> {
        self.registrations_where(|r| PartyOverlap::between(payer, &r.contact).is_related())
    }
}

#[async_trait]
impl ReviewStore for RocksDBStore {
    async fn insert_pending(&self, record: PendingImportRecord) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = record.id().as_bytes().to_vec();
        if self.db.get_pinned_cf(self.cf(CF_PENDING)?, &key)?.is_some() {
            return Ok(false);
        }
        self.put_json(CF_PENDING, &key, &record)?;
        Ok(true)
    }

    async fn get_pending(&self, payment_id: &str) -> Result<Option<PendingImportRecord>> {
        self.get_json(CF_PENDING, payment_id.as_bytes())
    }

    async fn list_pending(&self) -> Result<Vec<PendingImportRecord>> {
        let mut pending: Vec<PendingImportRecord> = self.scan_json(CF_PENDING)?;
        pending.sort_by(|a, b| {
            a.pending_since
                .cmp(&b.pending_since)
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(pending)
    }

    async fn replace_pending(
        &self,
        record: PendingImportRecord,
        expected_attempts: u32,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.checked_pending(record.id(), expected_attempts)?;
        self.put_json(CF_PENDING, record.id().as_bytes(), &record)
    }

    async fn remove_pending(
        &self,
        payment_id: &str,
        expected_attempts: u32,
    ) -> Result<PendingImportRecord> {
        let _guard = self.write_lock.lock().await;
        let record = self.checked_pending(payment_id, expected_attempts)?;
        self.db.delete_cf(self.cf(CF_PENDING)?, payment_id.as_bytes())?;
        Ok(record)
    }

    async fn fail_pending(&self, failed: FailedImportRecord, expected_attempts: u32) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let payment_id = failed.record.id().to_string();
        self.checked_pending(&payment_id, expected_attempts)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_PENDING)?, payment_id.as_bytes());
        batch.put_cf(
            self.cf(CF_FAILED)?,
            payment_id.as_bytes(),
            serde_json::to_vec(&failed)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_failed(&self, payment_id: &str) -> Result<Option<FailedImportRecord>> {
        self.get_json(CF_FAILED, payment_id.as_bytes())
    }

    async fn list_failed(&self) -> Result<Vec<FailedImportRecord>> {
        let mut failed: Vec<FailedImportRecord> = self.scan_json(CF_FAILED)?;
        failed.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(failed)
    }

    async fn append_action(&self, action: ReviewAction) -> Result<()> {
        let mut key = action_prefix(&action.payment_id);
        key.extend_from_slice(Uuid::new_v4().as_bytes());
        self.put_json(CF_REVIEW_ACTIONS, &key, &action)
    }

    async fn actions_for(&self, payment_id: &str) -> Result<Vec<ReviewAction>> {
        let mut actions: Vec<ReviewAction> =
            self.scan_prefix_json(CF_REVIEW_ACTIONS, &action_prefix(payment_id))?;
        actions.sort_by(|a, b| a.at.cmp(&b.at));
        Ok(actions)
    }
}

#[async_trait]
impl InvoiceStore for RocksDBStore {
    async fn find_active(&self, key: &IdempotencyKey) -> Result<Option<InvoicePair>> {
        match self.get_json::<Uuid>(CF_ACTIVE_INVOICES, key.encode().as_bytes())? {
            Some(pair_id) => self.get_json(CF_INVOICE_PAIRS, pair_id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn get_pair(&self, pair_id: Uuid) -> Result<Option<InvoicePair>> {
        self.get_json(CF_INVOICE_PAIRS, pair_id.as_bytes())
    }

    async fn pairs_for(&self, key: &IdempotencyKey) -> Result<Vec<InvoicePair>> {
        let mut pairs: Vec<InvoicePair> = self
            .scan_json::<InvoicePair>(CF_INVOICE_PAIRS)?
            .into_iter()
            .filter(|p| &p.key() == key)
            .collect();
        pairs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pairs)
    }

    async fn insert_pair(&self, pair: InvoicePair) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = pair.key();
        let active_key = key.encode();
        let mut batch = WriteBatch::default();

        if let Some(active_id) = self.get_json::<Uuid>(CF_ACTIVE_INVOICES, active_key.as_bytes())? {
            if pair.supersedes != Some(active_id) {
                return Err(ReconcileError::DuplicateInvoice {
                    payment_id: key.payment_id,
                    registration_id: key.registration_id,
                });
            }
            if let Some(mut previous) =
                self.get_json::<InvoicePair>(CF_INVOICE_PAIRS, active_id.as_bytes())?
            {
                previous.status = InvoicePairStatus::Superseded;
                batch.put_cf(
                    self.cf(CF_INVOICE_PAIRS)?,
                    active_id.as_bytes(),
                    serde_json::to_vec(&previous)?,
                );
            }
        }
        batch.put_cf(
            self.cf(CF_INVOICE_PAIRS)?,
            pair.pair_id.as_bytes(),
            serde_json::to_vec(&pair)?,
        );
        batch.put_cf(
            self.cf(CF_ACTIVE_INVOICES)?,
            active_key.as_bytes(),
            serde_json::to_vec(&pair.pair_id)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = transaction.transaction_id.to_be_bytes();
        if self.db.get_pinned_cf(self.cf(CF_TRANSACTIONS)?, key)?.is_some() {
            return Err(ReconcileError::ValidationError(format!(
                "transaction {} already recorded",
                transaction.transaction_id
            )));
        }
        self.put_json(CF_TRANSACTIONS, &key, &transaction)
    }

    async fn delete_transactions(&self, transaction_ids: &[u64]) -> Result<()> {
        let mut batch = WriteBatch::default();
        let cf = self.cf(CF_TRANSACTIONS)?;
        for id in transaction_ids {
            batch.delete_cf(cf, id.to_be_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn transactions_for(&self, pair_id: Uuid) -> Result<Vec<Transaction>> {
        Ok(self
            .scan_json::<Transaction>(CF_TRANSACTIONS)?
            .into_iter()
            .filter(|t| t.pair_id == pair_id)
            .collect())
    }
}

#[async_trait]
impl CounterStore for RocksDBStore {
    async fn increment(&self, name: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let next = self.get_json::<u64>(CF_COUNTERS, name.as_bytes())?.unwrap_or(0) + 1;
        self.put_json(CF_COUNTERS, name.as_bytes(), &next)?;
        Ok(next)
    }

    async fn reset(&self, name: &str, value: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.put_json(CF_COUNTERS, name.as_bytes(), &value)
    }

    async fn current(&self, name: &str) -> Result<Option<u64>> {
        self.get_json(CF_COUNTERS, name.as_bytes())
    }
}

#[async_trait]
impl BatchStore for RocksDBStore {
    async fn save(&self, batch: ImportBatch) -> Result<()> {
        self.put_json(CF_BATCHES, batch.batch_id.as_bytes(), &batch)
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<ImportBatch>> {
        self.get_json(CF_BATCHES, batch_id.as_bytes())
    }

    async fn get_all(&self) -> Result<Vec<ImportBatch>> {
        let mut all: Vec<ImportBatch> = self.scan_json(CF_BATCHES)?;
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(all)
    }
}
