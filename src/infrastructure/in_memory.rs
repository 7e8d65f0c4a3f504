use crate::domain::batch::ImportBatch;
use crate::domain::invoice::{IdempotencyKey, InvoicePair, InvoicePairStatus, Transaction};
use crate::domain::matching::PartyOverlap;
use crate::domain::money::Money;
use crate::domain::payment::{DateRange, PayerHints, PaymentLinkage, PaymentRecord};
use crate::domain::ports::{
    BatchStore, CounterStore, InvoiceStore, PaymentPage, PaymentSource, PaymentStore,
    RegistrationStore, ReviewStore, Stores,
};
use crate::domain::registration::Registration;
use crate::domain::review::{FailedImportRecord, PendingImportRecord, ReviewAction};
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Builds a full set of empty in-memory stores.
pub fn in_memory_stores() -> Stores {
    Stores {
        payments: Arc::new(InMemoryPaymentStore::new()),
        registrations: Arc::new(InMemoryRegistrationStore::new()),
        reviews: Arc::new(InMemoryReviewStore::new()),
        invoices: Arc::new(InMemoryInvoiceStore::new()),
        counters: Arc::new(InMemoryCounterStore::new()),
        batches: Arc::new(InMemoryBatchStore::new()),
    }
}

/// Thread-safe in-memory payment store keyed by gateway payment id.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<String, PaymentRecord>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn exists(&self, payment_id: &str) -> Result<bool> {
        Ok(self.payments.read().await.contains_key(payment_id))
    }

    async fn insert(&self, payment: PaymentRecord) -> Result<()> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.payment_id) {
            return Err(ReconcileError::DuplicatePayment(payment.payment_id));
        }
        payments.insert(payment.payment_id.clone(), payment);
        Ok(())
    }

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>> {
        Ok(self.payments.read().await.get(payment_id).cloned())
    }

    async fn attach_linkage(&self, payment_id: &str, linkage: PaymentLinkage) -> Result<()> {
        let mut payments = self.payments.write().await;
        let payment = payments
            .get_mut(payment_id)
            .ok_or_else(|| ReconcileError::not_found("payment", payment_id))?;
        payment.linkage = Some(linkage);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<PaymentRecord>> {
        let mut all: Vec<_> = self.payments.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.paid_at.cmp(&b.paid_at).then_with(|| a.payment_id.cmp(&b.payment_id)));
        Ok(all)
    }
}

/// Registration snapshot. Ordered by id so query results are deterministic.
#[derive(Default, Clone)]
pub struct InMemoryRegistrationStore {
    registrations: Arc<RwLock<BTreeMap<String, Registration>>>,
}

impl InMemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistrationStore for InMemoryRegistrationStore {
    async fn upsert(&self, registration: Registration) -> Result<()> {
        self.registrations
            .write()
            .await
            .insert(registration.registration_id.clone(), registration);
        Ok(())
    }

    async fn get(&self, registration_id: &str) -> Result<Option<Registration>> {
        Ok(self.registrations.read().await.get(registration_id).cloned())
    }

    async fn find_by_payment_ref(&self, payment_id: &str) -> Result<Vec<Registration>> {
        let registrations = self.registrations.read().await;
        Ok(registrations
            .values()
            .filter(|r| r.references_payment(payment_id))
            .cloned()
            .collect())
    }

    async fn find_by_amount_window(
        &self,
        amount: Money,
        tolerance: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Registration>> {
        let registrations = self.registrations.read().await;
        Ok(registrations
            .values()
            .filter(|r| r.total_amount.within(amount, tolerance))
            .filter(|r| r.created_at >= from && r.created_at <= to)
            .cloned()
            .collect())
    }

    async fn find_by_party(&self, payer: &PayerHints) -> Result<Vec<Registration>> {
        let registrations = self.registrations.read().await;
        Ok(registrations
            .values()
            .filter(|r| PartyOverlap::between(payer, &r.contact).is_related())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct ReviewTables {
    pending: HashMap<String, PendingImportRecord>,
    failed: HashMap<String, FailedImportRecord>,
    actions: Vec<ReviewAction>,
}

impl ReviewTables {
    /// The pending record, if it still carries `expected` attempts.
    fn checked(&self, payment_id: &str, expected: u32) -> Result<&PendingImportRecord> {
        match self.pending.get(payment_id) {
            Some(record) if record.attempts == expected => Ok(record),
            _ => Err(ReconcileError::ReviewTransitionConflict(payment_id.to_string())),
        }
    }
}

/// Pending queue, failed store and action log behind one lock, so moving a
/// record from pending to failed is a single step.
#[derive(Default, Clone)]
pub struct InMemoryReviewStore {
    tables: Arc<RwLock<ReviewTables>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn insert_pending(&self, record: PendingImportRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.pending.contains_key(record.id()) {
            return Ok(false);
        }
        tables.pending.insert(record.id().to_string(), record);
        Ok(true)
    }

    async fn get_pending(&self, payment_id: &str) -> Result<Option<PendingImportRecord>> {
        Ok(self.tables.read().await.pending.get(payment_id).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<PendingImportRecord>> {
        let mut pending: Vec<_> = self.tables.read().await.pending.values().cloned().collect();
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
        let mut tables = self.tables.write().await;
        tables.checked(record.id(), expected_attempts)?;
        tables.pending.insert(record.id().to_string(), record);
        Ok(())
    }

    async fn remove_pending(
        &self,
        payment_id: &str,
        expected_attempts: u32,
    ) -> Result<PendingImportRecord> {
        let mut tables = self.tables.write().await;
        tables.checked(payment_id, expected_attempts)?;
        tables
            .pending
            .remove(payment_id)
            .ok_or_else(|| ReconcileError::ReviewTransitionConflict(payment_id.to_string()))
    }

    async fn fail_pending(&self, failed: FailedImportRecord, expected_attempts: u32) -> Result<()> {
        let mut tables = self.tables.write().await;
        let payment_id = failed.record.id().to_string();
        tables.checked(&payment_id, expected_attempts)?;
        tables.pending.remove(&payment_id);
        tables.failed.insert(payment_id, failed);
        Ok(())
    }

    async fn get_failed(&self, payment_id: &str) -> Result<Option<FailedImportRecord>> {
        Ok(self.tables.read().await.failed.get(payment_id).cloned())
    }

    async fn list_failed(&self) -> Result<Vec<FailedImportRecord>> {
        let mut failed: Vec<_> = self.tables.read().await.failed.values().cloned().collect();
        failed.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(failed)
    }

    async fn append_action(&self, action: ReviewAction) -> Result<()> {
        self.tables.write().await.actions.push(action);
        Ok(())
    }

    async fn actions_for(&self, payment_id: &str) -> Result<Vec<ReviewAction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .actions
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct InvoiceTables {
    pairs: HashMap<Uuid, InvoicePair>,
    active: HashMap<IdempotencyKey, Uuid>,
    transactions: BTreeMap<u64, Transaction>,
}

/// Invoice pairs with a unique active pair per idempotency key.
#[derive(Default, Clone)]
pub struct InMemoryInvoiceStore {
    tables: Arc<RwLock<InvoiceTables>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn find_active(&self, key: &IdempotencyKey) -> Result<Option<InvoicePair>> {
        let tables = self.tables.read().await;
        Ok(tables
            .active
            .get(key)
            .and_then(|id| tables.pairs.get(id))
            .cloned())
    }

    async fn get_pair(&self, pair_id: Uuid) -> Result<Option<InvoicePair>> {
        Ok(self.tables.read().await.pairs.get(&pair_id).cloned())
    }

    async fn pairs_for(&self, key: &IdempotencyKey) -> Result<Vec<InvoicePair>> {
        let tables = self.tables.read().await;
        let mut pairs: Vec<_> = tables
            .pairs
            .values()
            .filter(|p| &p.key() == key)
            .cloned()
            .collect();
        pairs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pairs)
    }

    async fn insert_pair(&self, pair: InvoicePair) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = pair.key();
        if let Some(active_id) = tables.active.get(&key).copied() {
            if pair.supersedes != Some(active_id) {
                return Err(ReconcileError::DuplicateInvoice {
                    payment_id: key.payment_id,
                    registration_id: key.registration_id,
                });
            }
            if let Some(previous) = tables.pairs.get_mut(&active_id) {
                previous.status = InvoicePairStatus::Superseded;
            }
        }
        tables.active.insert(key, pair.pair_id);
        tables.pairs.insert(pair.pair_id, pair);
        Ok(())
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.transactions.contains_key(&transaction.transaction_id) {
            return Err(ReconcileError::ValidationError(format!(
                "transaction {} already recorded",
                transaction.transaction_id
            )));
        }
        tables
            .transactions
            .insert(transaction.transaction_id, transaction);
        Ok(())
    }

    async fn delete_transactions(&self, transaction_ids: &[u64]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in transaction_ids {
            tables.transactions.remove(id);
        }
        Ok(())
    }

    async fn transactions_for(&self, pair_id: Uuid) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .values()
            .filter(|t| t.pair_id == pair_id)
            .cloned()
            .collect())
    }
}

/// Counter cells as shared atomics; increments never take the write lock
/// once a cell exists.
#[derive(Default, Clone)]
pub struct InMemoryCounterStore {
    cells: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(cell) = self.cells.read().await.get(name) {
            return cell.clone();
        }
        self.cells
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, name: &str) -> Result<u64> {
        Ok(self.cell(name).await.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn reset(&self, name: &str, value: u64) -> Result<()> {
        self.cell(name).await.store(value, Ordering::SeqCst);
        Ok(())
    }

    async fn current(&self, name: &str) -> Result<Option<u64>> {
        Ok(self
            .cells
            .read()
            .await
            .get(name)
            .map(|cell| cell.load(Ordering::SeqCst)))
    }
}

#[derive(Default, Clone)]
pub struct InMemoryBatchStore {
    batches: Arc<RwLock<HashMap<Uuid, ImportBatch>>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn save(&self, batch: ImportBatch) -> Result<()> {
        self.batches.write().await.insert(batch.batch_id, batch);
        Ok(())
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<ImportBatch>> {
        Ok(self.batches.read().await.get(&batch_id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<ImportBatch>> {
        let mut all: Vec<_> = self.batches.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(all)
    }
}

/// Pages over an already normalized payment list.
///
/// The cursor is the offset into the range-filtered list, so any cursor handed
/// out earlier can be replayed.
#[derive(Clone)]
pub struct InMemoryPaymentSource {
    name: String,
    payments: Arc<Vec<PaymentRecord>>,
    page_size: usize,
}

impl InMemoryPaymentSource {
    pub fn new(name: impl Into<String>, mut payments: Vec<PaymentRecord>, page_size: usize) -> Self {
        payments.sort_by(|a, b| a.paid_at.cmp(&b.paid_at).then_with(|| a.payment_id.cmp(&b.payment_id)));
        Self {
            name: name.into(),
            payments: Arc::new(payments),
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl PaymentSource for InMemoryPaymentSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_payments(&self, range: &DateRange, cursor: Option<&str>) -> Result<PaymentPage> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| ReconcileError::ValidationError(format!("invalid cursor '{c}'")))?,
            None => 0,
        };
        let matching: Vec<&PaymentRecord> = self
            .payments
            .iter()
            .filter(|p| range.contains(p.paid_at))
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        let payments = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|p| (*p).clone())
            .collect();
        Ok(PaymentPage {
            payments,
            next_cursor: (end < matching.len()).then(|| end.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::invoice::{Invoice, InvoiceType};
    use crate::domain::payment::Gateway;
    use crate::domain::registration::Party;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn payment(id: &str, day: u32) -> PaymentRecord {
        PaymentRecord {
            payment_id: id.to_string(),
            gateway: Gateway::Square,
            amount: Money::new(dec!(10.00)),
            currency: "AUD".to_string(),
            paid_at: Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap(),
            payer: PayerHints::default(),
            registration_ref: None,
            raw_ref: None,
            linkage: None,
        }
    }

    fn invoice() -> Invoice {
        Invoice {
            invoice_number: "LTIV-25010001".to_string(),
            invoice_type: InvoiceType::Customer,
            issued_at: Utc::now(),
            bill_to: Party::default(),
            supplier: Party::default(),
            items: vec![],
            subtotal: Money::ZERO,
            processing_fees: Money::ZERO,
            total: Money::ZERO,
            gst_included: Money::ZERO,
            payment_id: "p1".to_string(),
            registration_id: "r1".to_string(),
        }
    }

    fn pair(supersedes: Option<Uuid>) -> InvoicePair {
        InvoicePair {
            pair_id: Uuid::new_v4(),
            payment_id: "p1".to_string(),
            registration_id: "r1".to_string(),
            customer: invoice(),
            supplier: invoice(),
            transaction_ids: vec![],
            status: InvoicePairStatus::Active,
            supersedes,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_payment_ids_are_unique() {
        let store = InMemoryPaymentStore::new();
        store.insert(payment("p1", 1)).await.unwrap();
        assert!(matches!(
            store.insert(payment("p1", 2)).await,
            Err(ReconcileError::DuplicatePayment(_))
        ));
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_active_pair_is_rejected() {
        let store = InMemoryInvoiceStore::new();
        let first = pair(None);
        store.insert_pair(first.clone()).await.unwrap();
        assert!(matches!(
            store.insert_pair(pair(None)).await,
            Err(ReconcileError::DuplicateInvoice { .. })
        ));

        let second = pair(Some(first.pair_id));
        store.insert_pair(second.clone()).await.unwrap();
        assert_eq!(
            store.find_active(&first.key()).await.unwrap().unwrap().pair_id,
            second.pair_id
        );
        let previous = store.get_pair(first.pair_id).await.unwrap().unwrap();
        assert_eq!(previous.status, InvoicePairStatus::Superseded);
    }

    #[tokio::test]
    async fn test_counter_starts_at_one_and_resets() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.current("tx").await.unwrap(), None);
        assert_eq!(store.increment("tx").await.unwrap(), 1);
        assert_eq!(store.increment("tx").await.unwrap(), 2);
        store.reset("tx", 10).await.unwrap();
        assert_eq!(store.increment("tx").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_review_cas_rejects_stale_attempts() {
        let store = InMemoryReviewStore::new();
        let record = PendingImportRecord::new(
            payment("p1", 1),
            crate::domain::matching::Disposition::Unmatched,
            vec![],
            Utc::now(),
        );
        assert!(store.insert_pending(record.clone()).await.unwrap());

        let mut bumped = record.clone();
        bumped.attempts = 1;
        store.replace_pending(bumped, 0).await.unwrap();
        assert!(matches!(
            store.replace_pending(record, 0).await,
            Err(ReconcileError::ReviewTransitionConflict(_))
        ));
        assert!(matches!(
            store.remove_pending("missing", 0).await,
            Err(ReconcileError::ReviewTransitionConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_source_pages_are_replayable() {
        let source = InMemoryPaymentSource::new(
            "memory",
            vec![payment("c", 3), payment("a", 1), payment("b", 2)],
            2,
        );
        let range = DateRange::unbounded();

        let first = source.list_payments(&range, None).await.unwrap();
        assert_eq!(first.payments.len(), 2);
        assert_eq!(first.payments[0].payment_id, "a");
        let cursor = first.next_cursor.unwrap();

        let second = source.list_payments(&range, Some(&cursor)).await.unwrap();
        let again = source.list_payments(&range, Some(&cursor)).await.unwrap();
        assert_eq!(second.payments, again.payments);
        assert_eq!(second.payments[0].payment_id, "c");
        assert!(second.next_cursor.is_none());
    }
}
