use crate::application::Services;
use crate::application::batch::{BatchHandle, BatchTracker};
use crate::application::dedup::{DedupDecision, DedupFilter};
use crate::application::distribution::Distributor;
use crate::application::invoice::InvoiceOrchestrator;
use crate::application::matcher::MatchingEngine;
use crate::application::review::ReviewQueue;
use crate::config::PipelineSettings;
use crate::domain::batch::{ImportBatch, ItemOutcome};
use crate::domain::matching::{Disposition, MatchCandidate, MatchOutcome};
use crate::domain::money::Money;
use crate::domain::payment::{DateRange, PaymentRecord};
use crate::domain::ports::{PaymentPage, PaymentSourceArc, PaymentStoreArc, RegistrationStoreArc, Stores};
use crate::error::{ReconcileError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Cooperative cancellation for a running batch, checked between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What an import would do with one payment.
#[derive(Debug, Clone, PartialEq)]
pub struct DryRunLine {
    pub payment_id: String,
    pub amount: Money,
    pub duplicate: bool,
    pub disposition: Option<Disposition>,
    pub best_registration: Option<String>,
    pub confidence: Option<f64>,
}

/// Per-item work shared by all workers of a run.
#[derive(Clone)]
struct ItemProcessor {
    payments: PaymentStoreArc,
    registrations: RegistrationStoreArc,
    dedup: DedupFilter,
    matcher: MatchingEngine,
    orchestrator: Arc<InvoiceOrchestrator>,
    queue: Arc<ReviewQueue>,
    distributor: Option<Distributor>,
    tracker: BatchTracker,
}

impl ItemProcessor {
    /// Records the item's outcome. Only fatal errors and bookkeeping failures
    /// come back as `Err`; everything else is counted.
    async fn process(&self, handle: &BatchHandle, payment: PaymentRecord) -> Result<()> {
        let payment_id = payment.payment_id.clone();
        let outcome = match self.handle(handle, payment).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => {
                error!(payment_id = %payment_id, error = %e, "Store unreachable, aborting batch");
                self.tracker.record_outcome(handle, ItemOutcome::Failed).await?;
                return Err(e);
            }
            Err(e) => {
                warn!(payment_id = %payment_id, error = %e, "Payment import failed");
                ItemOutcome::Failed
            }
        };
        debug!(payment_id = %payment_id, ?outcome, "Processed payment");
        self.tracker.record_outcome(handle, outcome).await
    }

    async fn handle(&self, handle: &BatchHandle, payment: PaymentRecord) -> Result<ItemOutcome> {
        if self.dedup.check(&payment).await? == DedupDecision::Skip {
            return Ok(ItemOutcome::Skipped);
        }
        match self.payments.insert(payment.clone()).await {
            Ok(()) => {}
            Err(ReconcileError::DuplicatePayment(_)) => return Ok(ItemOutcome::Skipped),
            Err(e) => return Err(e),
        }

        let outcome = match self.matcher.evaluate(&payment).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // Persisted but unmatched: park it so a recheck can finish it.
                let parked = MatchOutcome {
                    payment_id: payment.payment_id.clone(),
                    disposition: Disposition::Unmatched,
                    candidates: Vec::new(),
                };
                self.queue.enqueue(payment, &parked).await?;
                return Err(e);
            }
        };
        self.tracker
            .record_disposition(handle, outcome.disposition)
            .await?;

        if outcome.disposition == Disposition::AutoMatch {
            let winner = outcome.clone().into_auto_match()?;
            return match self.issue(&payment, &winner).await {
                Ok(()) => Ok(ItemOutcome::Imported),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    self.queue.enqueue(payment, &outcome).await?;
                    Err(e)
                }
            };
        }

        self.queue.enqueue(payment, &outcome).await?;
        Ok(ItemOutcome::Imported)
    }

    async fn issue(&self, payment: &PaymentRecord, winner: &MatchCandidate) -> Result<()> {
        let registration = self
            .registrations
            .get(&winner.registration_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("registration", &winner.registration_id))?;
        let pair = self
            .orchestrator
            .issue(payment, &registration, winner.confidence, false)
            .await?;
        if let Some(distributor) = &self.distributor {
            distributor
                .distribute(&pair, registration.contact.email.as_deref())
                .await;
        }
        Ok(())
    }
}

/// Runs one ingestion pass: adapter pages in, batch summary out.
pub struct ImportPipeline {
    source: PaymentSourceArc,
    processor: ItemProcessor,
    settings: PipelineSettings,
}

impl ImportPipeline {
    pub fn new(
        source: PaymentSourceArc,
        stores: &Stores,
        services: &Services,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            processor: ItemProcessor {
                payments: stores.payments.clone(),
                registrations: stores.registrations.clone(),
                dedup: services.dedup.clone(),
                matcher: services.matcher.clone(),
                orchestrator: services.orchestrator.clone(),
                queue: services.queue.clone(),
                distributor: None,
                tracker: services.tracker.clone(),
            },
            settings,
        }
    }

    pub fn with_distributor(mut self, distributor: Distributor) -> Self {
        self.processor.distributor = Some(distributor);
        self
    }

    /// Imports every payment in `range`. The batch is always finalized: as
    /// failed when the store became unreachable or `cancel` fired with items
    /// still undispatched, otherwise as completed.
    pub async fn run(&self, range: DateRange, cancel: &CancelFlag) -> Result<ImportBatch> {
        let tracker = &self.processor.tracker;
        let handle = tracker.start(range, self.source.name()).await?;

        match self.dispatch(&handle, &range, cancel).await {
            Ok(false) => tracker.complete(&handle).await,
            Ok(true) => {
                info!(batch_id = %handle.batch_id(), "Import cancelled");
                tracker.fail(&handle, "cancelled").await
            }
            Err(e) => tracker.fail(&handle, &e.to_string()).await,
        }
    }

    /// Returns whether the run was cut short by cancellation.
    async fn dispatch(
        &self,
        handle: &BatchHandle,
        range: &DateRange,
        cancel: &CancelFlag,
    ) -> Result<bool> {
        let semaphore = Arc::new(Semaphore::new(self.settings.workers));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut fatal: Option<ReconcileError> = None;
        let mut cancelled = false;
        let mut cursor: Option<String> = None;

        'pages: loop {
            let page = match self.fetch_page(range, cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            for payment in page.payments {
                while let Some(joined) = tasks.try_join_next() {
                    self.settle(handle, joined, &mut fatal).await;
                }
                if fatal.is_some() {
                    break 'pages;
                }
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'pages;
                }
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| ReconcileError::InternalError(Box::new(e)))?;
                // Waiting for a worker can span a cancellation.
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'pages;
                }
                let processor = self.processor.clone();
                let handle = handle.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    processor.process(&handle, payment).await
                });
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.settle(handle, joined, &mut fatal).await;
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(cancelled),
        }
    }

    async fn settle(
        &self,
        handle: &BatchHandle,
        joined: std::result::Result<Result<()>, JoinError>,
        fatal: &mut Option<ReconcileError>,
    ) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if fatal.is_none() {
                    *fatal = Some(e);
                }
            }
            Err(e) => {
                error!(error = %e, "Import worker panicked");
                if let Err(e) = self
                    .processor
                    .tracker
                    .record_outcome(handle, ItemOutcome::Failed)
                    .await
                    && fatal.is_none()
                {
                    *fatal = Some(e);
                }
            }
        }
    }

    async fn fetch_page(&self, range: &DateRange, cursor: Option<&str>) -> Result<PaymentPage> {
        let mut attempt = 0;
        loop {
            match self.source.list_payments(range, cursor).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.settings.fetch_retries => {
                    attempt += 1;
                    warn!(attempt, cursor, error = %e, "Payment page fetch failed, retrying");
                    tokio::time::sleep(self.settings.retry_backoff() * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reports what `run` would do without writing anything.
    pub async fn dry_run(&self, range: DateRange) -> Result<Vec<DryRunLine>> {
        let mut lines = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.fetch_page(&range, cursor.as_deref()).await?;
            for payment in page.payments {
                let duplicate = self.processor.payments.exists(&payment.payment_id).await?;
                let outcome = if duplicate {
                    None
                } else {
                    Some(self.processor.matcher.evaluate(&payment).await?)
                };
                let best = outcome.as_ref().and_then(MatchOutcome::best);
                lines.push(DryRunLine {
                    payment_id: payment.payment_id.clone(),
                    amount: payment.amount,
                    duplicate,
                    disposition: outcome.as_ref().map(|o| o.disposition),
                    best_registration: best.map(|c| c.registration_id.clone()),
                    confidence: best.map(|c| c.confidence),
                });
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(payments = lines.len(), "Dry run finished");
        Ok(lines)
    }
}
