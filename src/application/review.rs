use crate::application::invoice::InvoiceOrchestrator;
use crate::application::matcher::MatchingEngine;
use crate::config::ReviewPolicy;
use crate::domain::invoice::InvoicePair;
use crate::domain::matching::MatchOutcome;
use crate::domain::payment::PaymentRecord;
use crate::domain::ports::{RegistrationStoreArc, ReviewStoreArc};
use crate::domain::review::{
    EXPIRED_REASON, FailedImportRecord, PendingImportRecord, RECHECK_LIMIT_REASON, ReviewAction,
    ReviewActionKind, ReviewClaim, ReviewEvent,
};
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Actor recorded for sweeps and automated rechecks.
pub const SYSTEM_ACTOR: &str = "system";

/// Whether a pending record's accept claim blocks other transitions.
enum ClaimCheck {
    Free,
    Held,
    /// The stale claim had committed invoices and the record is now resolved.
    Settled(InvoicePair),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecheckSummary {
    pub resolved: usize,
    pub still_pending: usize,
    pub failed: usize,
}

/// Holds payments the matcher could not settle and applies review actions.
///
/// All mutations go through the store's compare-and-swap on `attempts`, so a
/// transition that raced with another one fails with
/// `ReviewTransitionConflict` instead of being lost.
pub struct ReviewQueue {
    reviews: ReviewStoreArc,
    registrations: RegistrationStoreArc,
    orchestrator: Arc<InvoiceOrchestrator>,
    matcher: MatchingEngine,
    policy: ReviewPolicy,
}

impl ReviewQueue {
    pub fn new(
        reviews: ReviewStoreArc,
        registrations: RegistrationStoreArc,
        orchestrator: Arc<InvoiceOrchestrator>,
        matcher: MatchingEngine,
        policy: ReviewPolicy,
    ) -> Self {
        Self {
            reviews,
            registrations,
            orchestrator,
            matcher,
            policy,
        }
    }

    pub async fn enqueue(&self, payment: PaymentRecord, outcome: &MatchOutcome) -> Result<bool> {
        self.enqueue_at(payment, outcome, Utc::now()).await
    }

    /// Creates the pending record. Returns false when the payment already has
    /// an active one.
    pub async fn enqueue_at(
        &self,
        payment: PaymentRecord,
        outcome: &MatchOutcome,
        pending_since: DateTime<Utc>,
    ) -> Result<bool> {
        let payment_id = payment.payment_id.clone();
        let record = PendingImportRecord::new(
            payment,
            outcome.disposition,
            outcome.candidates.clone(),
            pending_since,
        );
        let inserted = self.reviews.insert_pending(record).await?;
        if inserted {
            info!(
                payment_id = %payment_id,
                disposition = outcome.disposition.as_str(),
                candidates = outcome.candidates.len(),
                "Payment queued for review"
            );
        } else {
            debug!(payment_id = %payment_id, "Payment already pending review");
        }
        Ok(inserted)
    }

    /// Pending records, oldest first.
    pub async fn list(&self) -> Result<Vec<PendingImportRecord>> {
        self.reviews.list_pending().await
    }

    pub async fn failed(&self) -> Result<Vec<FailedImportRecord>> {
        self.reviews.list_failed().await
    }

    pub async fn history(&self, payment_id: &str) -> Result<Vec<ReviewAction>> {
        self.reviews.actions_for(payment_id).await
    }

    /// Matches the pending payment to `registration_id` and issues its invoices.
    ///
    /// On orchestrator failure the record stays pending with `attempts` bumped.
    /// Once invoices are issued the call succeeds even if the bookkeeping that
    /// follows fails; the claim left behind is settled after it goes stale.
    pub async fn accept(
        &self,
        payment_id: &str,
        registration_id: &str,
        actor: &str,
    ) -> Result<InvoicePair> {
        let record = self.pending(payment_id).await?;
        match self.check_claim(&record, Utc::now()).await? {
            ClaimCheck::Free => {}
            ClaimCheck::Settled(pair) if pair.registration_id == registration_id => {
                return Ok(pair);
            }
            ClaimCheck::Held | ClaimCheck::Settled(_) => {
                return Err(ReconcileError::ReviewTransitionConflict(payment_id.to_string()));
            }
        }
        let next = record.state.transition(&ReviewEvent::Accept {
            registration_id: registration_id.to_string(),
        })?;
        let registration = self
            .registrations
            .get(registration_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("registration", registration_id))?;

        let mut claimed = record.clone();
        claimed.attempts += 1;
        claimed.claim = Some(ReviewClaim {
            registration_id: registration_id.to_string(),
            actor: actor.to_string(),
            claimed_at: Utc::now(),
        });
        self.reviews
            .replace_pending(claimed.clone(), record.attempts)
            .await?;

        let confidence = record
            .candidate(registration_id)
            .map(|c| c.confidence)
            .unwrap_or(1.0);
        match self
            .orchestrator
            .issue(&record.payment, &registration, confidence, false)
            .await
        {
            Ok(pair) => {
                match self.finish_accept(&claimed, actor).await {
                    Ok(()) => info!(
                        payment_id,
                        registration_id,
                        actor,
                        state = next.name(),
                        invoice = %pair.customer.invoice_number,
                        "Review accepted"
                    ),
                    Err(e) => warn!(
                        payment_id,
                        invoice = %pair.customer.invoice_number,
                        error = %e,
                        "Invoices issued but review bookkeeping failed, claim left for settlement"
                    ),
                }
                Ok(pair)
            }
            Err(e) => {
                let mut released = claimed.clone();
                released.claim = None;
                if let Err(release) = self
                    .reviews
                    .replace_pending(released, claimed.attempts)
                    .await
                {
                    warn!(payment_id, error = %release, "Could not release review claim");
                }
                warn!(payment_id, registration_id, attempts = claimed.attempts, error = %e, "Accept failed, record stays pending");
                Err(e)
            }
        }
    }

    /// Moves the record to the failed store. Rejection is final.
    pub async fn reject(
        &self,
        payment_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<FailedImportRecord> {
        let record = self.pending(payment_id).await?;
        let now = Utc::now();
        if !matches!(self.check_claim(&record, now).await?, ClaimCheck::Free) {
            return Err(ReconcileError::ReviewTransitionConflict(payment_id.to_string()));
        }
        let failed = self
            .close(record, ReviewActionKind::Reject, reason, actor, now)
            .await?;
        info!(payment_id, reason, actor, "Review rejected");
        Ok(failed)
    }

    /// Fails every record pending longer than the configured age. Records
    /// with a live accept claim or that change underneath the sweep are left
    /// alone. Stale claims whose invoices were issued are settled instead.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = now - self.policy.expire_after();
        let mut expired = Vec::new();
        for record in self.reviews.list_pending().await? {
            if record.pending_since >= cutoff {
                break;
            }
            let payment_id = record.id().to_string();
            let result = match self.check_claim(&record, now).await {
                Ok(ClaimCheck::Free) => self
                    .close(record, ReviewActionKind::Expire, EXPIRED_REASON, SYSTEM_ACTOR, now)
                    .await
                    .map(|_| true),
                Ok(ClaimCheck::Held | ClaimCheck::Settled(_)) => Ok(false),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => expired.push(payment_id),
                Ok(false) => {}
                Err(ReconcileError::ReviewTransitionConflict(_)) => {
                    debug!(payment_id = %payment_id, "Record changed during expiry sweep, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired pending records");
        }
        Ok(expired)
    }

    /// Re-runs matching over the oldest pending records.
    pub async fn recheck(&self, now: DateTime<Utc>) -> Result<RecheckSummary> {
        let mut summary = RecheckSummary::default();
        let mut checked = 0;

        for record in self.reviews.list_pending().await? {
            if checked == self.policy.recheck_batch_size {
                break;
            }
            match self.check_claim(&record, now).await {
                Ok(ClaimCheck::Free) => {}
                Ok(ClaimCheck::Settled(_)) => {
                    summary.resolved += 1;
                    checked += 1;
                    continue;
                }
                Ok(ClaimCheck::Held) | Err(ReconcileError::ReviewTransitionConflict(_)) => continue,
                Err(e) => return Err(e),
            }
            checked += 1;

            let outcome = self.matcher.evaluate(&record.payment).await?;
            if let Ok(winner) = outcome.clone().into_auto_match() {
                match self
                    .accept(record.id(), &winner.registration_id, SYSTEM_ACTOR)
                    .await
                {
                    Ok(_) => summary.resolved += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(payment_id = %record.id(), error = %e, "Automatic accept failed");
                        summary.still_pending += 1;
                    }
                }
                continue;
            }

            let expected = record.attempts;
            let mut refreshed = record;
            refreshed.claim = None;
            refreshed.check_count += 1;
            refreshed.last_checked_at = Some(now);
            refreshed.disposition = outcome.disposition;
            refreshed.candidates = outcome.candidates;

            let result = if refreshed.check_count >= self.policy.max_rechecks {
                self.close(
                    refreshed,
                    ReviewActionKind::Reject,
                    RECHECK_LIMIT_REASON,
                    SYSTEM_ACTOR,
                    now,
                )
                .await
                .map(|_| summary.failed += 1)
            } else {
                refreshed.attempts += 1;
                self.reviews
                    .replace_pending(refreshed, expected)
                    .await
                    .map(|_| summary.still_pending += 1)
            };
            match result {
                Ok(()) | Err(ReconcileError::ReviewTransitionConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            resolved = summary.resolved,
            still_pending = summary.still_pending,
            failed = summary.failed,
            "Recheck sweep finished"
        );
        Ok(summary)
    }

    /// Decides whether another transition may touch `record`. A stale claim
    /// whose invoices were committed is settled on the spot.
    async fn check_claim(
        &self,
        record: &PendingImportRecord,
        now: DateTime<Utc>,
    ) -> Result<ClaimCheck> {
        let Some(claim) = &record.claim else {
            return Ok(ClaimCheck::Free);
        };
        if !claim.is_stale(now, self.policy.claim_timeout()) {
            return Ok(ClaimCheck::Held);
        }
        let Some(pair) = self
            .orchestrator
            .active_pair(record.id(), &claim.registration_id)
            .await?
        else {
            debug!(payment_id = %record.id(), actor = %claim.actor, "Abandoned accept claim, taking over");
            return Ok(ClaimCheck::Free);
        };
        self.finish_accept(record, &claim.actor).await?;
        info!(
            payment_id = %record.id(),
            registration_id = %claim.registration_id,
            invoice = %pair.customer.invoice_number,
            "Settled stale accept claim"
        );
        Ok(ClaimCheck::Settled(pair))
    }

    /// Logs the accept (once) and removes the claimed record.
    async fn finish_accept(&self, claimed: &PendingImportRecord, actor: &str) -> Result<()> {
        let Some(claim) = &claimed.claim else {
            return Err(ReconcileError::ReviewTransitionConflict(claimed.id().to_string()));
        };
        let logged = self
            .reviews
            .actions_for(claimed.id())
            .await?
            .last()
            .is_some_and(|a| a.kind == ReviewActionKind::Accept);
        if !logged {
            self.reviews
                .append_action(ReviewAction {
                    payment_id: claimed.id().to_string(),
                    kind: ReviewActionKind::Accept,
                    actor: actor.to_string(),
                    reason: None,
                    registration_id: Some(claim.registration_id.clone()),
                    at: Utc::now(),
                })
                .await?;
        }
        self.reviews
            .remove_pending(claimed.id(), claimed.attempts)
            .await?;
        Ok(())
    }

    async fn pending(&self, payment_id: &str) -> Result<PendingImportRecord> {
        if let Some(record) = self.reviews.get_pending(payment_id).await? {
            return Ok(record);
        }
        // A concurrent accept that already won leaves its action behind.
        let accepted = self
            .reviews
            .actions_for(payment_id)
            .await?
            .last()
            .is_some_and(|a| a.kind == ReviewActionKind::Accept);
        if accepted {
            Err(ReconcileError::ReviewTransitionConflict(payment_id.to_string()))
        } else {
            Err(ReconcileError::not_found("pending import", payment_id))
        }
    }

    async fn close(
        &self,
        mut record: PendingImportRecord,
        kind: ReviewActionKind,
        reason: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<FailedImportRecord> {
        let event = match kind {
            ReviewActionKind::Expire => ReviewEvent::Expire,
            _ => ReviewEvent::Reject {
                reason: reason.to_string(),
            },
        };
        let expected = record.attempts;
        record.state = record.state.transition(&event)?;
        record.claim = None;
        let action = ReviewAction {
            payment_id: record.id().to_string(),
            kind,
            actor: actor.to_string(),
            reason: Some(reason.to_string()),
            registration_id: None,
            at,
        };
        record.history.push(action.clone());
        let failed = FailedImportRecord {
            record,
            reason: reason.to_string(),
            failed_at: at,
        };
        self.reviews.fail_pending(failed.clone(), expected).await?;
        self.reviews.append_action(action).await?;
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InvoicePolicy, MatchingPolicy, SequenceSettings};
    use crate::domain::matching::{Disposition, MatchCandidate, MatchSignal};
    use crate::domain::money::Money;
    use crate::domain::payment::{Gateway, PayerHints};
    use crate::domain::ports::{PaymentStore, RegistrationStore, ReviewStore};
    use crate::domain::registration::{Contact, Registration};
    use crate::domain::review::ReviewState;
    use crate::infrastructure::in_memory::{
        InMemoryCounterStore, InMemoryInvoiceStore, InMemoryPaymentStore,
        InMemoryRegistrationStore, InMemoryReviewStore,
    };
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap()
    }

    fn payment(id: &str) -> PaymentRecord {
        PaymentRecord {
            payment_id: id.to_string(),
            gateway: Gateway::Stripe,
            amount: Money::new(dec!(75.50)),
            currency: "AUD".to_string(),
            paid_at: at(1),
            payer: PayerHints {
                name: Some("J Smith".to_string()),
                email: None,
            },
            registration_ref: None,
            raw_ref: None,
            linkage: None,
        }
    }

    fn ambiguous(id: &str) -> MatchOutcome {
        MatchOutcome {
            payment_id: id.to_string(),
            disposition: Disposition::Ambiguous,
            candidates: vec![MatchCandidate::new(
                "reg-1",
                0.5,
                MatchSignal::FuzzyName,
                at(1),
            )],
        }
    }

    async fn queue_with(
        reviews: ReviewStoreArc,
        policy: ReviewPolicy,
    ) -> (ReviewQueue, Arc<InMemoryPaymentStore>) {
        let registrations = Arc::new(InMemoryRegistrationStore::new());
        registrations
            .upsert(Registration {
                registration_id: "reg-1".to_string(),
                confirmation_number: "IND-1".to_string(),
                event_name: None,
                total_amount: Money::new(dec!(120.00)),
                processing_fees: None,
                created_at: at(1) - Duration::days(30),
                contact: Contact {
                    name: Some("John Smith".to_string()),
                    ..Contact::default()
                },
                payment_refs: vec![],
                items: vec![],
            })
            .await
            .unwrap();
        let payments = Arc::new(InMemoryPaymentStore::new());
        let orchestrator = Arc::new(InvoiceOrchestrator::new(
            Arc::new(InMemoryInvoiceStore::new()),
            payments.clone(),
            Arc::new(InMemoryCounterStore::new()),
            InvoicePolicy::default(),
            SequenceSettings::default(),
        ));
        let matcher = MatchingEngine::new(registrations.clone(), MatchingPolicy::default());
        let queue = ReviewQueue::new(reviews, registrations, orchestrator, matcher, policy);
        (queue, payments)
    }

    /// Payments are not persisted here, so every accept fails to issue.
    async fn queue() -> (ReviewQueue, Arc<InMemoryReviewStore>) {
        let reviews = Arc::new(InMemoryReviewStore::new());
        let (queue, _) = queue_with(reviews.clone(), ReviewPolicy::default()).await;
        (queue, reviews)
    }

    /// Review store whose action log refuses the next append.
    #[derive(Default)]
    struct FlakyActionLog {
        inner: InMemoryReviewStore,
        fail_next_append: AtomicBool,
    }

    #[async_trait]
    impl ReviewStore for FlakyActionLog {
        async fn insert_pending(&self, record: PendingImportRecord) -> Result<bool> {
            self.inner.insert_pending(record).await
        }

        async fn get_pending(&self, payment_id: &str) -> Result<Option<PendingImportRecord>> {
            self.inner.get_pending(payment_id).await
        }

        async fn list_pending(&self) -> Result<Vec<PendingImportRecord>> {
            self.inner.list_pending().await
        }

        async fn replace_pending(
            &self,
            record: PendingImportRecord,
            expected_attempts: u32,
        ) -> Result<()> {
            self.inner.replace_pending(record, expected_attempts).await
        }

        async fn remove_pending(
            &self,
            payment_id: &str,
            expected_attempts: u32,
        ) -> Result<PendingImportRecord> {
            self.inner.remove_pending(payment_id, expected_attempts).await
        }

        async fn fail_pending(
            &self,
            failed: FailedImportRecord,
            expected_attempts: u32,
        ) -> Result<()> {
            self.inner.fail_pending(failed, expected_attempts).await
        }

        async fn get_failed(&self, payment_id: &str) -> Result<Option<FailedImportRecord>> {
            self.inner.get_failed(payment_id).await
        }

        async fn list_failed(&self) -> Result<Vec<FailedImportRecord>> {
            self.inner.list_failed().await
        }

        async fn append_action(&self, action: ReviewAction) -> Result<()> {
            if self.fail_next_append.swap(false, Ordering::SeqCst) {
                return Err(ReconcileError::StoreUnavailable("action log offline".into()));
            }
            self.inner.append_action(action).await
        }

        async fn actions_for(&self, payment_id: &str) -> Result<Vec<ReviewAction>> {
            self.inner.actions_for(payment_id).await
        }
    }

    /// Accepts `p1` while the action log is down, leaving the claim behind.
    async fn accept_with_failed_bookkeeping(
        policy: ReviewPolicy,
    ) -> (ReviewQueue, Arc<FlakyActionLog>, InvoicePair) {
        let reviews = Arc::new(FlakyActionLog::default());
        let (queue, payments) = queue_with(reviews.clone(), policy).await;
        payments.insert(payment("p1")).await.unwrap();
        queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(2)).await.unwrap();

        reviews.fail_next_append.store(true, Ordering::SeqCst);
        let pair = queue.accept("p1", "reg-1", "alice").await.unwrap();
        let stuck = reviews.get_pending("p1").await.unwrap().unwrap();
        assert_eq!(stuck.claim.as_ref().map(|c| c.actor.as_str()), Some("alice"));
        (queue, reviews, pair)
    }

    #[tokio::test]
    async fn test_retry_settles_claim_left_by_failed_bookkeeping() {
        let policy = ReviewPolicy {
            claim_timeout_secs: 0,
            ..ReviewPolicy::default()
        };
        let (queue, reviews, pair) = accept_with_failed_bookkeeping(policy).await;

        let again = queue.accept("p1", "reg-1", "bob").await.unwrap();
        assert_eq!(again.pair_id, pair.pair_id);
        assert!(reviews.get_pending("p1").await.unwrap().is_none());

        let history = queue.history("p1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, ReviewActionKind::Accept);
        assert_eq!(history[0].actor, "alice");
    }

    #[tokio::test]
    async fn test_live_claim_blocks_then_expiry_settles_it() {
        let (queue, reviews, _) = accept_with_failed_bookkeeping(ReviewPolicy::default()).await;

        let err = queue.reject("p1", "wrong person", "bob").await.unwrap_err();
        assert!(matches!(err, ReconcileError::ReviewTransitionConflict(_)));
        assert!(queue.expire(Utc::now()).await.unwrap().is_empty());
        assert!(reviews.get_pending("p1").await.unwrap().is_some());

        let expired = queue.expire(Utc::now() + Duration::days(365)).await.unwrap();
        assert!(expired.is_empty());
        assert!(reviews.get_pending("p1").await.unwrap().is_none());
        assert!(reviews.get_failed("p1").await.unwrap().is_none());
        assert_eq!(queue.history("p1").await.unwrap()[0].kind, ReviewActionKind::Accept);
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_taken_over() {
        let reviews = Arc::new(InMemoryReviewStore::new());
        let (queue, payments) = queue_with(reviews.clone(), ReviewPolicy::default()).await;
        payments.insert(payment("p1")).await.unwrap();
        queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(2)).await.unwrap();

        let mut abandoned = reviews.get_pending("p1").await.unwrap().unwrap();
        abandoned.attempts = 1;
        abandoned.claim = Some(ReviewClaim {
            registration_id: "reg-1".to_string(),
            actor: "crashed".to_string(),
            claimed_at: at(2),
        });
        reviews.replace_pending(abandoned, 0).await.unwrap();

        let pair = queue.accept("p1", "reg-1", "alice").await.unwrap();
        assert_eq!(pair.customer.invoice_number, "LTIV-25060001");
        assert!(reviews.get_pending("p1").await.unwrap().is_none());
        assert_eq!(queue.history("p1").await.unwrap()[0].actor, "alice");
    }

    #[tokio::test]
    async fn test_enqueue_is_unique_per_payment() {
        let (queue, _) = queue().await;
        assert!(queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(2)).await.unwrap());
        assert!(!queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(3)).await.unwrap());
        assert_eq!(queue.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_is_oldest_first() {
        let (queue, _) = queue().await;
        queue.enqueue_at(payment("newer"), &ambiguous("newer"), at(5)).await.unwrap();
        queue.enqueue_at(payment("older"), &ambiguous("older"), at(2)).await.unwrap();
        let ids: Vec<_> = queue
            .list()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["older", "newer"]);
    }

    #[tokio::test]
    async fn test_reject_is_final() {
        let (queue, reviews) = queue().await;
        queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(2)).await.unwrap();

        let failed = queue.reject("p1", "duplicate entry", "alice").await.unwrap();
        assert_eq!(failed.reason, "duplicate entry");
        assert!(matches!(failed.record.state, ReviewState::Rejected { .. }));
        assert_eq!(failed.record.history.len(), 1);
        assert!(reviews.get_pending("p1").await.unwrap().is_none());

        let err = queue.accept("p1", "reg-1", "alice").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_accept_keeps_record_pending() {
        let (queue, reviews) = queue().await;
        queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(2)).await.unwrap();

        let err = queue.accept("p1", "reg-1", "alice").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { kind: "payment", .. }));

        let record = reviews.get_pending("p1").await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.claim.is_none());
        assert_eq!(record.state, ReviewState::Pending);
    }

    #[tokio::test]
    async fn test_accept_unknown_registration_is_not_found() {
        let (queue, reviews) = queue().await;
        queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(2)).await.unwrap();

        let err = queue.accept("p1", "reg-404", "alice").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { kind: "registration", .. }));
        assert_eq!(reviews.get_pending("p1").await.unwrap().unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_expire_moves_only_old_records() {
        let (queue, reviews) = queue().await;
        queue.enqueue_at(payment("old"), &ambiguous("old"), at(1)).await.unwrap();
        queue.enqueue_at(payment("fresh"), &ambiguous("fresh"), at(20)).await.unwrap();

        let expired = queue.expire(at(1) + Duration::days(31)).await.unwrap();
        assert_eq!(expired, vec!["old"]);

        let failed = reviews.get_failed("old").await.unwrap().unwrap();
        assert_eq!(failed.reason, EXPIRED_REASON);
        assert_eq!(failed.record.state, ReviewState::Expired);
        assert_eq!(queue.history("old").await.unwrap()[0].actor, SYSTEM_ACTOR);
        assert!(reviews.get_pending("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recheck_fails_record_at_limit() {
        let (queue, reviews) = queue().await;
        queue.enqueue_at(payment("p1"), &ambiguous("p1"), at(2)).await.unwrap();

        for _ in 0..4 {
            let summary = queue.recheck(at(3)).await.unwrap();
            assert_eq!(summary.still_pending, 1);
        }
        let record = reviews.get_pending("p1").await.unwrap().unwrap();
        assert_eq!(record.check_count, 4);
        assert_eq!(record.last_checked_at, Some(at(3)));

        let summary = queue.recheck(at(3)).await.unwrap();
        assert_eq!(summary.failed, 1);
        let failed = reviews.get_failed("p1").await.unwrap().unwrap();
        assert_eq!(failed.reason, RECHECK_LIMIT_REASON);
    }
}
