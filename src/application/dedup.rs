use crate::domain::payment::PaymentRecord;
use crate::domain::ports::PaymentStoreArc;
use crate::error::{ReconcileError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Import,
    Skip,
}

/// Decides whether a normalized payment still needs importing.
#[derive(Clone)]
pub struct DedupFilter {
    payments: PaymentStoreArc,
}

impl DedupFilter {
    pub fn new(payments: PaymentStoreArc) -> Self {
        Self { payments }
    }

    /// Lookup failures come back as `TransientIngestion` so the caller fails the
    /// item only; an unreachable store stays fatal.
    pub async fn check(&self, payment: &PaymentRecord) -> Result<DedupDecision> {
        match self.payments.exists(&payment.payment_id).await {
            Ok(true) => Ok(DedupDecision::Skip),
            Ok(false) => Ok(DedupDecision::Import),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Err(ReconcileError::TransientIngestion(format!(
                "duplicate lookup for {} failed: {}",
                payment.payment_id, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use crate::domain::payment::{Gateway, PayerHints};
    use crate::domain::ports::PaymentStore;
    use crate::infrastructure::in_memory::InMemoryPaymentStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn payment(id: &str) -> PaymentRecord {
        PaymentRecord {
            payment_id: id.to_string(),
            gateway: Gateway::Square,
            amount: Money::new(dec!(10.00)),
            currency: "AUD".to_string(),
            paid_at: Utc::now(),
            payer: PayerHints::default(),
            registration_ref: None,
            raw_ref: None,
            linkage: None,
        }
    }

    #[tokio::test]
    async fn test_known_payment_is_skipped() {
        let store = Arc::new(InMemoryPaymentStore::new());
        store.insert(payment("p1")).await.unwrap();
        let filter = DedupFilter::new(store);

        assert_eq!(
            filter.check(&payment("p1")).await.unwrap(),
            DedupDecision::Skip
        );
        assert_eq!(
            filter.check(&payment("p2")).await.unwrap(),
            DedupDecision::Import
        );
    }
}
