//! Application layer containing the reconciliation services.
//!
//! Everything here talks to storage through the `domain::ports` traits only.
//! `Services` wires the shared instances once so the pipeline, the review
//! commands and the sweeps all see the same matcher and orchestrator.

pub mod batch;
pub mod dedup;
pub mod distribution;
pub mod invoice;
pub mod matcher;
pub mod pipeline;
pub mod review;
pub mod sequence;

use crate::config::Config;
use crate::domain::ports::Stores;
use batch::BatchTracker;
use dedup::DedupFilter;
use invoice::InvoiceOrchestrator;
use matcher::MatchingEngine;
use review::ReviewQueue;
use sequence::SequenceAllocator;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub dedup: DedupFilter,
    pub tracker: BatchTracker,
    pub matcher: MatchingEngine,
    pub orchestrator: Arc<InvoiceOrchestrator>,
    pub queue: Arc<ReviewQueue>,
    pub transactions: SequenceAllocator,
}

impl Services {
    pub fn new(stores: &Stores, config: &Config) -> Self {
        let matcher = MatchingEngine::new(stores.registrations.clone(), config.matching.clone());
        let orchestrator = Arc::new(InvoiceOrchestrator::new(
            stores.invoices.clone(),
            stores.payments.clone(),
            stores.counters.clone(),
            config.invoice.clone(),
            config.sequence.clone(),
        ));
        let queue = Arc::new(ReviewQueue::new(
            stores.reviews.clone(),
            stores.registrations.clone(),
            orchestrator.clone(),
            matcher.clone(),
            config.review.clone(),
        ));
        Self {
            dedup: DedupFilter::new(stores.payments.clone()),
            tracker: BatchTracker::new(stores.batches.clone()),
            matcher,
            orchestrator,
            queue,
            transactions: SequenceAllocator::new(stores.counters.clone(), config.sequence.clone()),
        }
    }
}
