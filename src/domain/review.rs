use super::matching::{Disposition, MatchCandidate};
use super::payment::PaymentRecord;
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const EXPIRED_REASON: &str = "expired — no action taken";
pub const RECHECK_LIMIT_REASON: &str = "exceeded recheck limit";

/// State of a payment awaiting human or automated review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ReviewState {
    Pending,
    Matched { registration_id: String },
    Rejected { reason: String },
    Expired,
}

impl ReviewState {
    pub fn name(&self) -> &'static str {
        match self {
            ReviewState::Pending => "pending",
            ReviewState::Matched { .. } => "matched",
            ReviewState::Rejected { .. } => "rejected",
            ReviewState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReviewState::Pending)
    }

    /// Applies `event`. Only `Pending` accepts events; every other state is final.
    pub fn transition(&self, event: &ReviewEvent) -> Result<ReviewState> {
        if self.is_terminal() {
            return Err(ReconcileError::InvalidTransition {
                state: self.name(),
                action: event.name(),
            });
        }
        Ok(match event {
            ReviewEvent::Accept { registration_id } => ReviewState::Matched {
                registration_id: registration_id.clone(),
            },
            ReviewEvent::Reject { reason } => ReviewState::Rejected {
                reason: reason.clone(),
            },
            ReviewEvent::Expire => ReviewState::Expired,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewEvent {
    Accept { registration_id: String },
    Reject { reason: String },
    Expire,
}

impl ReviewEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ReviewEvent::Accept { .. } => "accept",
            ReviewEvent::Reject { .. } => "reject",
            ReviewEvent::Expire => "expire",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewActionKind {
    Accept,
    Reject,
    Expire,
}

/// Write-once audit entry for an adjudicated review record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAction {
    pub payment_id: String,
    pub kind: ReviewActionKind,
    pub actor: String,
    pub reason: Option<String>,
    pub registration_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// A payment the matcher could not settle on its own.
///
/// Keyed by `payment_id`, so a payment has at most one active record.
/// `attempts` is the optimistic-concurrency version: every claim bumps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingImportRecord {
    pub payment: PaymentRecord,
    pub pending_since: DateTime<Utc>,
    pub disposition: Disposition,
    pub candidates: Vec<MatchCandidate>,
    pub attempts: u32,
    pub check_count: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Present while an accept is issuing invoices for this record.
    #[serde(default)]
    pub claim: Option<ReviewClaim>,
    pub state: ReviewState,
    pub history: Vec<ReviewAction>,
}

impl PendingImportRecord {
    pub fn new(
        payment: PaymentRecord,
        disposition: Disposition,
        candidates: Vec<MatchCandidate>,
        pending_since: DateTime<Utc>,
    ) -> Self {
        Self {
            payment,
            pending_since,
            disposition,
            candidates,
            attempts: 0,
            check_count: 0,
            last_checked_at: None,
            claim: None,
            state: ReviewState::Pending,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.payment.payment_id
    }

    pub fn candidate(&self, registration_id: &str) -> Option<&MatchCandidate> {
        self.candidates
            .iter()
            .find(|c| c.registration_id == registration_id)
    }
}

/// Accept in progress on a pending record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewClaim {
    pub registration_id: String,
    pub actor: String,
    pub claimed_at: DateTime<Utc>,
}

impl ReviewClaim {
    /// A claim older than `timeout` belongs to an accept that went away.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.claimed_at >= timeout
    }
}

/// Terminal resting place of rejected and expired records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedImportRecord {
    pub record: PendingImportRecord,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}
