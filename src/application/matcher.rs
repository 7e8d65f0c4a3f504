use crate::config::MatchingPolicy;
use crate::domain::matching::{
    Disposition, MatchCandidate, MatchOutcome, MatchSignal, PartyOverlap, merge_candidates,
};
use crate::domain::payment::PaymentRecord;
use crate::domain::ports::RegistrationStoreArc;
use crate::domain::registration::Registration;
use crate::error::Result;
use tracing::debug;

const EXACT_ID_CONFIDENCE: f64 = 1.0;
const AMOUNT_DATE_CONFIDENCE: f64 = 0.7;
const EMAIL_CONFIDENCE: f64 = 0.6;
const FUZZY_BASE: f64 = 0.4;
const FUZZY_SPAN: f64 = 0.2;

/// Scores registrations against a payment and picks a disposition.
///
/// Read-only: neither payments nor registrations are touched. Given the same
/// payment and registration snapshot the outcome is identical on every run.
#[derive(Clone)]
pub struct MatchingEngine {
    registrations: RegistrationStoreArc,
    policy: MatchingPolicy,
}

impl MatchingEngine {
    pub fn new(registrations: RegistrationStoreArc, policy: MatchingPolicy) -> Self {
        Self {
            registrations,
            policy,
        }
    }

    pub async fn evaluate(&self, payment: &PaymentRecord) -> Result<MatchOutcome> {
        let mut raw = Vec::new();

        if let Some(registration_id) = &payment.registration_ref
            && let Some(registration) = self.registrations.get(registration_id).await?
        {
            raw.push(self.exact_candidate(payment, &registration));
        }
        for registration in self
            .registrations
            .find_by_payment_ref(&payment.payment_id)
            .await?
        {
            raw.push(self.exact_candidate(payment, &registration));
        }

        let window = self.policy.window();
        for registration in self
            .registrations
            .find_by_amount_window(
                payment.amount,
                self.policy.amount_tolerance,
                payment.paid_at - window,
                payment.paid_at + window,
            )
            .await?
        {
            raw.push(MatchCandidate::new(
                registration.registration_id,
                AMOUNT_DATE_CONFIDENCE,
                MatchSignal::AmountDate,
                registration.created_at,
            ));
        }

        for registration in self.registrations.find_by_party(&payment.payer).await? {
            let overlap = PartyOverlap::between(&payment.payer, &registration.contact);
            if overlap.name > 0.0 {
                raw.push(MatchCandidate::new(
                    registration.registration_id.clone(),
                    FUZZY_BASE + FUZZY_SPAN * overlap.name,
                    MatchSignal::FuzzyName,
                    registration.created_at,
                ));
            }
            if overlap.email {
                raw.push(MatchCandidate::new(
                    registration.registration_id,
                    EMAIL_CONFIDENCE,
                    MatchSignal::FuzzyEmail,
                    registration.created_at,
                ));
            }
        }

        let candidates = merge_candidates(raw, self.policy.agreement_bonus);
        let outcome = self.decide(&payment.payment_id, candidates);
        debug!(
            payment_id = %payment.payment_id,
            disposition = outcome.disposition.as_str(),
            candidates = outcome.candidates.len(),
            best = outcome.best().map(|c| c.confidence),
            "Matched payment"
        );
        Ok(outcome)
    }

    fn decide(&self, payment_id: &str, candidates: Vec<MatchCandidate>) -> MatchOutcome {
        let best = candidates.first().map(|c| c.confidence).unwrap_or(0.0);
        let (disposition, candidates) = if best >= self.policy.auto_accept_threshold {
            (Disposition::AutoMatch, candidates)
        } else if best >= self.policy.ambiguous_floor {
            (Disposition::Ambiguous, candidates)
        } else {
            (Disposition::Unmatched, Vec::new())
        };
        MatchOutcome {
            payment_id: payment_id.to_string(),
            disposition,
            candidates,
        }
    }

    fn exact_candidate(&self, payment: &PaymentRecord, registration: &Registration) -> MatchCandidate {
        let mut candidate = MatchCandidate::new(
            registration.registration_id.clone(),
            EXACT_ID_CONFIDENCE,
            MatchSignal::ExactId,
            registration.created_at,
        );
        if !payment
            .amount
            .within(registration.total_amount, self.policy.amount_tolerance)
        {
            candidate.issues.push(format!(
                "Amount mismatch: payment {} vs registration {}",
                payment.amount, registration.total_amount
            ));
        }
        if (payment.paid_at - registration.created_at).abs() > self.policy.window() {
            candidate.issues.push(format!(
                "Time mismatch: payment {} vs registration {}",
                payment.paid_at.to_rfc3339(),
                registration.created_at.to_rfc3339()
            ));
        }
        candidate
    }
}
