use super::payment::PayerHints;
use super::registration::Contact;
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field evidence that tied a payment to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSignal {
    ExactId,
    AmountDate,
    FuzzyName,
    FuzzyEmail,
}

/// A scored pairing of a payment with one registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub registration_id: String,
    pub confidence: f64,
    pub signals: BTreeSet<MatchSignal>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl MatchCandidate {
    pub fn new(
        registration_id: impl Into<String>,
        confidence: f64,
        signal: MatchSignal,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            registration_id: registration_id.into(),
            confidence: normalize_confidence(confidence),
            signals: BTreeSet::from([signal]),
            registered_at,
            issues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    AutoMatch,
    Ambiguous,
    Unmatched,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::AutoMatch => "auto_match",
            Disposition::Ambiguous => "ambiguous",
            Disposition::Unmatched => "unmatched",
        }
    }
}

/// The matcher's decision for one payment.
///
/// `candidates` is ranked best first and is empty for `Unmatched`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub payment_id: String,
    pub disposition: Disposition,
    pub candidates: Vec<MatchCandidate>,
}

impl MatchOutcome {
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }

    /// Returns the winning candidate, or the expected non-match outcome as an error.
    pub fn into_auto_match(self) -> Result<MatchCandidate> {
        match self.disposition {
            Disposition::AutoMatch => self
                .candidates
                .into_iter()
                .next()
                .ok_or(ReconcileError::UnmatchedPayment(self.payment_id)),
            Disposition::Ambiguous => Err(ReconcileError::AmbiguousMatch {
                payment_id: self.payment_id,
                candidates: self.candidates.len(),
            }),
            Disposition::Unmatched => Err(ReconcileError::UnmatchedPayment(self.payment_id)),
        }
    }
}

/// Rounds to four places so threshold comparisons are stable across runs.
pub fn normalize_confidence(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

/// Merges raw candidates by registration id and ranks them.
///
/// Merged confidence is the maximum of the inputs, raised by `agreement_bonus`
/// when more than one kind of signal agrees, capped at 1.0. Ranking is by
/// confidence descending, then most recent registration, then id.
pub fn merge_candidates(raw: Vec<MatchCandidate>, agreement_bonus: f64) -> Vec<MatchCandidate> {
    let mut merged: BTreeMap<String, MatchCandidate> = BTreeMap::new();
    for candidate in raw {
        match merged.get_mut(&candidate.registration_id) {
            Some(existing) => {
                existing.confidence = existing.confidence.max(candidate.confidence);
                existing.signals.extend(candidate.signals);
                for issue in candidate.issues {
                    if !existing.issues.contains(&issue) {
                        existing.issues.push(issue);
                    }
                }
            }
            None => {
                merged.insert(candidate.registration_id.clone(), candidate);
            }
        }
    }

    let mut ranked: Vec<MatchCandidate> = merged
        .into_values()
        .map(|mut c| {
            if c.signals.len() > 1 {
                c.confidence = normalize_confidence(c.confidence + agreement_bonus);
            }
            c
        })
        .collect();
    rank_candidates(&mut ranked);
    ranked
}

pub fn rank_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.registered_at.cmp(&a.registered_at))
            .then_with(|| a.registration_id.cmp(&b.registration_id))
    });
}

fn tokens(value: &str) -> BTreeSet<String> {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Overlap of two personal names in (0, 1], or 0 when unrelated.
///
/// Containment of one normalized name in the other scores 1.0; otherwise the
/// score is shared tokens over the larger token set.
pub fn name_overlap(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let ja = ta.iter().cloned().collect::<Vec<_>>().join(" ");
    let jb = tb.iter().cloned().collect::<Vec<_>>().join(" ");
    let (short, long) = if ja.len() <= jb.len() { (&ja, &jb) } else { (&jb, &ja) };
    if ja == jb || (short.len() >= 3 && long.contains(short.as_str())) {
        return 1.0;
    }
    let shared = ta.intersection(&tb).count();
    shared as f64 / ta.len().max(tb.len()) as f64
}

pub fn email_matches(a: &str, b: &str) -> bool {
    let a = a.trim();
    !a.is_empty() && a.eq_ignore_ascii_case(b.trim())
}

/// Party evidence between payer hints and a booking contact.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PartyOverlap {
    pub name: f64,
    pub email: bool,
}

impl PartyOverlap {
    pub fn between(payer: &PayerHints, contact: &Contact) -> Self {
        let name = match (&payer.name, &contact.name) {
            (Some(p), Some(c)) => name_overlap(p, c),
            _ => 0.0,
        };
        let email = match (&payer.email, &contact.email) {
            (Some(p), Some(c)) => email_matches(p, c),
            _ => false,
        };
        Self { name, email }
    }

    pub fn is_related(&self) -> bool {
        self.name > 0.0 || self.email
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_name_overlap_scores() {
        assert_eq!(name_overlap("John Smith", "john  SMITH"), 1.0);
        assert_eq!(name_overlap("J Smith", "John Smith"), 0.5);
        assert_eq!(name_overlap("Smith", "John Smith"), 1.0);
        assert_eq!(name_overlap("Alice Brown", "John Smith"), 0.0);
        assert_eq!(name_overlap("", "John Smith"), 0.0);
    }

    #[test]
    fn test_merge_takes_max_and_adds_agreement_bonus() {
        let raw = vec![
            MatchCandidate::new("r1", 0.7, MatchSignal::AmountDate, at(1)),
            MatchCandidate::new("r1", 0.6, MatchSignal::FuzzyName, at(1)),
            MatchCandidate::new("r2", 0.5, MatchSignal::FuzzyName, at(2)),
        ];
        let merged = merge_candidates(raw, 0.15);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].registration_id, "r1");
        assert_eq!(merged[0].confidence, 0.85);
        assert_eq!(
            merged[0].signals,
            BTreeSet::from([MatchSignal::AmountDate, MatchSignal::FuzzyName])
        );
        assert_eq!(merged[1].confidence, 0.5);
    }

    #[test]
    fn test_merge_caps_at_one() {
        let raw = vec![
            MatchCandidate::new("r1", 1.0, MatchSignal::ExactId, at(1)),
            MatchCandidate::new("r1", 0.7, MatchSignal::AmountDate, at(1)),
        ];
        let merged = merge_candidates(raw, 0.15);
        assert_eq!(merged[0].confidence, 1.0);
    }

    #[test]
    fn test_ties_rank_most_recent_registration_first() {
        let raw = vec![
            MatchCandidate::new("older", 0.5, MatchSignal::FuzzyName, at(1)),
            MatchCandidate::new("newer", 0.5, MatchSignal::FuzzyName, at(5)),
        ];
        let merged = merge_candidates(raw, 0.15);
        assert_eq!(merged[0].registration_id, "newer");
        assert_eq!(merged[1].registration_id, "older");
    }

    #[test]
    fn test_into_auto_match_reports_expected_outcomes() {
        let ambiguous = MatchOutcome {
            payment_id: "p1".into(),
            disposition: Disposition::Ambiguous,
            candidates: vec![MatchCandidate::new("r1", 0.5, MatchSignal::FuzzyName, at(1))],
        };
        assert!(matches!(
            ambiguous.into_auto_match(),
            Err(ReconcileError::AmbiguousMatch { candidates: 1, .. })
        ));

        let unmatched = MatchOutcome {
            payment_id: "p2".into(),
            disposition: Disposition::Unmatched,
            candidates: vec![],
        };
        assert!(matches!(
            unmatched.into_auto_match(),
            Err(ReconcileError::UnmatchedPayment(_))
        ));
    }
}
