//! Policy parameters for matching, review, invoicing and batch execution.
//!
//! Every field has a default, so an absent or partial JSON file is valid.

use crate::domain::registration::Party;
use crate::error::{ReconcileError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub matching: MatchingPolicy,
    pub review: ReviewPolicy,
    pub invoice: InvoicePolicy,
    pub pipeline: PipelineSettings,
    pub sequence: SequenceSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingPolicy {
    pub auto_accept_threshold: f64,
    pub ambiguous_floor: f64,
    pub amount_tolerance: Decimal,
    pub window_hours: i64,
    pub agreement_bonus: f64,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            auto_accept_threshold: 0.85,
            ambiguous_floor: 0.3,
            amount_tolerance: dec!(0.01),
            window_hours: 72,
            agreement_bonus: 0.15,
        }
    }
}

impl MatchingPolicy {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewPolicy {
    pub expire_after_days: i64,
    pub max_rechecks: u32,
    pub recheck_batch_size: usize,
    /// Age after which an unfinished accept claim may be taken over.
    pub claim_timeout_secs: i64,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            expire_after_days: 30,
            max_rechecks: 5,
            recheck_batch_size: 50,
            claim_timeout_secs: 300,
        }
    }
}

impl ReviewPolicy {
    pub fn expire_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.expire_after_days)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvoicePolicy {
    pub customer_prefix: String,
    pub supplier_prefix: String,
    pub software_fee_rate: Decimal,
    pub gst_rate: Decimal,
    pub organiser: Party,
    pub agent: Party,
}

impl Default for InvoicePolicy {
    fn default() -> Self {
        Self {
            customer_prefix: "LTIV-".to_string(),
            supplier_prefix: "LTSP-".to_string(),
            software_fee_rate: dec!(0.033),
            gst_rate: dec!(0.10),
            organiser: Party {
                name: "Event Organiser".to_string(),
                ..Party::default()
            },
            agent: Party {
                name: "Ticketing Agent".to_string(),
                ..Party::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub workers: usize,
    pub page_size: usize,
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub distribution_retries: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            page_size: 100,
            fetch_retries: 3,
            retry_backoff_ms: 200,
            distribution_retries: 2,
        }
    }
}

impl PipelineSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_ms: 10,
        }
    }
}

impl Config {
    /// Loads a JSON config file, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.matching;
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(m.auto_accept_threshold) || !in_unit(m.ambiguous_floor) {
            return Err(ReconcileError::ConfigError(
                "matching thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if m.ambiguous_floor > m.auto_accept_threshold {
            return Err(ReconcileError::ConfigError(
                "ambiguous_floor must not exceed auto_accept_threshold".to_string(),
            ));
        }
        if m.amount_tolerance < Decimal::ZERO || m.window_hours <= 0 {
            return Err(ReconcileError::ConfigError(
                "amount_tolerance must be >= 0 and window_hours > 0".to_string(),
            ));
        }
        if self.pipeline.workers == 0 || self.pipeline.page_size == 0 {
            return Err(ReconcileError::ConfigError(
                "workers and page_size must be positive".to_string(),
            ));
        }
        if self.review.expire_after_days <= 0 || self.review.max_rechecks == 0 {
            return Err(ReconcileError::ConfigError(
                "expire_after_days and max_rechecks must be positive".to_string(),
            ));
        }
        if self.review.claim_timeout_secs < 0 {
            return Err(ReconcileError::ConfigError(
                "claim_timeout_secs must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matching.auto_accept_threshold, 0.85);
        assert_eq!(config.matching.window(), chrono::Duration::hours(72));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{ "matching": {{ "auto_accept_threshold": 0.9 }}, "pipeline": {{ "workers": 2 }} }}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.matching.auto_accept_threshold, 0.9);
        assert_eq!(config.matching.ambiguous_floor, 0.3);
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.invoice.customer_prefix, "LTIV-");
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = Config::default();
        config.matching.ambiguous_floor = 0.9;
        config.matching.auto_accept_threshold = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ReconcileError::ConfigError(_))
        ));
    }
}
