use thiserror::Error;

/// Errors raised by the reconciliation pipeline.
///
/// Several variants describe expected outcomes rather than faults
/// (`DuplicatePayment`, `AmbiguousMatch`, `UnmatchedPayment`): callers recover
/// from them locally by counting a skip or enqueueing a review record.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Transient ingestion error: {0}")]
    TransientIngestion(String),

    #[error("Payment {0} already imported")]
    DuplicatePayment(String),

    #[error("Payment {payment_id} matched {candidates} registrations ambiguously")]
    AmbiguousMatch { payment_id: String, candidates: usize },

    #[error("Payment {0} matched no registration")]
    UnmatchedPayment(String),

    #[error("Active invoice pair already exists for payment {payment_id} / registration {registration_id}")]
    DuplicateInvoice {
        payment_id: String,
        registration_id: String,
    },

    #[error("Sequence allocation conflict on counter '{0}'")]
    SequenceAllocationConflict(String),

    #[error("Invoice generation failed: {reason}")]
    InvoiceGeneration { reason: String, retryable: bool },

    #[error("Review record {0} changed since it was read")]
    ReviewTransitionConflict(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Cannot {action} a review record in state {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
}

impl ReconcileError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True when repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientIngestion(_)
            | Self::SequenceAllocationConflict(_)
            | Self::ReviewTransitionConflict(_) => true,
            Self::InvoiceGeneration { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// True when the persistence layer itself failed and a batch must abort.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            Self::RocksDbError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReconcileError::TransientIngestion("timeout".into()).is_retryable());
        assert!(ReconcileError::SequenceAllocationConflict("tx".into()).is_retryable());
        assert!(
            ReconcileError::InvoiceGeneration {
                reason: "partial write".into(),
                retryable: true
            }
            .is_retryable()
        );
        assert!(!ReconcileError::DuplicatePayment("p1".into()).is_retryable());
        assert!(!ReconcileError::not_found("payment", "p1").is_retryable());
    }

    #[test]
    fn test_store_failures_are_fatal() {
        assert!(ReconcileError::StoreUnavailable("down".into()).is_fatal());
        assert!(!ReconcileError::TransientIngestion("blip".into()).is_fatal());
        assert!(!ReconcileError::DuplicatePayment("p1".into()).is_fatal());
    }

    #[cfg(feature = "storage-rocksdb")]
    #[test]
    fn test_rocksdb_errors_are_fatal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = rocksdb::DB::open_default(file.path().join("db")).unwrap_err();
        assert!(ReconcileError::from(err).is_fatal());
    }
}
