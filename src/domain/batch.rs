use super::payment::DateRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Result of processing one payment in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Imported,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub total: u64,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl BatchCounters {
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.total += 1;
        match outcome {
            ItemOutcome::Imported => self.imported += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.total == self.imported + self.skipped + self.failed
    }
}

/// How matching disposed of the payments imported by a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionCounts {
    pub auto_matched: u64,
    pub ambiguous: u64,
    pub unmatched: u64,
}

/// Lifecycle and metrics of one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub batch_id: Uuid,
    pub source: String,
    pub range: DateRange,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub counters: BatchCounters,
    pub dispositions: DispositionCounts,
    pub error: Option<String>,
}

impl ImportBatch {
    pub fn start(source: impl Into<String>, range: DateRange) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            source: source.into(),
            range,
            started_at: Utc::now(),
            finished_at: None,
            status: BatchStatus::Running,
            counters: BatchCounters::default(),
            dispositions: DispositionCounts::default(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != BatchStatus::Running
    }

    /// Moves a running batch to `status`. Returns false if it was already closed.
    pub fn close(&mut self, status: BatchStatus, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
        true
    }
}
