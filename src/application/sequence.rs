use crate::config::SequenceSettings;
use crate::domain::ports::CounterStoreArc;
use crate::error::{ReconcileError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Counter cell backing ledger transaction ids.
pub const TRANSACTION_SEQUENCE: &str = "transaction_sequence";

/// Issues strictly increasing ids from one shared counter cell.
///
/// Every call is a single increment-and-fetch against the store; nothing is
/// cached in process. An id allocated by a caller that later fails is simply
/// never used, so gaps are possible but duplicates are not.
#[derive(Clone)]
pub struct SequenceAllocator {
    counters: CounterStoreArc,
    name: String,
    settings: SequenceSettings,
}

impl SequenceAllocator {
    pub fn new(counters: CounterStoreArc, settings: SequenceSettings) -> Self {
        Self::named(counters, TRANSACTION_SEQUENCE, settings)
    }

    pub fn named(
        counters: CounterStoreArc,
        name: impl Into<String>,
        settings: SequenceSettings,
    ) -> Self {
        Self {
            counters,
            name: name.into(),
            settings,
        }
    }

    /// Allocates the next id. Conflicts are retried with exponential backoff and
    /// surfaced once the retry budget is spent.
    pub async fn next(&self) -> Result<u64> {
        let mut backoff = Duration::from_millis(self.settings.backoff_ms);
        let mut attempt = 0;
        loop {
            match self.counters.increment(&self.name).await {
                Ok(value) => {
                    debug!(counter = %self.name, value, "Allocated sequence value");
                    return Ok(value);
                }
                Err(ReconcileError::SequenceAllocationConflict(name))
                    if attempt < self.settings.max_retries =>
                {
                    attempt += 1;
                    warn!(counter = %name, attempt, "Sequence allocation conflict, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Administrative reset. The next allocation returns `value + 1`.
    pub async fn reset_sequence(&self, value: u64) -> Result<()> {
        warn!(counter = %self.name, value, "Resetting sequence");
        self.counters.reset(&self.name, value).await
    }

    pub async fn current(&self) -> Result<Option<u64>> {
        self.counters.current(&self.name).await
    }
}
