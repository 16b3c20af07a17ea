use std::sync::Arc;
use tracing::info;

use crate::error::EngineError;
use crate::model::CycleOutcome;
use crate::retry::RetryPolicy;
use crate::storage::RecordStore;

/// Single slot per topic holding the latest cycle outcome.
///
/// Errors are always surfaced: a cycle that proceeds without its predecessor's
/// conclusions could contradict them without noticing.
pub struct ContinuityTracker {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl ContinuityTracker {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn read(&self, topic: &str) -> Result<Option<CycleOutcome>, EngineError> {
        let outcome = self
            .retry
            .execute("read_latest_outcome", || self.store.read_latest_outcome(topic))
            .await
            .map_err(EngineError::record_store)?;
        if let Some(previous) = &outcome {
            info!(topic, period = %previous.period, "previous outcome loaded");
        }
        Ok(outcome)
    }

    /// Supersede whatever outcome `topic` had.
    pub async fn write(&self, topic: &str, outcome: &CycleOutcome) -> Result<(), EngineError> {
        self.retry
            .execute("write_outcome", || self.store.write_outcome(topic, outcome))
            .await
            .map_err(EngineError::record_store)?;
        info!(topic, period = %outcome.period, "outcome recorded");
        Ok(())
    }
}
