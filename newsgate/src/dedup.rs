use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::model::CandidateItem;
use crate::retry::RetryPolicy;
use crate::storage::RecordStore;

/// Splits candidates into known and unknown with one batched membership query per chunk.
///
/// Read-only: keys are written by the scoring loop once an item has been processed.
pub struct DedupGate {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl DedupGate {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            store,
            retry,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Return the candidates whose identity key is not yet recorded, in input order.
    ///
    /// A key repeated within `candidates` is kept once (first occurrence), so one story
    /// listed by two feeds is not scored twice in the same cycle.
    pub async fn filter_unknown(
        &self,
        candidates: Vec<CandidateItem>,
    ) -> Result<Vec<CandidateItem>, EngineError> {
        let mut seen = HashSet::new();
        let distinct: Vec<CandidateItem> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.identity_key.clone()))
            .collect();

        let keys: Vec<String> = distinct.iter().map(|c| c.identity_key.clone()).collect();
        let mut known = HashSet::new();
        for (index, chunk) in keys.chunks(self.chunk_size).enumerate() {
            let found = self
                .retry
                .execute("check_known", || self.store.check_known(chunk))
                .await
                .map_err(EngineError::record_store)?;
            debug!(chunk = index, keys = chunk.len(), known = found.len(), "dedup chunk checked");
            known.extend(found);
        }

        let unknown: Vec<CandidateItem> = distinct
            .into_iter()
            .filter(|c| !known.contains(&c.identity_key))
            .collect();
        info!(
            candidates = keys.len(),
            known = known.len(),
            unknown = unknown.len(),
            "dedup gate done"
        );
        Ok(unknown)
    }
}
