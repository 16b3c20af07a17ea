use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{chain_message, EngineError};
use crate::llm::DuplicateJudge;
use crate::model::ScoredItem;
use crate::retry::RetryPolicy;

/// Catches the same event arriving under a different URL.
///
/// Matching is event-level: the same company's action reported by two outlets is a
/// duplicate, two companies doing similar things are not. The judgement itself belongs to
/// the pluggable `DuplicateJudge`.
pub struct SemanticDuplicateGuard {
    judge: Arc<dyn DuplicateJudge>,
    retry: RetryPolicy,
}

/// Result of running the guard over a cycle's admitted items.
#[derive(Debug, Default)]
pub struct GuardOutcome {
    pub approved: Vec<ScoredItem>,
    /// Rejected items with the title they duplicate.
    pub duplicates: Vec<(ScoredItem, String)>,
    /// Items never compared because the approval limit was already reached.
    pub over_limit: usize,
}

impl SemanticDuplicateGuard {
    pub fn new(judge: Arc<dyn DuplicateJudge>, retry: RetryPolicy) -> Self {
        Self { judge, retry }
    }

    /// The title in `pool` reporting the same event, if any. An empty pool never matches
    /// and costs no call.
    pub async fn is_duplicate(
        &self,
        title: &str,
        summary: &str,
        pool: &[String],
    ) -> Result<Option<String>, EngineError> {
        if pool.is_empty() {
            return Ok(None);
        }
        self.retry
            .execute("compare_duplicate", || {
                self.judge.compare_duplicate(title, summary, pool)
            })
            .await
    }

    /// Compare `admitted` one at a time, in order, against `recent_titles` plus every title
    /// approved earlier in this run. Stops comparing once `limit` items are approved.
    ///
    /// A failed comparison lets the item through: a missed duplicate is cheaper than a
    /// dropped story.
    pub async fn select(
        &self,
        admitted: Vec<ScoredItem>,
        recent_titles: Vec<String>,
        limit: usize,
    ) -> GuardOutcome {
        let mut pool = recent_titles;
        let mut outcome = GuardOutcome::default();
        let total = admitted.len();

        for (position, candidate) in admitted.into_iter().enumerate() {
            if outcome.approved.len() >= limit {
                outcome.over_limit = total - position;
                break;
            }

            let verdict = self
                .is_duplicate(&candidate.item.title, &candidate.item.raw_summary, &pool)
                .await;
            match verdict {
                Ok(Some(original)) => {
                    info!(title = %candidate.item.title, duplicate_of = %original, "semantic duplicate skipped");
                    outcome.duplicates.push((candidate, original));
                }
                Ok(None) => {
                    debug!(title = %candidate.item.title, pool = pool.len(), "approved");
                    pool.push(candidate.item.title.clone());
                    outcome.approved.push(candidate);
                }
                Err(err) => {
                    warn!(title = %candidate.item.title, error = %chain_message(&err), "duplicate check failed, approving");
                    pool.push(candidate.item.title.clone());
                    outcome.approved.push(candidate);
                }
            }
        }

        outcome
    }
}
