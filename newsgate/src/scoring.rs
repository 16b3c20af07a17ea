use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{chain_message, EngineError};
use crate::llm::RelevanceClassifier;
use crate::model::{CandidateItem, ScoredItem, ScoringResult};
use crate::retry::RetryPolicy;
use crate::storage::RecordStore;

/// Tier one: a single classification call for a whole batch.
pub struct BatchStrategy {
    classifier: Arc<dyn RelevanceClassifier>,
    retry: RetryPolicy,
}

impl BatchStrategy {
    pub fn new(classifier: Arc<dyn RelevanceClassifier>, retry: RetryPolicy) -> Self {
        Self { classifier, retry }
    }

    /// Results keyed by identity key. Entries for keys outside `batch` are dropped and the
    /// first entry wins when a key is answered twice. A failed call comes back as
    /// `PartialBatchFailure` so the caller can salvage the items.
    pub async fn score(
        &self,
        batch: &[CandidateItem],
    ) -> Result<HashMap<String, ScoringResult>, EngineError> {
        let results = self
            .retry
            .execute("classify_batch", || self.classifier.classify_batch(batch))
            .await
            .map_err(|err| EngineError::PartialBatchFailure {
                items: batch.len(),
                source: Box::new(err),
            })?;

        let mut by_key: HashMap<String, ScoringResult> = HashMap::with_capacity(batch.len());
        for result in results {
            if batch.iter().any(|item| item.identity_key == result.identity_key) {
                by_key.entry(result.identity_key.clone()).or_insert(result);
            }
        }
        Ok(by_key)
    }
}

/// Tier two: one classification call per item, run on a bounded pool.
///
/// Never fails. An item whose call fails for good gets the error sentinel, which is a
/// terminal classification and still counts toward dedup suppression.
pub struct ItemStrategy {
    classifier: Arc<dyn RelevanceClassifier>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl ItemStrategy {
    pub fn new(classifier: Arc<dyn RelevanceClassifier>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            classifier,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Results come back in completion order, one per item.
    pub async fn score(&self, items: &[&CandidateItem]) -> Vec<ScoringResult> {
        stream::iter(items.iter().copied())
            .map(|item| async move {
                match self
                    .retry
                    .execute("classify_item", || self.classifier.classify_item(item))
                    .await
                {
                    Ok(mut result) => {
                        result.identity_key = item.identity_key.clone();
                        result
                    }
                    Err(err) => {
                        let reason = chain_message(&err);
                        warn!(identity_key = %item.identity_key, error = %reason, "item classification failed, recording error outcome");
                        ScoringResult::error(&item.identity_key, reason)
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await
    }
}

/// Scores of one batch, in the batch's input order.
#[derive(Debug, Default)]
pub struct BatchScores {
    pub results: Vec<ScoringResult>,
    /// Items that needed the per-item tier.
    pub fell_back: usize,
}

/// Batch tier first, item tier for everything the batch tier did not answer: the whole
/// batch when the call failed, or only the items missing from its answer.
pub struct TieredScorer {
    batch: BatchStrategy,
    item: ItemStrategy,
}

impl TieredScorer {
    pub fn new(batch: BatchStrategy, item: ItemStrategy) -> Self {
        Self { batch, item }
    }

    pub fn from_classifier(
        classifier: Arc<dyn RelevanceClassifier>,
        retry: RetryPolicy,
        fallback_concurrency: usize,
    ) -> Self {
        Self::new(
            BatchStrategy::new(classifier.clone(), retry.clone()),
            ItemStrategy::new(classifier, retry, fallback_concurrency),
        )
    }

    pub async fn score_batch(&self, batch: &[CandidateItem]) -> BatchScores {
        let mut by_key = match self.batch.score(batch).await {
            Ok(by_key) => by_key,
            Err(err) => {
                warn!(items = batch.len(), error = %chain_message(&err), "batch classification failed, scoring items individually");
                HashMap::new()
            }
        };

        let missing: Vec<&CandidateItem> = batch
            .iter()
            .filter(|item| !by_key.contains_key(&item.identity_key))
            .collect();
        let fell_back = missing.len();
        if fell_back > 0 {
            debug!(items = fell_back, "per-item fallback");
            for result in self.item.score(&missing).await {
                by_key.insert(result.identity_key.clone(), result);
            }
        }

        let results = batch
            .iter()
            .filter_map(|item| by_key.remove(&item.identity_key))
            .collect();
        BatchScores { results, fell_back }
    }
}

/// Knobs of one scoring run.
#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
    pub threshold: u8,
    pub batch_size: usize,
    /// Stop once this many items pass the threshold.
    pub early_exit_target: usize,
}

/// What a scoring run produced. `scored` may cover only a prefix of the input.
#[derive(Debug, Default)]
pub struct ScoringRun {
    pub scored: Vec<ScoredItem>,
    pub batches: usize,
    pub passing: usize,
    pub early_exit: bool,
    pub fell_back: usize,
    pub errored: usize,
    pub persist_failures: usize,
    /// The token fired before the input ran out.
    pub cancelled: bool,
}

/// Sequential batch loop with per-batch persistence and an early exit.
pub struct BatchScoringLoop {
    scorer: TieredScorer,
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl BatchScoringLoop {
    pub fn new(scorer: TieredScorer, store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self { scorer, store, retry }
    }

    /// Score `unknown` batch by batch until the input runs out or the early-exit target is
    /// reached. Every item of a finished batch is persisted, relevant or not, so the dedup
    /// gate skips it from then on. Items after the exit point are neither scored nor
    /// persisted.
    ///
    /// `cancel` is checked before each batch. A cancelled run stops there and returns what
    /// the completed batches produced, with `cancelled` set.
    pub async fn score(
        &self,
        unknown: &[CandidateItem],
        params: ScoringParams,
        cancel: &CancellationToken,
    ) -> Result<ScoringRun, EngineError> {
        let batch_size = params.batch_size.max(1);
        let target = params.early_exit_target.max(1);
        let total_batches = unknown.len().div_ceil(batch_size);
        let mut run = ScoringRun::default();

        for (index, batch) in unknown.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!(
                    completed_batches = run.batches,
                    scored = run.scored.len(),
                    "scoring cancelled"
                );
                run.cancelled = true;
                break;
            }

            let BatchScores { results, fell_back } = self.scorer.score_batch(batch).await;
            run.batches += 1;
            run.fell_back += fell_back;

            let items: HashMap<&str, &CandidateItem> =
                batch.iter().map(|item| (item.identity_key.as_str(), item)).collect();
            let mut batch_passing = 0;
            for result in results {
                let Some(item) = items.get(result.identity_key.as_str()).copied() else {
                    continue;
                };
                let relevant = result.passes(params.threshold);
                if relevant {
                    batch_passing += 1;
                }
                if result.is_error() {
                    run.errored += 1;
                }

                let persisted = self
                    .retry
                    .execute("persist", || self.store.persist(item, &result, relevant))
                    .await;
                if let Err(err) = persisted {
                    run.persist_failures += 1;
                    warn!(identity_key = %item.identity_key, error = %chain_message(&err), "failed to persist scored item");
                }

                run.scored.push(ScoredItem {
                    item: item.clone(),
                    result,
                });
            }
            run.passing += batch_passing;

            info!(
                batch = index + 1,
                of = total_batches,
                items = batch.len(),
                passing = batch_passing,
                total_passing = run.passing,
                target,
                "batch scored"
            );

            if run.passing >= target {
                run.early_exit = index + 1 < total_batches;
                if run.early_exit {
                    info!(
                        left_unscored = unknown.len() - run.scored.len(),
                        "early-exit target reached"
                    );
                }
                break;
            }
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::model::CycleOutcome;
    use anyhow::Result;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scores come from the title ("score:NN"); the batch call can be told to fail.
    struct TitleScores {
        batch_error: Option<fn() -> anyhow::Error>,
        failing_items: HashSet<String>,
        omit_from_batch: HashSet<String>,
        batch_calls: AtomicUsize,
        item_calls: AtomicUsize,
    }

    impl TitleScores {
        fn new() -> Self {
            Self {
                batch_error: None,
                failing_items: HashSet::new(),
                omit_from_batch: HashSet::new(),
                batch_calls: AtomicUsize::new(0),
                item_calls: AtomicUsize::new(0),
            }
        }

        fn result(item: &CandidateItem) -> ScoringResult {
            let score = item
                .title
                .strip_prefix("score:")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            ScoringResult::new(&item.identity_key, score, None, "from title")
        }
    }

    #[async_trait::async_trait]
    impl RelevanceClassifier for TitleScores {
        async fn classify_batch(&self, items: &[CandidateItem]) -> Result<Vec<ScoringResult>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(make) = self.batch_error {
                return Err(make());
            }
            Ok(items
                .iter()
                .rev()
                .filter(|i| !self.omit_from_batch.contains(&i.title))
                .map(Self::result)
                .collect())
        }

        async fn classify_item(&self, item: &CandidateItem) -> Result<ScoringResult> {
            self.item_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_items.contains(&item.title) {
                anyhow::bail!("invalid request");
            }
            Ok(Self::result(item))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        persisted: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait::async_trait]
    impl RecordStore for MemoryStore {
        async fn check_known(&self, _: &[String]) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }
        async fn persist(&self, item: &CandidateItem, _: &ScoringResult, relevant: bool) -> Result<()> {
            self.persisted
                .lock()
                .unwrap()
                .push((item.identity_key.clone(), relevant));
            Ok(())
        }
        async fn read_latest_outcome(&self, _: &str) -> Result<Option<CycleOutcome>> {
            Ok(None)
        }
        async fn write_outcome(&self, _: &str, _: &CycleOutcome) -> Result<()> {
            Ok(())
        }
    }

    fn malformed() -> anyhow::Error {
        anyhow::Error::new(ProviderError::Malformed("prose".to_string()))
    }

    fn rate_limited() -> anyhow::Error {
        anyhow::Error::new(ProviderError::RateLimited {
            status: 429,
            body: String::new(),
        })
    }

    fn items(scores: &[u8]) -> Vec<CandidateItem> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| CandidateItem::new(format!("https://x.example/{}", i), format!("score:{}", s), "wire"))
            .collect()
    }

    fn scoring_loop(classifier: Arc<TitleScores>, store: Arc<MemoryStore>) -> BatchScoringLoop {
        let retry = RetryPolicy::immediate(2);
        BatchScoringLoop::new(
            TieredScorer::from_classifier(classifier, retry.clone(), 5),
            store,
            retry,
        )
    }

    fn params(batch_size: usize, target: usize) -> ScoringParams {
        ScoringParams {
            threshold: 85,
            batch_size,
            early_exit_target: target,
        }
    }

    #[tokio::test]
    async fn results_follow_input_order_despite_reordered_answer() {
        let classifier = Arc::new(TitleScores::new());
        let store = Arc::new(MemoryStore::default());
        let input = items(&[10, 20, 30]);

        let run = scoring_loop(classifier, store.clone())
            .score(&input, params(10, 4), &CancellationToken::new())
            .await
            .unwrap();

        let scores: Vec<u8> = run.scored.iter().map(|s| s.result.score).collect();
        assert_eq!(scores, vec![10, 20, 30]);
        assert!(!run.early_exit);
        assert_eq!(store.persisted.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn irrelevant_items_are_persisted_too() {
        let store = Arc::new(MemoryStore::default());
        let input = items(&[90, 5]);

        scoring_loop(Arc::new(TitleScores::new()), store.clone())
            .score(&input, params(10, 4), &CancellationToken::new())
            .await
            .unwrap();

        let persisted = store.persisted.lock().unwrap();
        assert_eq!(
            *persisted,
            vec![
                (input[0].identity_key.clone(), true),
                (input[1].identity_key.clone(), false)
            ]
        );
    }

    #[tokio::test]
    async fn stops_after_the_batch_that_reaches_the_target() {
        let store = Arc::new(MemoryStore::default());
        // Second batch brings the passing count to 2.
        let input = items(&[90, 10, 10, 85, 10, 10, 99, 99, 99]);

        let run = scoring_loop(Arc::new(TitleScores::new()), store.clone())
            .score(&input, params(3, 2), &CancellationToken::new())
            .await
            .unwrap();

        assert!(run.early_exit);
        assert_eq!(run.batches, 2);
        assert_eq!(run.passing, 2);
        assert_eq!(run.scored.len(), 6);
        assert_eq!(store.persisted.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn failed_batch_is_scored_item_by_item() {
        let mut classifier = TitleScores::new();
        classifier.batch_error = Some(malformed as fn() -> anyhow::Error);
        classifier.failing_items.insert("score:70".to_string());
        let classifier = Arc::new(classifier);
        let store = Arc::new(MemoryStore::default());
        let input = items(&[90, 70, 40]);

        let run = scoring_loop(classifier.clone(), store.clone())
            .score(&input, params(10, 4), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.scored.len(), 3);
        assert_eq!(run.fell_back, 3);
        assert_eq!(run.errored, 1);
        assert!(run.scored[1].result.is_error());
        assert_eq!(run.scored[0].result.score, 90);
        // Malformed answers are permanent: one batch call, no retries.
        assert_eq!(classifier.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(classifier.item_calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.persisted.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_on_batch_also_falls_back() {
        let mut classifier = TitleScores::new();
        classifier.batch_error = Some(rate_limited as fn() -> anyhow::Error);
        let classifier = Arc::new(classifier);

        let run = scoring_loop(classifier.clone(), Arc::new(MemoryStore::default()))
            .score(&items(&[90, 10]), params(10, 4), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(classifier.batch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.scored.len(), 2);
        assert_eq!(run.errored, 0);
    }

    #[tokio::test]
    async fn items_missing_from_batch_answer_are_scored_individually() {
        let mut classifier = TitleScores::new();
        classifier.omit_from_batch.insert("score:60".to_string());
        let classifier = Arc::new(classifier);

        let run = scoring_loop(classifier.clone(), Arc::new(MemoryStore::default()))
            .score(&items(&[60, 30]), params(10, 4), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.scored.len(), 2);
        assert_eq!(run.fell_back, 1);
        assert_eq!(classifier.item_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_scores_nothing() {
        let classifier = Arc::new(TitleScores::new());
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = scoring_loop(classifier.clone(), store.clone())
            .score(&items(&[90]), params(10, 4), &cancel)
            .await
            .unwrap();

        assert!(run.cancelled);
        assert_eq!(run.batches, 0);
        assert!(run.scored.is_empty());
        assert_eq!(classifier.batch_calls.load(Ordering::SeqCst), 0);
        assert!(store.persisted.lock().unwrap().is_empty());
    }
}
