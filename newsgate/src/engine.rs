use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use common::EngineConfig;

use crate::cancel::CancellationToken;
use crate::continuity::ContinuityTracker;
use crate::dedup::DedupGate;
use crate::duplicate_guard::SemanticDuplicateGuard;
use crate::error::{chain_message, EngineError};
use crate::llm::{DuplicateJudge, RelevanceClassifier};
use crate::model::{CandidateItem, CycleOutcome, ScoredItem};
use crate::publication::PublicationBackend;
use crate::retry::RetryPolicy;
use crate::scoring::{BatchScoringLoop, ScoringParams, TieredScorer};
use crate::storage::RecordStore;

/// Where each candidate of a cycle ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub candidates: usize,
    /// Already recorded, or repeated within the input.
    pub known: usize,
    /// Left unscored by the early exit; eligible again next cycle.
    pub unscored: usize,
    pub scored: usize,
    pub batches: usize,
    pub fell_back: usize,
    pub sub_threshold: usize,
    pub errored: usize,
    pub semantic_duplicates: usize,
    pub over_limit: usize,
    pub persist_failures: usize,
    pub early_exit: bool,
    /// Scoring stopped at a batch boundary because the cycle was cancelled.
    pub cancelled: bool,
}

/// Output of `Engine::run_cycle`, handed to the generation step.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub topic: String,
    /// Best first, at most `generation_limit` items.
    pub approved: Vec<ScoredItem>,
    pub previous_outcome: Option<CycleOutcome>,
    pub stats: CycleStats,
}

impl CycleReport {
    pub fn continuity_brief(&self) -> Option<String> {
        self.previous_outcome.as_ref().map(CycleOutcome::continuity_brief)
    }
}

/// One topic's acquisition-to-publication pipeline.
pub struct Engine {
    config: EngineConfig,
    retry: RetryPolicy,
    dedup: DedupGate,
    scoring: BatchScoringLoop,
    guard: SemanticDuplicateGuard,
    continuity: ContinuityTracker,
    publication: Arc<dyn PublicationBackend>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        classifier: Arc<dyn RelevanceClassifier>,
        judge: Arc<dyn DuplicateJudge>,
        store: Arc<dyn RecordStore>,
        publication: Arc<dyn PublicationBackend>,
    ) -> Result<Self, EngineError> {
        let retry = RetryPolicy::from_config(&config);
        Self::with_retry(config, retry, classifier, judge, store, publication)
    }

    /// Like `new` with an explicit retry policy instead of the configured one.
    pub fn with_retry(
        config: EngineConfig,
        retry: RetryPolicy,
        classifier: Arc<dyn RelevanceClassifier>,
        judge: Arc<dyn DuplicateJudge>,
        store: Arc<dyn RecordStore>,
        publication: Arc<dyn PublicationBackend>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;

        Ok(Self {
            dedup: DedupGate::new(store.clone(), retry.clone(), config.chunk_size),
            scoring: BatchScoringLoop::new(
                TieredScorer::from_classifier(classifier, retry.clone(), config.fallback_concurrency),
                store.clone(),
                retry.clone(),
            ),
            guard: SemanticDuplicateGuard::new(judge, retry.clone()),
            continuity: ContinuityTracker::new(store, retry.clone()),
            publication,
            retry,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn continuity(&self) -> &ContinuityTracker {
        &self.continuity
    }

    /// Run one cycle for `topic` and return the items worth generating from.
    ///
    /// Record store failures at the cycle boundary (previous outcome, dedup lookup) abort
    /// the cycle. Failures inside the scoring loop only degrade it; the report counts them.
    /// Cancellation ends scoring early, but the batches already persisted still go through
    /// admission and the guard so their relevant items are not lost.
    pub async fn run_cycle(
        &self,
        topic: &str,
        candidates: Vec<CandidateItem>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, EngineError> {
        let mut stats = CycleStats {
            candidates: candidates.len(),
            ..Default::default()
        };
        info!(topic, candidates = stats.candidates, "cycle started");

        let previous_outcome = self.continuity.read(topic).await?;

        let unknown = self.dedup.filter_unknown(candidates).await?;
        stats.known = stats.candidates - unknown.len();

        let params = ScoringParams {
            threshold: self.config.threshold,
            batch_size: self.config.batch_size,
            early_exit_target: self.config.early_exit_target(),
        };
        let run = self.scoring.score(&unknown, params, cancel).await?;
        stats.scored = run.scored.len();
        stats.unscored = unknown.len() - run.scored.len();
        stats.batches = run.batches;
        stats.fell_back = run.fell_back;
        stats.errored = run.errored;
        stats.persist_failures = run.persist_failures;
        stats.early_exit = run.early_exit;
        stats.cancelled = run.cancelled;

        let mut admitted: Vec<ScoredItem> = Vec::with_capacity(run.passing);
        for scored in run.scored {
            if scored.result.passes(self.config.threshold) {
                admitted.push(scored);
            } else if !scored.result.is_error() {
                stats.sub_threshold += 1;
            }
        }
        admitted.sort_by(|a, b| b.result.score.cmp(&a.result.score));

        let recent = self.recent_titles().await;
        let guarded = self
            .guard
            .select(admitted, recent, self.config.generation_limit)
            .await;
        stats.semantic_duplicates = guarded.duplicates.len();
        stats.over_limit = guarded.over_limit;

        info!(
            topic,
            approved = guarded.approved.len(),
            known = stats.known,
            sub_threshold = stats.sub_threshold,
            semantic_duplicates = stats.semantic_duplicates,
            errored = stats.errored,
            unscored = stats.unscored,
            over_limit = stats.over_limit,
            persist_failures = stats.persist_failures,
            early_exit = stats.early_exit,
            cancelled = stats.cancelled,
            "cycle finished"
        );

        Ok(CycleReport {
            topic: topic.to_string(),
            approved: guarded.approved,
            previous_outcome,
            stats,
        })
    }

    /// Record `approved` with the publication backend without closing the cycle.
    pub async fn publish_selection(&self, topic: &str, approved: &[ScoredItem]) -> Result<(), EngineError> {
        self.retry
            .execute("publish", || self.publication.publish(topic, approved, None))
            .await?;
        Ok(())
    }

    /// Publish `approved` with the cycle's `outcome`, then make the outcome the topic's
    /// current one. A reference returned by the backend is stored with the outcome unless
    /// the outcome already carries one.
    pub async fn complete_cycle(
        &self,
        topic: &str,
        approved: &[ScoredItem],
        mut outcome: CycleOutcome,
    ) -> Result<CycleOutcome, EngineError> {
        let reference = self
            .retry
            .execute("publish", || self.publication.publish(topic, approved, Some(&outcome)))
            .await?;
        if outcome.published_ref.is_none() {
            outcome.published_ref = reference;
        }
        self.continuity.write(topic, &outcome).await?;
        Ok(outcome)
    }

    /// The bounded pool of recently published titles. A backend failure shrinks the pool
    /// to this cycle's own approvals.
    async fn recent_titles(&self) -> Vec<String> {
        let limit = self.config.duplicate_pool_size;
        match self
            .retry
            .execute("recent_titles", || self.publication.recent_titles(limit))
            .await
        {
            Ok(titles) => titles,
            Err(err) => {
                warn!(error = %chain_message(&err), "recent titles unavailable, comparing within this cycle only");
                Vec::new()
            }
        }
    }
}
