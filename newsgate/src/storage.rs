use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::debug;

use crate::model::{CandidateItem, CycleOutcome, Narrative, ScoringResult};

/// System of record for processed identity keys and per-topic cycle outcomes.
///
/// Every write is an upsert, so repeating a write after a retry or a crash is harmless.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Return the subset of `keys` that is already recorded.
    async fn check_known(&self, keys: &[String]) -> Result<HashSet<String>>;

    /// Record that `item` was processed, whatever the outcome. Irrelevant and errored items
    /// are recorded too so later cycles skip them instead of scoring them again.
    async fn persist(&self, item: &CandidateItem, result: &ScoringResult, relevant: bool) -> Result<()>;

    async fn read_latest_outcome(&self, topic: &str) -> Result<Option<CycleOutcome>>;

    /// Replace the current outcome for `topic`.
    async fn write_outcome(&self, topic: &str, outcome: &CycleOutcome) -> Result<()>;
}

/// `RecordStore` backed by the SQLite schema in `migrations/`.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `?, ?, ?` for an IN clause of `n` values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait::async_trait]
impl RecordStore for SqliteRecordStore {
    async fn check_known(&self, keys: &[String]) -> Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT identity_key FROM known_items WHERE identity_key IN ({})",
            placeholders(keys.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let known = query
            .fetch_all(&self.pool)
            .await
            .context("failed to look up known identity keys")?;
        debug!(asked = keys.len(), known = known.len(), "identity key lookup");
        Ok(known.into_iter().collect())
    }

    async fn persist(&self, item: &CandidateItem, result: &ScoringResult, relevant: bool) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO known_items
            (identity_key, title, source_name, region_tag, published_at, raw_summary,
             score, label, reason, is_relevant, first_seen_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(identity_key) DO UPDATE SET
                title = excluded.title,
                source_name = excluded.source_name,
                region_tag = excluded.region_tag,
                published_at = excluded.published_at,
                raw_summary = excluded.raw_summary,
                score = excluded.score,
                label = excluded.label,
                reason = excluded.reason,
                is_relevant = excluded.is_relevant,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.identity_key)
        .bind(&item.title)
        .bind(&item.source_name)
        .bind(&item.region_tag)
        .bind(item.published_at)
        .bind(&item.raw_summary)
        .bind(result.score as i64)
        .bind(result.label.as_str())
        .bind(&result.reason)
        .bind(relevant)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist item {}", item.identity_key))?;
        Ok(())
    }

    async fn read_latest_outcome(&self, topic: &str) -> Result<Option<CycleOutcome>> {
        let row = sqlx::query(
            "SELECT period, narrative_json, published_ref, recorded_at FROM cycle_outcomes WHERE topic = ?",
        )
        .bind(topic)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read outcome for topic {}", topic))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let period: String = row.get("period");
        let narrative_json: String = row.get("narrative_json");
        let narrative: Narrative = serde_json::from_str(&narrative_json)
            .with_context(|| format!("corrupt narrative stored for topic {}", topic))?;

        Ok(Some(CycleOutcome {
            period: NaiveDate::parse_from_str(&period, "%Y-%m-%d")
                .with_context(|| format!("corrupt period stored for topic {}", topic))?,
            narrative,
            published_ref: row.get("published_ref"),
            recorded_at: row.get("recorded_at"),
        }))
    }

    async fn write_outcome(&self, topic: &str, outcome: &CycleOutcome) -> Result<()> {
        let narrative_json =
            serde_json::to_string(&outcome.narrative).context("failed to serialize narrative")?;

        sqlx::query(
            r#"
            INSERT INTO cycle_outcomes (topic, period, narrative_json, published_ref, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(topic) DO UPDATE SET
                period = excluded.period,
                narrative_json = excluded.narrative_json,
                published_ref = excluded.published_ref,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(topic)
        .bind(outcome.period.format("%Y-%m-%d").to_string())
        .bind(&narrative_json)
        .bind(&outcome.published_ref)
        .bind(outcome.recorded_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write outcome for topic {}", topic))?;
        Ok(())
    }
}
