use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use crate::model::{CycleOutcome, ScoredItem};

/// Where approved items go once a cycle is done, and the memory of what already went out.
#[async_trait::async_trait]
pub trait PublicationBackend: Send + Sync {
    /// Titles of the most recent publications, newest first, at most `limit` of them.
    async fn recent_titles(&self, limit: usize) -> Result<Vec<String>>;

    /// Hand off `approved` items, with the cycle's outcome when one exists. Returns a
    /// reference to the published artifact if the backend produces one.
    async fn publish(
        &self,
        topic: &str,
        approved: &[ScoredItem],
        outcome: Option<&CycleOutcome>,
    ) -> Result<Option<String>>;
}

/// Publication backend that only keeps a local log in the `published_items` table.
#[derive(Clone)]
pub struct SqlitePublicationLog {
    pool: SqlitePool,
}

impl SqlitePublicationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PublicationBackend for SqlitePublicationLog {
    async fn recent_titles(&self, limit: usize) -> Result<Vec<String>> {
        let titles = sqlx::query_scalar::<_, String>(
            "SELECT title FROM published_items ORDER BY published_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to load recently published titles")?;
        Ok(titles)
    }

    async fn publish(
        &self,
        topic: &str,
        approved: &[ScoredItem],
        outcome: Option<&CycleOutcome>,
    ) -> Result<Option<String>> {
        let now = Utc::now();
        for scored in approved {
            sqlx::query(
                r#"
                INSERT INTO published_items (identity_key, topic, title, score, published_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(identity_key) DO UPDATE SET
                    topic = excluded.topic,
                    title = excluded.title,
                    score = excluded.score,
                    published_at = excluded.published_at
                "#,
            )
            .bind(&scored.item.identity_key)
            .bind(topic)
            .bind(&scored.item.title)
            .bind(scored.result.score as i64)
            .bind(now)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to log publication of {}", scored.item.identity_key))?;
        }

        info!(topic, items = approved.len(), "publication logged");
        Ok(outcome.map(|o| format!("publication-log:{}/{}", topic, o.period)))
    }
}
