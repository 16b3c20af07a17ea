use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feed_rs::model::{Entry, Feed};
use feed_rs::parser;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use common::{IngestionConfig, SourceConfig};

use crate::error::{chain_message, ProviderError};
use crate::model::CandidateItem;
use crate::retry::RetryPolicy;

const DEFAULT_LOOKBACK_HOURS: u64 = 6;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
/// Longest lookback honoured, about a century.
pub const MAX_LOOKBACK_HOURS: u64 = 24 * 366 * 100;

/// Lookback window for `hours`, clamped to `MAX_LOOKBACK_HOURS`.
pub fn lookback_window(hours: u64) -> ChronoDuration {
    if hours > MAX_LOOKBACK_HOURS {
        debug!(hours, max = MAX_LOOKBACK_HOURS, "lookback clamped");
    }
    ChronoDuration::hours(hours.min(MAX_LOOKBACK_HOURS) as i64)
}

/// Fetches a feed from the given URL and parses it. One attempt only; a 429 comes back as
/// `ProviderError::RateLimited` so the retry envelope can decide.
pub async fn fetch_feed(client: &Client, url: &str) -> Result<Feed> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("network error fetching {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let err = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited {
                status: status.as_u16(),
                body,
            }
        } else {
            ProviderError::Rejected {
                status: status.as_u16(),
                body,
            }
        };
        return Err(anyhow::Error::new(err).context(format!("feed fetch failed for {}", url)));
    }

    let bytes = response.bytes().await.context("failed to read response body")?;
    let feed = parser::parse(bytes.as_ref())
        .map_err(|e| ProviderError::Malformed(e.to_string()))
        .with_context(|| format!("failed to parse feed {}", url))?;
    Ok(feed)
}

/// Turn feed entries into candidates for `source`.
///
/// Entries without a link are dropped, as are entries published before `now - lookback`.
/// Undated entries are kept with an unknown publication time.
pub fn entries_to_candidates(
    source: &SourceConfig,
    entries: Vec<Entry>,
    lookback: Option<ChronoDuration>,
    now: DateTime<Utc>,
) -> Vec<CandidateItem> {
    // A window reaching past the representable range means no cutoff.
    let cutoff = lookback.and_then(|window| now.checked_sub_signed(window));
    let mut candidates = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(url) = entry.links.first().map(|l| l.href.trim().to_string()) else {
            debug!(source = %source.name, entry = %entry.id, "entry without link skipped");
            continue;
        };
        if url.is_empty() {
            continue;
        }

        let published = entry.published.or(entry.updated);
        if let (Some(cutoff), Some(published)) = (cutoff, published) {
            if published < cutoff {
                continue;
            }
        }

        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default();
        let summary_html = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .unwrap_or_default();

        let mut candidate = CandidateItem::new(url, title, source.name.clone())
            .with_summary(plain_text(&summary_html))
            .with_published_at(published);
        if let Some(region) = &source.region {
            candidate = candidate.with_region(region.clone());
        }
        candidates.push(candidate);
    }

    candidates
}

/// Strip markup from a feed summary. Falls back to the raw text if conversion fails.
fn plain_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    match html2text::from_read(html.as_bytes(), 200) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!("failed to convert summary HTML to text: {}", e);
            html.trim().to_string()
        }
    }
}

/// Fetch every configured source and return all candidates found. A source that fails is
/// logged and skipped.
pub async fn collect_candidates(
    sources: &[SourceConfig],
    settings: Option<&IngestionConfig>,
    retry: &RetryPolicy,
) -> Result<Vec<CandidateItem>> {
    let timeout_secs = settings
        .and_then(|s| s.fetch_timeout_seconds)
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
    let lookback_hours = settings
        .and_then(|s| s.lookback_hours)
        .unwrap_or(DEFAULT_LOOKBACK_HOURS);

    let client = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent("Newsgate/0.1.0")
        .build()
        .context("failed to build reqwest client")?;

    let lookback = lookback_window(lookback_hours);
    let now = Utc::now();
    let mut all = Vec::new();

    for source in sources {
        let operation = format!("fetch_feed {}", source.name);
        match retry
            .execute(&operation, || fetch_feed(&client, &source.url))
            .await
        {
            Ok(feed) => {
                let found = entries_to_candidates(source, feed.entries, Some(lookback), now);
                info!(source = %source.name, candidates = found.len(), "feed ingested");
                all.extend(found);
            }
            Err(err) => {
                warn!(source = %source.name, error = %chain_message(&err), "feed skipped");
            }
        }
    }

    info!(sources = sources.len(), candidates = all.len(), "ingestion done");
    Ok(all)
}
