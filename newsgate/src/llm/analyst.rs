use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use super::{extract_json_from_text, DuplicateJudge, LlmProvider, LlmRequest, RelevanceClassifier};
use crate::error::ProviderError;
use crate::model::{CandidateItem, ScoringResult};

const SUMMARY_CHARS: usize = 600;

const SCORING_CRITERIA: &str = "You are the editor deciding which incoming stories deserve a full write-up.
Score each story from 0 to 100 for how much it matters to readers who act on market-moving news:
- direct impact on prices, rates or policy (up to 40)
- likely to drive a move over the next days or weeks (up to 30)
- relevance to the regions and sectors we cover (up to 20)
- concrete figures and genuinely new facts (up to 10)
Label each story high, medium or low.";

/// Answers relevance and duplicate questions by prompting an `LlmProvider`.
pub struct PromptedAnalyst {
    provider: Arc<dyn LlmProvider>,
}

impl PromptedAnalyst {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    async fn ask(&self, prompt: String, max_tokens: usize, temperature: f32) -> Result<String> {
        let response = self
            .provider
            .generate(LlmRequest {
                prompt,
                max_tokens: Some(max_tokens),
                temperature: Some(temperature),
                timeout_seconds: None,
            })
            .await?;
        debug!(
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "analyst call completed"
        );
        Ok(response.content)
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn describe(out: &mut String, item: &CandidateItem) {
    let _ = writeln!(out, "id: {}", item.identity_key);
    let _ = writeln!(out, "title: {}", item.title);
    let summary = if item.raw_summary.trim().is_empty() {
        "(none)".to_string()
    } else {
        clip(item.raw_summary.trim(), SUMMARY_CHARS)
    };
    let _ = writeln!(out, "summary: {}", summary);
    let _ = writeln!(out, "source: {}", item.source_name);
    out.push_str("---\n");
}

fn batch_prompt(items: &[CandidateItem]) -> String {
    let mut prompt = String::from(SCORING_CRITERIA);
    prompt.push_str("\n\nStories:\n");
    for item in items {
        describe(&mut prompt, item);
    }
    prompt.push_str(
        "\nAnswer with a JSON array only, one element per story, echoing its id:\n\
         [{\"id\": \"<id>\", \"score\": <0-100>, \"relevance\": \"high|medium|low\", \"reasoning\": \"<two sentences>\"}]",
    );
    prompt
}

fn item_prompt(item: &CandidateItem) -> String {
    let mut prompt = String::from(SCORING_CRITERIA);
    prompt.push_str("\n\nStory:\n");
    describe(&mut prompt, item);
    prompt.push_str(
        "\nAnswer with a JSON object only:\n\
         {\"score\": <0-100>, \"relevance\": \"high|medium|low\", \"reasoning\": \"<two sentences>\"}",
    );
    prompt
}

fn duplicate_prompt(title: &str, summary: &str, pool: &[String]) -> String {
    let mut prompt = String::from(
        "You check whether a new story was already published.\n\
         A duplicate reports the SAME specific event: the same company or actor doing the same thing, \
         even when a different outlet reports it or a roundup repeats it.\n\
         Sharing a topic is NOT enough: two different companies taking similar actions are different events.\n\n",
    );
    let _ = writeln!(prompt, "New story title: {}", title);
    let _ = writeln!(prompt, "New story summary: {}", clip(summary.trim(), SUMMARY_CHARS));
    prompt.push_str("\nAlready published titles:\n");
    for (i, existing) in pool.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {}", i + 1, existing);
    }
    prompt.push_str(
        "\nAnswer with a JSON object only: {\"duplicate_of\": \"<exact published title>\"} \
         or {\"duplicate_of\": null} when the event is new.",
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct ScoreJson {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    score: Option<Value>,
    #[serde(default)]
    relevance: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DuplicateJson {
    #[serde(default)]
    duplicate_of: Option<String>,
}

/// Models answer scores as numbers, floats or quoted strings.
fn coerce_score(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}

fn coerce_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    let cleaned = extract_json_from_text(content)
        .ok_or_else(|| ProviderError::Malformed(format!("no JSON in answer: {}", clip(content, 200))))?;
    let parsed = serde_json::from_str(cleaned.trim().trim_end_matches(','))
        .map_err(|e| ProviderError::Malformed(format!("{} in: {}", e, clip(&cleaned, 200))))?;
    Ok(parsed)
}

fn to_result(identity_key: &str, entry: &ScoreJson) -> Result<ScoringResult> {
    let score = entry
        .score
        .as_ref()
        .and_then(coerce_score)
        .ok_or_else(|| ProviderError::Malformed(format!("missing score for {}", identity_key)))?;
    Ok(ScoringResult::new(
        identity_key,
        score,
        entry.relevance.as_deref(),
        entry.reasoning.clone().unwrap_or_default(),
    ))
}

#[async_trait::async_trait]
impl RelevanceClassifier for PromptedAnalyst {
    async fn classify_batch(&self, items: &[CandidateItem]) -> Result<Vec<ScoringResult>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let content = self
            .ask(batch_prompt(items), 120 * items.len() + 200, 0.2)
            .await
            .context("batch classification call failed")?;
        let entries: Vec<ScoreJson> = parse_json(&content)?;

        let wanted: HashSet<&str> = items.iter().map(|i| i.identity_key.as_str()).collect();
        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(items.len());
        for entry in &entries {
            let Some(id) = entry.id.as_ref().and_then(coerce_id) else {
                continue;
            };
            if !wanted.contains(id.as_str()) || !seen.insert(id.clone()) {
                debug!(id = %id, "ignoring unexpected id in batch answer");
                continue;
            }
            // One unusable entry should not void the rest of the batch.
            match to_result(&id, entry) {
                Ok(result) => results.push(result),
                Err(e) => debug!(id = %id, error = %e, "dropping unusable batch entry"),
            }
        }
        Ok(results)
    }

    async fn classify_item(&self, item: &CandidateItem) -> Result<ScoringResult> {
        let content = self
            .ask(item_prompt(item), 250, 0.2)
            .await
            .context("item classification call failed")?;
        let entry: ScoreJson = parse_json(&content)?;
        to_result(&item.identity_key, &entry)
    }
}

#[async_trait::async_trait]
impl DuplicateJudge for PromptedAnalyst {
    async fn compare_duplicate(
        &self,
        title: &str,
        summary: &str,
        pool: &[String],
    ) -> Result<Option<String>> {
        if pool.is_empty() {
            return Ok(None);
        }
        let content = self
            .ask(duplicate_prompt(title, summary, pool), 150, 0.0)
            .await
            .context("duplicate comparison call failed")?;
        let answer: DuplicateJson = parse_json(&content)?;

        let Some(claimed) = answer.duplicate_of.map(|t| t.trim().to_string()) else {
            return Ok(None);
        };
        if claimed.is_empty() || claimed.eq_ignore_ascii_case("null") || claimed.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        // Only a title from the pool counts, in the pool's spelling.
        let matched = pool
            .iter()
            .find(|existing| existing.trim().eq_ignore_ascii_case(&claimed))
            .cloned();
        if matched.is_none() {
            debug!(claimed = %claimed, "duplicate answer names a title outside the pool");
        }
        Ok(matched)
    }
}
