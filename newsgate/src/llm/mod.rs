use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::model::{CandidateItem, ScoringResult};

/// Core trait for text-generation backends
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Scores candidates for relevance. Implementations make one provider call per method
/// invocation and never retry on their own.
#[async_trait::async_trait]
pub trait RelevanceClassifier: Send + Sync {
    /// Classify a whole batch in one call. Results are matched to inputs by
    /// `identity_key`; missing or extra entries are allowed.
    async fn classify_batch(&self, items: &[CandidateItem]) -> Result<Vec<ScoringResult>>;

    /// Classify a single item.
    async fn classify_item(&self, item: &CandidateItem) -> Result<ScoringResult>;
}

/// Decides whether a candidate reports the same specific event as an already published title.
#[async_trait::async_trait]
pub trait DuplicateJudge: Send + Sync {
    /// Returns the matching title from `pool`, or `None` when the event is new.
    async fn compare_duplicate(
        &self,
        title: &str,
        summary: &str,
        pool: &[String],
    ) -> Result<Option<String>>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

pub mod analyst;
pub mod remote;

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Take the outermost object or array, whichever opens first
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    if end < start {
        return None;
    }
    Some(text[start..=end].to_string())
}
