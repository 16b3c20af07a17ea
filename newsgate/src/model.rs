use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One piece of content discovered by an ingestion adapter.
///
/// `identity_key` is derived from the canonical URL when the item is built and is
/// never reassigned afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub identity_key: String,
    pub url: String,
    pub title: String,
    pub source_name: String,
    /// `None` means the source did not say when it was published.
    pub published_at: Option<DateTime<Utc>>,
    pub raw_summary: String,
    /// Grouping bucket set by the adapter, carried through untouched.
    pub region_tag: Option<String>,
}

impl CandidateItem {
    pub fn new(url: impl Into<String>, title: impl Into<String>, source_name: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            identity_key: identity_key(&url),
            url,
            title: title.into(),
            source_name: source_name.into(),
            published_at: None,
            raw_summary: String::new(),
            region_tag: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.raw_summary = summary.into();
        self
    }

    pub fn with_published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region_tag = Some(region.into());
        self
    }
}

/// SHA-256 hex digest of the canonical form of `url`.
pub fn identity_key(url: &str) -> String {
    hex::encode(Sha256::digest(canonical_url(url).as_bytes()))
}

/// Normalize a URL so trivially different links to the same page share a key:
/// fragment and `utm_*` parameters are dropped, as is a trailing slash on non-root paths.
/// Strings that do not parse as URLs are only trimmed.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = url::Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    parsed.set_fragment(None);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }

    if parsed.path().len() > 1 && parsed.path().ends_with('/') {
        let path = parsed.path().trim_end_matches('/').to_string();
        parsed.set_path(&path);
    }

    parsed.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelevanceLabel {
    High,
    Medium,
    Low,
    /// Sentinel for an item whose classification failed for good.
    Error,
}

impl RelevanceLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceLabel::High => "high",
            RelevanceLabel::Medium => "medium",
            RelevanceLabel::Low => "low",
            RelevanceLabel::Error => "error",
        }
    }

    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => RelevanceLabel::High,
            50..=79 => RelevanceLabel::Medium,
            _ => RelevanceLabel::Low,
        }
    }

    /// Parse a label as a provider would spell it. The error sentinel is never accepted
    /// from outside.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" => Some(RelevanceLabel::High),
            "medium" => Some(RelevanceLabel::Medium),
            "low" => Some(RelevanceLabel::Low),
            _ => None,
        }
    }
}

impl fmt::Display for RelevanceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub identity_key: String,
    /// Always within 0..=100.
    pub score: u8,
    pub label: RelevanceLabel,
    pub reason: String,
}

impl ScoringResult {
    /// Build a result from raw provider values. Out-of-range scores are clamped and a
    /// missing or unknown label is derived from the score.
    pub fn new(identity_key: impl Into<String>, score: i64, label: Option<&str>, reason: impl Into<String>) -> Self {
        let score = score.clamp(0, 100) as u8;
        let label = label
            .and_then(RelevanceLabel::parse)
            .unwrap_or_else(|| RelevanceLabel::from_score(score));
        Self {
            identity_key: identity_key.into(),
            score,
            label,
            reason: reason.into(),
        }
    }

    /// Terminal outcome for an item that could not be classified.
    pub fn error(identity_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            identity_key: identity_key.into(),
            score: 0,
            label: RelevanceLabel::Error,
            reason: reason.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.label == RelevanceLabel::Error
    }

    /// Admission into the duplicate guard: `score >= threshold`. Error sentinels never pass.
    pub fn passes(&self, threshold: u8) -> bool {
        !self.is_error() && self.score >= threshold
    }
}

/// A candidate together with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item: CandidateItem,
    pub result: ScoringResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub condition: String,
    /// Percent, 0..=100.
    pub probability: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenarios {
    pub main: Scenario,
    pub bull: Scenario,
    pub bear: Scenario,
}

/// The structured conclusion a cycle hands to the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub headline: String,
    #[serde(default)]
    pub regime: Option<String>,
    #[serde(default)]
    pub sentiment: Option<i32>,
    pub scenarios: Scenarios,
}

/// Continuity record for one topic. Only the latest one per topic is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub period: NaiveDate,
    pub narrative: Narrative,
    /// Where the cycle's output was published, if it was.
    #[serde(default)]
    pub published_ref: Option<String>,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl CycleOutcome {
    pub fn new(period: NaiveDate, narrative: Narrative) -> Self {
        Self {
            period,
            narrative,
            published_ref: None,
            recorded_at: Utc::now(),
        }
    }

    /// Render this outcome as the context block the next cycle's generation step receives,
    /// so it can say which of the projected scenarios held.
    pub fn continuity_brief(&self) -> String {
        let mut brief = format!(
            "Previous cycle ({}): {}\n",
            self.period, self.narrative.headline
        );
        if let Some(regime) = &self.narrative.regime {
            brief.push_str(&format!("Regime: {}\n", regime));
        }
        if let Some(sentiment) = self.narrative.sentiment {
            brief.push_str(&format!("Sentiment: {}\n", sentiment));
        }
        let scenarios = &self.narrative.scenarios;
        for (name, scenario) in [
            ("Main", &scenarios.main),
            ("Bull", &scenarios.bull),
            ("Bear", &scenarios.bear),
        ] {
            let probability = scenario
                .probability
                .map(|p| format!("{}%", p))
                .unwrap_or_else(|| "?".to_string());
            brief.push_str(&format!("{} [{}]: {}\n", name, probability, scenario.condition));
        }
        if let Some(reference) = &self.published_ref {
            brief.push_str(&format!("Published: {}\n", reference));
        }
        brief.push_str("Confirm or refute each scenario above against today's evidence.");
        brief
    }
}
