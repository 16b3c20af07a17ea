use thiserror::Error;

/// Typed failure payload attached by remote adapters (LLM endpoint, feed fetch).
///
/// The retry envelope looks for `RateLimited` anywhere in an error chain to decide
/// whether a call is worth repeating.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited ({status}): {body}")]
    RateLimited { status: u16, body: String },

    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Failure classes surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rate limit or quota error that outlived every retry attempt.
    #[error("{operation} still rate limited after {attempts} attempts")]
    TransientProvider {
        operation: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed response, auth failure or anything else that retrying cannot fix.
    #[error("{operation} failed")]
    PermanentProvider {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// A batch classification call failed; its items can still be scored one by one.
    #[error("batch of {items} items could not be classified")]
    PartialBatchFailure {
        items: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("record store error")]
    RecordStore(#[source] anyhow::Error),

    #[error("invalid engine configuration")]
    InvalidConfig(#[source] anyhow::Error),
}

impl EngineError {
    /// Wrap a retry-envelope failure that happened while talking to the record store.
    pub fn record_store(err: EngineError) -> Self {
        match err {
            EngineError::TransientProvider {
                operation,
                attempts,
                source,
            } => EngineError::RecordStore(
                source.context(format!("{operation} still failing after {attempts} attempts")),
            ),
            EngineError::PermanentProvider { operation, source } => {
                EngineError::RecordStore(source.context(format!("{operation} failed")))
            }
            other => other,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientProvider { .. })
    }
}

/// One-line rendering of an error followed by all of its causes.
pub fn chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(err), |e| e.source())
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_message_includes_every_cause() {
        let err = EngineError::PartialBatchFailure {
            items: 10,
            source: Box::new(EngineError::PermanentProvider {
                operation: "classify_batch".to_string(),
                source: anyhow::Error::new(ProviderError::Malformed("not json".to_string())),
            }),
        };
        assert_eq!(
            chain_message(&err),
            "batch of 10 items could not be classified: classify_batch failed: \
             malformed provider response: not json"
        );
    }

    #[test]
    fn record_store_wrapping_keeps_the_cause() {
        let err = EngineError::record_store(EngineError::TransientProvider {
            operation: "check_known".to_string(),
            attempts: 5,
            source: anyhow::anyhow!("database is locked"),
        });
        assert!(matches!(err, EngineError::RecordStore(_)));
        assert!(chain_message(&err).contains("database is locked"));
        assert!(!err.is_transient());
    }
}
