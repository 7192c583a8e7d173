//! Content-addressed cache for extraction output.
//!
//! Keys are derived from the SHA-256 of the transcript text, so the
//! transcript itself never appears in a store key or a log line.

use pipeline_core::{ExtractionOutput, PipelineError};
use pipeline_resilience::{get_json, set_json, KeyValueStore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const EXTRACTION_PREFIX: &str = "pipeline:extract:";

/// Hex SHA-256 of a transcript
#[must_use]
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extraction output cache
#[derive(Clone)]
pub struct ExtractionCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl std::fmt::Debug for ExtractionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionCache")
            .field("store", &self.store.name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ExtractionCache {
    /// Cache over `store` with entries living for `ttl`
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Store key for a transcript
    #[must_use]
    pub fn key_for(transcript: &str) -> String {
        format!("{EXTRACTION_PREFIX}{}", content_hash(transcript))
    }

    /// Look up the output for a transcript
    pub async fn get(&self, transcript: &str) -> Result<Option<ExtractionOutput>, PipelineError> {
        let key = Self::key_for(transcript);
        let hit = get_json(self.store.as_ref(), &key)
            .await
            .map_err(|e| PipelineError::infrastructure("cache", e.to_string()))?;
        debug!(key = %key, hit = hit.is_some(), "Extraction cache lookup");
        Ok(hit)
    }

    /// Store the output for a transcript
    pub async fn put(
        &self,
        transcript: &str,
        output: &ExtractionOutput,
    ) -> Result<(), PipelineError> {
        let key = Self::key_for(transcript);
        set_json(self.store.as_ref(), &key, output, Some(self.ttl))
            .await
            .map_err(|e| PipelineError::infrastructure("cache", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::RedFlag;
    use pipeline_resilience::MemoryStore;

    #[test]
    fn test_key_is_hashed() {
        let key = ExtractionCache::key_for("Patient reports chest pain");
        assert!(key.starts_with("pipeline:extract:"));
        assert_eq!(key.len(), EXTRACTION_PREFIX.len() + 64);
        assert!(!key.contains("chest"));
        assert_eq!(key, ExtractionCache::key_for("Patient reports chest pain"));
        assert_ne!(key, ExtractionCache::key_for("Patient reports chest pain."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = ExtractionCache::new(Arc::new(MemoryStore::default()), Duration::from_secs(60));
        let output = ExtractionOutput {
            red_flags: vec![RedFlag::new("CRITICAL", "Chest pain")],
            ..Default::default()
        };

        cache.put("chest pain", &output).await.unwrap();
        assert_eq!(cache.get("chest pain").await.unwrap(), Some(output));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("chest pain").await.unwrap(), None);
    }
}
