//! Idempotency keys.
//!
//! A caller that supplies an idempotency key gets at most one execution per
//! key within the retention window. Execution is guarded by a claim written
//! with a single `set_if_absent` and holding the owner's request id. The
//! owner renews the claim for as long as it runs; callers that lose the race
//! poll for the stored result, and take over when the claim is released or
//! lapses. Only the owner can renew or release its claim, and the first
//! stored result wins.

use pipeline_core::{PipelineError, PipelineResult, RequestId};
use pipeline_resilience::{get_json, set_json_if_absent, AbortSignal, KeyValueStore};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RESULT_PREFIX: &str = "pipeline:idem:";
const CLAIM_PREFIX: &str = "pipeline:claim:";

/// Result of resolving an idempotency key
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This caller owns execution for the key
    Acquired,
    /// A stored result exists
    Completed(Box<PipelineResult>),
}

/// Idempotency settings
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Result retention
    pub result_ttl: Duration,
    /// Claim lifetime
    pub claim_ttl: Duration,
    /// Poll interval while another caller holds the claim
    pub poll_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(24 * 3600),
            claim_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Stored results and execution claims
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn KeyValueStore>,
    config: IdempotencyConfig,
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

fn store_fault(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::infrastructure("idempotency_store", e.to_string())
}

impl IdempotencyStore {
    /// Create over `store`
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    fn result_key(key: &str) -> String {
        format!("{RESULT_PREFIX}{key}")
    }

    fn claim_key(key: &str) -> String {
        format!("{CLAIM_PREFIX}{key}")
    }

    /// Stored result for `key`
    pub async fn lookup(&self, key: &str) -> Result<Option<PipelineResult>, PipelineError> {
        get_json(self.store.as_ref(), &Self::result_key(key))
            .await
            .map_err(store_fault)
    }

    /// Return the stored result, or claim execution for `owner`
    ///
    /// Waits while another caller holds the claim. Ends with
    /// [`PipelineError::Aborted`] if `abort` fires while waiting.
    pub async fn resolve(
        &self,
        key: &str,
        owner: &RequestId,
        abort: &AbortSignal,
    ) -> Result<ClaimOutcome, PipelineError> {
        let claim_key = Self::claim_key(key);
        let mut waited = false;

        loop {
            if let Some(result) = self.lookup(key).await? {
                debug!(idempotency_key = %key, waited, "Idempotent replay");
                return Ok(ClaimOutcome::Completed(Box::new(result)));
            }

            let claimed = self
                .store
                .set_if_absent(
                    &claim_key,
                    owner.as_str().as_bytes().to_vec(),
                    Some(self.config.claim_ttl),
                )
                .await
                .map_err(store_fault)?;
            if claimed {
                if waited {
                    info!(
                        idempotency_key = %key,
                        request_id = %owner,
                        "Took over idempotency claim"
                    );
                }
                return Ok(ClaimOutcome::Acquired);
            }

            if !waited {
                debug!(idempotency_key = %key, "Idempotency key in flight, waiting");
                waited = true;
            }
            tokio::select! {
                biased;
                () = abort.aborted() => return Err(PipelineError::Aborted),
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Keep `owner`'s claim alive; never returns
    ///
    /// Renews the claim every third of its lifetime. Run it alongside the
    /// owner's work and drop it when the work ends.
    pub async fn keep_alive(&self, key: &str, owner: &RequestId) -> Infallible {
        let claim_key = Self::claim_key(key);
        let every = (self.config.claim_ttl / 3).max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(every).await;
            let renewed = self
                .store
                .renew_if_equals(&claim_key, owner.as_str().as_bytes(), self.config.claim_ttl)
                .await;
            match renewed {
                Ok(true) => {}
                Ok(false) => {
                    warn!(idempotency_key = %key, request_id = %owner, "Idempotency claim lost");
                    return std::future::pending().await;
                }
                // The next tick retries; the claim stays valid until its TTL
                Err(e) => {
                    warn!(idempotency_key = %key, error = %e, "Failed to renew idempotency claim");
                }
            }
        }
    }

    /// Store `result` unless a result already exists, then drop `owner`'s claim
    ///
    /// Returns the stored result, which is an earlier caller's when one won
    /// the write.
    pub async fn complete(
        &self,
        key: &str,
        owner: &RequestId,
        result: &PipelineResult,
    ) -> Result<PipelineResult, PipelineError> {
        let written = set_json_if_absent(
            self.store.as_ref(),
            &Self::result_key(key),
            result,
            Some(self.config.result_ttl),
        )
        .await
        .map_err(store_fault)?;

        let stored = if written {
            result.clone()
        } else {
            let earlier = self.lookup(key).await?;
            if let Some(earlier) = &earlier {
                info!(
                    idempotency_key = %key,
                    stored_request_id = %earlier.request_id,
                    "Result already stored for idempotency key"
                );
            }
            earlier.unwrap_or_else(|| result.clone())
        };
        self.release(key, owner).await;
        Ok(stored)
    }

    /// Drop `owner`'s claim so a waiting caller can take over
    ///
    /// A claim held by another caller is left alone.
    pub async fn release(&self, key: &str, owner: &RequestId) {
        match self
            .store
            .delete_if_equals(&Self::claim_key(key), owner.as_str().as_bytes())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(idempotency_key = %key, "Idempotency claim no longer held"),
            // The claim TTL still bounds how long waiters are blocked
            Err(e) => {
                warn!(idempotency_key = %key, error = %e, "Failed to release idempotency claim");
            }
        }
    }
}
