//! Per-target circuit breaker registry.
//!
//! One breaker per upstream target name, created lazily on first use and
//! kept for the registry's lifetime. The registry is an explicit object
//! handed to clients, so tests get isolated breakers.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerListener, CircuitSnapshot,
};

/// Registry of circuit breakers keyed by target name
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry using `default_config` for every target
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Use a dedicated configuration for one target
    #[must_use]
    pub fn with_target_config(
        mut self,
        target: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.overrides.insert(target.into(), config);
        self
    }

    /// Attach a listener to every breaker the registry creates
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Configuration applied to `target`
    #[must_use]
    pub fn config_for(&self, target: &str) -> &CircuitBreakerConfig {
        self.overrides.get(target).unwrap_or(&self.default_config)
    }

    /// Get the breaker for `target`, creating it on first use
    #[must_use]
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(target.to_string()).or_insert_with(|| {
            let breaker = self.listeners.iter().fold(
                CircuitBreaker::new(target, self.config_for(target).clone()),
                |breaker, listener| breaker.with_listener(Arc::clone(listener)),
            );
            Arc::new(breaker)
        });
        Arc::clone(entry.value())
    }

    /// Breaker for `target` if one was created
    #[must_use]
    pub fn existing(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| Arc::clone(b.value()))
    }

    /// Snapshots of every breaker, sorted by target
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        // Collect first so no shard lock is held while snapshotting
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    /// Reset one breaker. Returns false if it was never created.
    pub fn reset(&self, target: &str) -> bool {
        match self.existing(target) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Number of breakers created so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker was created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
