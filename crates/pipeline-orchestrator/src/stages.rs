//! Stage request types and stage clients.
//!
//! Each upstream receives a request type built for that stage alone, holding
//! only the fields the stage needs. [`RecommendationRequest`] has no free-text
//! field: recommendations are driven by codes and extracted entities.

use pipeline_config::PipelineConfig;
use pipeline_core::{
    EmbeddingOutput, ExtractedEntities, ExtractionOutput, PipelineInput, Recommendation, RedFlag,
    StageName,
};
use pipeline_resilience::{
    CallOptions, CircuitBreakerRegistry, HealthReport, ResilientClient, Transport, UpstreamResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body sent to the extraction upstream
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequest<'a> {
    /// Free-text transcript
    pub transcript_text: &'a str,
    /// Known condition codes, as extraction hints
    pub condition_codes: &'a [String],
}

/// Body sent to the recommendation upstream
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRequest<'a> {
    /// Condition codes supplied by the caller
    pub condition_codes: &'a [String],
    /// Entities from extraction, when it succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<&'a ExtractedEntities>,
    /// Red flags from extraction
    pub red_flags: &'a [RedFlag],
}

/// Recommendation upstream response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecommendationResponse {
    /// Ranked recommendations
    pub recommendations: Vec<Recommendation>,
}

/// Body sent to the embedding upstream
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingRequest<'a> {
    /// Condition codes to embed
    pub condition_codes: &'a [String],
}

impl<'a> ExtractionRequest<'a> {
    /// Build from the input; `None` without a transcript
    #[must_use]
    pub fn from_input(input: &'a PipelineInput) -> Option<Self> {
        input.transcript().map(|transcript_text| Self {
            transcript_text,
            condition_codes: &input.condition_codes,
        })
    }
}

impl<'a> RecommendationRequest<'a> {
    /// Build from the input and the extraction outcome
    #[must_use]
    pub fn new(input: &'a PipelineInput, extraction: Option<&'a ExtractionOutput>) -> Self {
        Self {
            condition_codes: &input.condition_codes,
            entities: extraction.map(|e| &e.entities),
            red_flags: extraction
                .map(|e| e.red_flags.as_slice())
                .unwrap_or_default(),
        }
    }
}

/// Resilient client bound to one stage endpoint
#[derive(Debug, Clone)]
pub struct StageClient {
    stage: StageName,
    client: ResilientClient,
    path: String,
}

impl StageClient {
    /// Bind `client` to `path`
    #[must_use]
    pub fn new(stage: StageName, client: ResilientClient, path: impl Into<String>) -> Self {
        Self {
            stage,
            client,
            path: path.into(),
        }
    }

    /// Stage served by this client
    #[must_use]
    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Upstream target name
    #[must_use]
    pub fn target(&self) -> &str {
        self.client.target()
    }

    /// Underlying client
    #[must_use]
    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    async fn call<B, T>(&self, body: &B, options: CallOptions) -> UpstreamResult<T>
    where
        B: Serialize + Sync,
        T: serde::de::DeserializeOwned + Send,
    {
        self.client
            .post_json::<B, T>(&self.path, body, options)
            .await
            .map(|response| response.data)
    }
}

/// Clients for all three stages
#[derive(Debug, Clone)]
pub struct StageClients {
    /// Entity extraction
    pub extraction: StageClient,
    /// Template recommendation
    pub recommendation: StageClient,
    /// Embedding enrichment
    pub embedding: StageClient,
}

impl StageClients {
    /// Build clients for the configured targets
    #[must_use]
    pub fn from_config(
        config: &PipelineConfig,
        registry: &CircuitBreakerRegistry,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let build = |stage: StageName, settings: &pipeline_config::TargetSettings| {
            let resolved = settings.resolve(&config.defaults);
            StageClient::new(
                stage,
                ResilientClient::new(resolved.client_config(), registry, Arc::clone(&transport)),
                resolved.path,
            )
        };
        Self {
            extraction: build(StageName::Extraction, &config.targets.extraction),
            recommendation: build(StageName::Recommendation, &config.targets.recommendation),
            embedding: build(StageName::Embedding, &config.targets.embedding),
        }
    }

    /// Call the extraction upstream
    pub async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
        options: CallOptions,
    ) -> UpstreamResult<ExtractionOutput> {
        self.extraction.call(request, options).await
    }

    /// Call the recommendation upstream
    pub async fn recommend(
        &self,
        request: &RecommendationRequest<'_>,
        options: CallOptions,
    ) -> UpstreamResult<Vec<Recommendation>> {
        self.recommendation
            .call::<_, RecommendationResponse>(request, options)
            .await
            .map(|response| response.recommendations)
    }

    /// Call the embedding upstream
    pub async fn embed(
        &self,
        request: &EmbeddingRequest<'_>,
        options: CallOptions,
    ) -> UpstreamResult<EmbeddingOutput> {
        self.embedding.call(request, options).await
    }

    /// All stage clients in stage order
    pub fn iter(&self) -> impl Iterator<Item = &StageClient> {
        [&self.extraction, &self.recommendation, &self.embedding].into_iter()
    }

    /// Probe every upstream concurrently
    pub async fn health_check(&self) -> Vec<HealthReport> {
        futures::future::join_all(self.iter().map(|s| s.client.health_check())).await
    }
}
