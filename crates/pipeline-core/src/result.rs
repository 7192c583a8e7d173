//! Pipeline result and stage output types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{CorrelationId, RequestId};

/// Pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Entity extraction from free text
    Extraction,
    /// Template / care-plan recommendation
    Recommendation,
    /// Semantic embedding lookup
    Embedding,
}

impl StageName {
    /// Stable string form
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Recommendation => "recommendation",
            Self::Embedding => "embedding",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Upstream answered (or the answer came from cache)
    Succeeded,
    /// Upstream failed and the stage was tolerated as degraded
    Degraded,
}

/// Timing record for one executed stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    /// Stage name
    pub stage: StageName,
    /// Stage start
    pub started_at: DateTime<Utc>,
    /// Stage end
    pub finished_at: DateTime<Utc>,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Output served from the content cache
    pub cached: bool,
    /// Stage outcome
    pub outcome: StageOutcome,
}

/// A clinically urgent finding surfaced by extraction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedFlag {
    /// Severity class, e.g. "CRITICAL" or "WARNING"
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description
    pub description: String,
}

impl RedFlag {
    /// Create a red flag
    #[must_use]
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
        }
    }

    /// Whether the flag is critical
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.kind.eq_ignore_ascii_case("critical")
    }
}

/// Clinical entities extracted from a transcript
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedEntities {
    /// Reported symptoms
    pub symptoms: Vec<String>,
    /// Candidate diagnoses
    pub diagnoses: Vec<String>,
    /// Mentioned medications
    pub medications: Vec<String>,
    /// Extraction confidence (0.0 - 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl ExtractedEntities {
    /// Whether nothing was extracted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symptoms.is_empty() && self.diagnoses.is_empty() && self.medications.is_empty()
    }
}

/// Output of the extraction stage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionOutput {
    /// Extracted entities
    pub entities: ExtractedEntities,
    /// Red flags detected in the transcript
    pub red_flags: Vec<RedFlag>,
}

/// One recommended template or care plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    /// Template identifier
    pub template_id: String,
    /// Display title
    pub title: String,
    /// Relevance score
    #[serde(default)]
    pub score: f32,
    /// Why it was recommended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Output of the embedding stage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingOutput {
    /// Embedding model
    pub model: String,
    /// One vector per embedded condition code
    pub vectors: Vec<Vec<f32>>,
}

/// Combined result of one orchestration invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Request that produced this result
    pub request_id: RequestId,
    /// Correlation id of the producing request
    pub correlation_id: CorrelationId,
    /// Extracted entities; absent when extraction was skipped or degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_entities: Option<ExtractedEntities>,
    /// Red flags surfaced by extraction
    #[serde(default)]
    pub red_flags: Vec<RedFlag>,
    /// Recommendations; empty when the recommendation stage degraded
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    /// Embeddings; absent when skipped or degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbeddingOutput>,
    /// Upstream targets whose failure was tolerated
    #[serde(default)]
    pub degraded_services: Vec<String>,
    /// Stages that actually ran, in completion order
    #[serde(default)]
    pub stages_executed: Vec<StageName>,
    /// Per-stage timings
    #[serde(default)]
    pub timings: Vec<StageTiming>,
    /// Authorization through merge, in milliseconds
    pub total_duration_ms: u64,
    /// Any stage output came from the content cache
    pub cache_hit: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl PipelineResult {
    /// Whether any upstream degraded
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded_services.is_empty()
    }

    /// Timing record for a stage, if it ran
    #[must_use]
    pub fn timing(&self, stage: StageName) -> Option<&StageTiming> {
        self.timings.iter().find(|t| t.stage == stage)
    }

    /// Whether a stage ran
    #[must_use]
    pub fn executed(&self, stage: StageName) -> bool {
        self.stages_executed.contains(&stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_red_flag_wire_format() {
        let flag: RedFlag =
            serde_json::from_str(r#"{"type":"CRITICAL","description":"Chest pain"}"#).unwrap();
        assert!(flag.is_critical());
        assert_eq!(flag.description, "Chest pain");

        let json = serde_json::to_value(&flag).unwrap();
        assert_eq!(json["type"], "CRITICAL");
    }

    #[test]
    fn test_extraction_output_tolerates_missing_fields() {
        let output: ExtractionOutput =
            serde_json::from_str(r#"{"entities":{"symptoms":["chest pain"]}}"#).unwrap();
        assert_eq!(output.entities.symptoms, vec!["chest pain".to_string()]);
        assert!(output.red_flags.is_empty());
        assert!(!output.entities.is_empty());
    }

    #[test]
    fn test_stage_name_serialization() {
        assert_eq!(
            serde_json::to_string(&StageName::Recommendation).unwrap(),
            "\"recommendation\""
        );
        assert_eq!(StageName::Extraction.to_string(), "extraction");
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = PipelineResult {
            request_id: RequestId::from("req-1"),
            correlation_id: CorrelationId::from("corr-1"),
            extracted_entities: None,
            red_flags: vec![],
            recommendations: vec![],
            embeddings: None,
            degraded_services: vec!["extraction-service".to_string()],
            stages_executed: vec![StageName::Recommendation],
            timings: vec![],
            total_duration_ms: 12,
            cache_hit: false,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["degradedServices"][0], "extraction-service");
        assert!(json.get("extractedEntities").is_none());
        assert!(result.is_degraded());
        assert!(result.executed(StageName::Recommendation));
        assert!(!result.executed(StageName::Extraction));
    }
}
