//! # Pipeline Core
//!
//! Core types shared by every crate of the clinical pipeline:
//! - Request and result types for one orchestration invocation
//! - Stage outputs (entity extraction, recommendations, embeddings)
//! - Identifier newtypes (request and correlation ids)
//! - The error taxonomy that leaves the orchestrator

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod ids;
pub mod request;
pub mod result;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use ids::{CorrelationId, RequestId};
pub use request::{PipelineInput, PipelineRequest, PipelineRequestBuilder, UserContext};
pub use result::{
    EmbeddingOutput, ExtractedEntities, ExtractionOutput, PipelineResult, Recommendation, RedFlag,
    StageName, StageOutcome, StageTiming,
};
