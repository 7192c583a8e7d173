//! # Pipeline Orchestrator
//!
//! Turns one logical request ("produce a clinical artifact from a visit")
//! into calls against the extraction, recommendation and embedding
//! upstreams, and merges their answers into a single [`PipelineResult`].
//!
//! - [`authz`]: access policy consulted before any other work
//! - [`stages`]: per-stage request types and resilient stage clients
//! - [`cache`]: content-addressed extraction cache
//! - [`idempotency`]: at-most-one execution per idempotency key
//! - [`orchestrator`]: the invocation state machine
//! - [`worker`]: queued execution with at-least-once delivery
//!
//! [`PipelineResult`]: pipeline_core::PipelineResult

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authz;
pub mod cache;
pub mod idempotency;
pub mod orchestrator;
pub mod stages;
pub mod worker;

pub use authz::{AccessDecision, AccessPolicy, AllowAllPolicy, AuthorizationFault, RoleBasedPolicy};
pub use cache::{content_hash, ExtractionCache};
pub use idempotency::{ClaimOutcome, IdempotencyConfig, IdempotencyStore};
pub use orchestrator::{PipelineOrchestrator, PipelineOrchestratorBuilder};
pub use stages::{
    EmbeddingRequest, ExtractionRequest, RecommendationRequest, RecommendationResponse,
    StageClient, StageClients,
};
pub use worker::{
    InMemoryJobQueue, JobId, JobOutcome, JobProcessor, JobQueue, JobStatus, PipelineJobProcessor,
    QueueError, DEFAULT_STATUS_RETENTION,
};
