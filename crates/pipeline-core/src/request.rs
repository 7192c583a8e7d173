//! Pipeline request types.
//!
//! A [`PipelineRequest`] is built once at the orchestrator entry point and is
//! immutable afterwards. The input payload carries PHI (the transcript text),
//! so the `Debug` output of [`PipelineInput`] reports the transcript length
//! instead of its content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{CorrelationId, RequestId};

/// Clinical input for one invocation
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInput {
    /// Free-text visit transcript, when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_text: Option<String>,
    /// Coded conditions (e.g. ICD-10)
    #[serde(default)]
    pub condition_codes: Vec<String>,
    /// Patient the visit belongs to
    pub patient_id: String,
    /// Visit identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_id: Option<String>,
}

impl PipelineInput {
    /// Create an input for a patient
    #[must_use]
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            ..Default::default()
        }
    }

    /// Set the transcript text
    #[must_use]
    pub fn with_transcript(mut self, text: impl Into<String>) -> Self {
        self.transcript_text = Some(text.into());
        self
    }

    /// Set the condition codes
    #[must_use]
    pub fn with_condition_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.condition_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the visit id
    #[must_use]
    pub fn with_visit(mut self, visit_id: impl Into<String>) -> Self {
        self.visit_id = Some(visit_id.into());
        self
    }

    /// Transcript text when present and non-blank
    #[must_use]
    pub fn transcript(&self) -> Option<&str> {
        self.transcript_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

impl fmt::Debug for PipelineInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineInput")
            .field(
                "transcript_len",
                &self.transcript_text.as_ref().map(String::len),
            )
            .field("condition_codes", &self.condition_codes)
            .field("patient_id", &self.patient_id)
            .field("visit_id", &self.visit_id)
            .finish()
    }
}

/// Acting user and their authorization context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    /// User identifier
    pub user_id: String,
    /// Role the user is acting under (e.g. "physician", "nurse")
    pub role: String,
    /// Institution the user is acting for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution_id: Option<String>,
}

impl UserContext {
    /// Create a user context
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            institution_id: None,
        }
    }

    /// Set the institution
    #[must_use]
    pub fn with_institution(mut self, institution_id: impl Into<String>) -> Self {
        self.institution_id = Some(institution_id.into());
        self
    }
}

/// One logical orchestration invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    /// Generated per call; replaced by the stored one on idempotent replay
    pub request_id: RequestId,
    /// Caller-supplied idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Cross-service correlation id
    pub correlation_id: CorrelationId,
    /// Clinical input
    pub input: PipelineInput,
    /// Acting user
    pub user: UserContext,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl PipelineRequest {
    /// Create a new request builder
    #[must_use]
    pub fn builder(input: PipelineInput, user: UserContext) -> PipelineRequestBuilder {
        PipelineRequestBuilder::new(input, user)
    }
}

/// Builder for [`PipelineRequest`]
#[derive(Debug)]
pub struct PipelineRequestBuilder {
    input: PipelineInput,
    user: UserContext,
    request_id: Option<RequestId>,
    idempotency_key: Option<String>,
    correlation_id: Option<CorrelationId>,
}

impl PipelineRequestBuilder {
    /// Create a builder
    #[must_use]
    pub fn new(input: PipelineInput, user: UserContext) -> Self {
        Self {
            input,
            user,
            request_id: None,
            idempotency_key: None,
            correlation_id: None,
        }
    }

    /// Use an explicit request id
    #[must_use]
    pub fn request_id(mut self, id: impl Into<RequestId>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Set the idempotency key; blank keys are ignored
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !key.trim().is_empty() {
            self.idempotency_key = Some(key);
        }
        self
    }

    /// Set the correlation id
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Build the request
    #[must_use]
    pub fn build(self) -> PipelineRequest {
        PipelineRequest {
            request_id: self.request_id.unwrap_or_else(RequestId::generate),
            idempotency_key: self.idempotency_key,
            correlation_id: self.correlation_id.unwrap_or_else(CorrelationId::generate),
            input: self.input,
            user: self.user,
            created_at: Utc::now(),
        }
    }
}
