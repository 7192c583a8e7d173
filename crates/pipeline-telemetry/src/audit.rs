//! PHI access auditing.
//!
//! Every access to free-text transcripts or derived clinical entities is
//! recorded as an [`AuditEvent`] through an [`AuditSink`]. The sink returns
//! a `Result` so that callers for whom auditing is mandatory can refuse to
//! proceed when an entry cannot be written.
//!
//! [`AuditLogger`] is the built-in sink: it emits each event on the `audit`
//! tracing target and keeps the most recent events in a bounded buffer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Free-text transcript read and sent to an upstream
    TranscriptAccess,
    /// Derived clinical entities disclosed to the caller
    EntityDisclosure,
    /// Access refused by the authorization policy
    AccessDenied,
    /// Stored result returned for an idempotency key
    ResultReplay,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TranscriptAccess => write!(f, "transcript_access"),
            Self::EntityDisclosure => write!(f, "entity_disclosure"),
            Self::AccessDenied => write!(f, "access_denied"),
            Self::ResultReplay => write!(f, "result_replay"),
        }
    }
}

/// Audit event outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Access succeeded
    Success,
    /// Access attempted but failed
    Failure,
    /// Access denied
    Denied,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Denied => write!(f, "denied"),
        }
    }
}

/// Acting user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    /// User identifier
    pub user_id: String,
    /// Role the user acted under
    pub role: String,
    /// Institution, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution_id: Option<String>,
}

impl AuditActor {
    /// Create an actor
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            institution_id: None,
        }
    }
}

impl From<&pipeline_core::UserContext> for AuditActor {
    fn from(user: &pipeline_core::UserContext) -> Self {
        Self {
            user_id: user.user_id.clone(),
            role: user.role.clone(),
            institution_id: user.institution_id.clone(),
        }
    }
}

/// Resource touched by the access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResource {
    /// Resource type (visit, patient, pipeline_result)
    pub resource_type: String,
    /// Resource identifier
    pub id: String,
}

impl AuditResource {
    /// Create a new resource
    #[must_use]
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

/// Complete audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier
    pub id: String,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event_type: AuditEventType,
    /// Acting user
    pub actor: AuditActor,
    /// Resource touched
    pub resource: AuditResource,
    /// Action performed (read, disclose, replay)
    pub action: String,
    /// Fields touched
    pub fields: Vec<String>,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Correlation id of the logical request
    pub correlation_id: String,
    /// Request id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Additional metadata; never PHI
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Builder for audit events
#[derive(Debug)]
pub struct AuditEventBuilder {
    event_type: AuditEventType,
    actor: AuditActor,
    resource: AuditResource,
    action: Option<String>,
    fields: Vec<String>,
    outcome: AuditOutcome,
    correlation_id: String,
    request_id: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
}

impl AuditEventBuilder {
    /// Start an event for `actor` touching `resource`
    #[must_use]
    pub fn new(
        event_type: AuditEventType,
        actor: AuditActor,
        resource: AuditResource,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            actor,
            resource,
            action: None,
            fields: Vec::new(),
            outcome: AuditOutcome::Success,
            correlation_id: correlation_id.into(),
            request_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the action
    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Add a touched field
    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Set outcome
    #[must_use]
    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Set request ID
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Add metadata
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), json_value);
        }
        self
    }

    /// Build the audit event
    #[must_use]
    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: self.event_type,
            actor: self.actor,
            resource: self.resource,
            action: self.action.unwrap_or_else(|| "read".to_string()),
            fields: self.fields,
            outcome: self.outcome,
            correlation_id: self.correlation_id,
            request_id: self.request_id,
            metadata: self.metadata,
        }
    }
}

/// Audit write failure
#[derive(Debug, Clone, Error)]
pub enum AuditError {
    /// Sink could not be reached
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
    /// Sink refused the entry
    #[error("Audit entry rejected: {0}")]
    Rejected(String),
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one access
    async fn log_access(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Audit log configuration
#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    /// Whether audit logging is enabled
    pub enabled: bool,
    /// Emit events on the `audit` tracing target
    pub log_to_stdout: bool,
    /// Maximum events kept in memory
    pub buffer_size: usize,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_to_stdout: true,
            buffer_size: 1000,
        }
    }
}

/// Audit logger backed by `tracing` and a bounded buffer
#[derive(Debug, Clone)]
pub struct AuditLogger {
    config: AuditLogConfig,
    buffer: Arc<RwLock<VecDeque<AuditEvent>>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AuditLogger {
    /// Create a new audit logger
    #[must_use]
    pub fn new(config: AuditLogConfig) -> Self {
        Self {
            config,
            buffer: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(AuditLogConfig::default())
    }

    /// Check if audit logging is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Most recent events, newest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let buffer = self.buffer.read().await;
        buffer.iter().rev().take(limit).cloned().collect()
    }

    /// Events of one type, newest first
    pub async fn events_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        let buffer = self.buffer.read().await;
        buffer
            .iter()
            .rev()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Clear the event buffer
    pub async fn clear(&self) {
        self.buffer.write().await.clear();
    }

    fn log_to_stdout(event: &AuditEvent) {
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{event:?}"));
        match event.outcome {
            AuditOutcome::Denied | AuditOutcome::Failure => warn!(
                target: "audit",
                event_type = %event.event_type,
                outcome = %event.outcome,
                correlation_id = %event.correlation_id,
                "{}",
                json
            ),
            AuditOutcome::Success => info!(
                target: "audit",
                event_type = %event.event_type,
                outcome = %event.outcome,
                correlation_id = %event.correlation_id,
                "{}",
                json
            ),
        }
    }
}

#[async_trait]
impl AuditSink for AuditLogger {
    async fn log_access(&self, event: AuditEvent) -> Result<(), AuditError> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.config.log_to_stdout {
            Self::log_to_stdout(&event);
        }

        let mut buffer = self.buffer.write().await;
        while buffer.len() >= self.config.buffer_size.max(1) {
            buffer.pop_front();
        }
        buffer.push_back(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: AuditEventType) -> AuditEvent {
        AuditEventBuilder::new(
            event_type,
            AuditActor::new("dr-1", "physician"),
            AuditResource::new("visit", "visit-9"),
            "corr-1",
        )
        .action("read")
        .field("transcriptText")
        .request_id("req-1")
        .build()
    }

    #[test]
    fn test_audit_event_builder() {
        let event = event(AuditEventType::TranscriptAccess);
        assert_eq!(event.actor.user_id, "dr-1");
        assert_eq!(event.actor.role, "physician");
        assert_eq!(event.resource.resource_type, "visit");
        assert_eq!(event.fields, vec!["transcriptText".to_string()]);
        assert_eq!(event.outcome, AuditOutcome::Success);
        assert_eq!(event.correlation_id, "corr-1");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "transcript_access");
    }

    #[tokio::test]
    async fn test_audit_logger_disabled() {
        let logger = AuditLogger::new(AuditLogConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!logger.is_enabled());
        logger
            .log_access(event(AuditEventType::TranscriptAccess))
            .await
            .unwrap();
        assert!(logger.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_audit_logger_buffer_is_bounded() {
        let logger = AuditLogger::new(AuditLogConfig {
            log_to_stdout: false,
            buffer_size: 5,
            ..Default::default()
        });

        for _ in 0..10 {
            logger
                .log_access(event(AuditEventType::EntityDisclosure))
                .await
                .unwrap();
        }
        assert_eq!(logger.recent(10).await.len(), 5);
    }

    #[tokio::test]
    async fn test_audit_logger_filter_by_type() {
        let logger = AuditLogger::new(AuditLogConfig {
            log_to_stdout: false,
            ..Default::default()
        });
        for event_type in [
            AuditEventType::TranscriptAccess,
            AuditEventType::EntityDisclosure,
            AuditEventType::TranscriptAccess,
            AuditEventType::AccessDenied,
        ] {
            logger.log_access(event(event_type)).await.unwrap();
        }

        assert_eq!(
            logger
                .events_by_type(AuditEventType::TranscriptAccess)
                .await
                .len(),
            2
        );
        assert_eq!(logger.recent(1).await[0].event_type, AuditEventType::AccessDenied);

        logger.clear().await;
        assert!(logger.recent(10).await.is_empty());
    }
}
