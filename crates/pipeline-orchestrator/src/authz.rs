//! Authorization hook.
//!
//! The orchestrator consults an [`AccessPolicy`] before touching any cache,
//! store or upstream. A denial becomes `PipelineError::Unauthorized`; a
//! policy that cannot reach its own backend reports an [`AuthorizationFault`],
//! which the orchestrator surfaces as an infrastructure error.

use async_trait::async_trait;
use pipeline_core::{PipelineInput, UserContext};
use std::collections::HashSet;
use thiserror::Error;

/// Policy verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Access granted
    Allow,
    /// Access refused, with a reason safe to return to the caller
    Deny(String),
}

impl AccessDecision {
    /// Whether access was granted
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Policy backend failure
#[derive(Debug, Clone, Error)]
#[error("authorization backend failure: {0}")]
pub struct AuthorizationFault(pub String);

/// Decides whether a user may run the pipeline over an input
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Check access for `user` to the patient and visit in `input`
    async fn check(
        &self,
        user: &UserContext,
        input: &PipelineInput,
    ) -> Result<AccessDecision, AuthorizationFault>;
}

/// Role allow-list
#[derive(Debug, Clone)]
pub struct RoleBasedPolicy {
    allowed_roles: HashSet<String>,
}

impl RoleBasedPolicy {
    /// Allow the given roles (case-insensitive)
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_roles: roles
                .into_iter()
                .map(|r| r.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl AccessPolicy for RoleBasedPolicy {
    async fn check(
        &self,
        user: &UserContext,
        input: &PipelineInput,
    ) -> Result<AccessDecision, AuthorizationFault> {
        if user.user_id.trim().is_empty() {
            return Ok(AccessDecision::Deny("missing user identity".to_string()));
        }
        if input.patient_id.trim().is_empty() {
            return Ok(AccessDecision::Deny("missing patient identifier".to_string()));
        }
        let role = user.role.trim().to_ascii_lowercase();
        if !self.allowed_roles.contains(&role) {
            return Ok(AccessDecision::Deny(format!(
                "role '{}' may not access clinical records",
                user.role
            )));
        }
        Ok(AccessDecision::Allow)
    }
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl AccessPolicy for AllowAllPolicy {
    async fn check(
        &self,
        _user: &UserContext,
        _input: &PipelineInput,
    ) -> Result<AccessDecision, AuthorizationFault> {
        Ok(AccessDecision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PipelineInput {
        PipelineInput::new("patient-1")
    }

    #[tokio::test]
    async fn test_role_allow_list() {
        let policy = RoleBasedPolicy::new(["Physician", "nurse"]);

        let decision = policy
            .check(&UserContext::new("dr-1", "physician"), &input())
            .await
            .unwrap();
        assert!(decision.is_allowed());

        let decision = policy
            .check(&UserContext::new("u-2", "billing"), &input())
            .await
            .unwrap();
        assert!(matches!(decision, AccessDecision::Deny(reason) if reason.contains("billing")));
    }

    #[tokio::test]
    async fn test_missing_identity_denied() {
        let policy = RoleBasedPolicy::new(["physician"]);
        let decision = policy
            .check(&UserContext::new(" ", "physician"), &input())
            .await
            .unwrap();
        assert!(!decision.is_allowed());

        let decision = policy
            .check(
                &UserContext::new("dr-1", "physician"),
                &PipelineInput::new(""),
            )
            .await
            .unwrap();
        assert!(!decision.is_allowed());
    }
}
