//! The entitlement seam: who may access a project.
//!
//! Project metadata, role management, and authorization live outside this
//! engine. The coordinator only ever asks one question -- "which users may
//! access project P" -- through this trait, injected at construction.

use async_trait::async_trait;
use dashmap::DashMap;
use prism_core::error::{PrismError, Result};
use prism_core::types::{ProjectName, Username};
use std::collections::HashSet;

/// Resolves the set of users entitled to a project.
///
/// Implementations must include the project owner in the result even if the
/// owner is not separately enrolled as a member.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntitlementResolver: Send + Sync {
    async fn users_with_access(&self, project: &ProjectName) -> Result<HashSet<Username>>;
}

/// In-memory entitlement table for tests and embedders without a metadata
/// store.
#[derive(Debug, Default)]
pub struct StaticEntitlements {
    grants: DashMap<ProjectName, HashSet<Username>>,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a user access to a project.
    pub fn grant(&self, project: ProjectName, user: Username) {
        self.grants.entry(project).or_default().insert(user);
    }

    /// Revoke a user's access to a project.
    pub fn revoke(&self, project: &ProjectName, user: &Username) {
        if let Some(mut users) = self.grants.get_mut(project) {
            users.remove(user);
        }
    }
}

#[async_trait]
impl EntitlementResolver for StaticEntitlements {
    async fn users_with_access(&self, project: &ProjectName) -> Result<HashSet<Username>> {
        self.grants
            .get(project)
            .map(|users| users.clone())
            .ok_or_else(|| PrismError::not_found("project", project.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_and_resolve() {
        let entitlements = StaticEntitlements::new();
        let project = ProjectName::new("proj1").unwrap();
        entitlements.grant(project.clone(), Username::new("alice").unwrap());
        entitlements.grant(project.clone(), Username::new("bob").unwrap());

        let users = entitlements.users_with_access(&project).await.unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.contains(&Username::new("alice").unwrap()));
    }

    #[tokio::test]
    async fn test_revoke() {
        let entitlements = StaticEntitlements::new();
        let project = ProjectName::new("proj1").unwrap();
        let bob = Username::new("bob").unwrap();
        entitlements.grant(project.clone(), bob.clone());
        entitlements.revoke(&project, &bob);

        let users = entitlements.users_with_access(&project).await.unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let entitlements = StaticEntitlements::new();
        let err = entitlements
            .users_with_access(&ProjectName::new("ghost").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
