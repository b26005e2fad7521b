//! Role-based access control.
//!
//! Permissions are `action:resource` strings. A role grants a set of them, and a check
//! succeeds on an exact grant or on one of the wildcards `action:*`, `*:resource` and
//! `*:*`. A user with no roles is treated as holding [`DEFAULT_ROLE`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::telemetry::TelemetryEvent;
use starport_runtime::Dispatcher;
use std::collections::BTreeSet;

/// Role assumed for users without any assignment
pub const DEFAULT_ROLE: &str = "user";

const WILDCARD: &str = "*";

/// A named set of permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name
    pub name: String,
    /// Granted permissions
    pub permissions: BTreeSet<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Entity for Role {
    fn id(&self) -> &str {
        &self.name
    }
}

/// Split `action:resource`, rejecting anything else
fn parse_permission(permission: &str) -> Result<(&str, &str), LifecycleError> {
    match permission.split_once(':') {
        Some((action, resource))
            if !action.is_empty() && !resource.is_empty() && !resource.contains(':') =>
        {
            Ok((action, resource))
        }
        _ => Err(LifecycleError::validation(format!(
            "permission must look like action:resource, got {permission:?}"
        ))),
    }
}

fn validate_all<'a>(permissions: impl IntoIterator<Item = &'a String>) -> Result<(), LifecycleError> {
    permissions
        .into_iter()
        .try_for_each(|p| parse_permission(p).map(|_| ()))
}

/// RBAC feature state
#[derive(Debug, Clone)]
pub struct RbacState {
    roles: Registry<Role>,
    assignments: Registry<BTreeSet<String>>,
}

impl RbacState {
    /// No roles at all
    #[must_use]
    pub fn empty() -> Self {
        Self {
            roles: Registry::new("Role"),
            assignments: Registry::new("User"),
        }
    }

    /// The built-in `admin`, `moderator` and `user` roles
    #[must_use]
    pub fn with_default_roles(now: DateTime<Utc>) -> Self {
        let mut state = Self::empty();
        let defaults: [(&str, &[&str]); 3] = [
            (
                "admin",
                &[
                    "read:*",
                    "write:*",
                    "delete:*",
                    "manage:users",
                    "manage:content",
                    "manage:settings",
                ],
            ),
            (
                "moderator",
                &["read:*", "write:content", "delete:content", "manage:comments"],
            ),
            (
                DEFAULT_ROLE,
                &["read:public", "write:own-content", "delete:own-content"],
            ),
        ];
        for (name, permissions) in defaults {
            state.roles.insert(Role {
                name: name.to_string(),
                permissions: permissions.iter().map(|p| (*p).to_string()).collect(),
                created_at: now,
            });
        }
        state
    }

    /// Roles held by `user_id`, defaulting to [`DEFAULT_ROLE`]
    #[must_use]
    pub fn user_roles(&self, user_id: &str) -> Vec<String> {
        match self.assignments.get(user_id) {
            Some(roles) if !roles.is_empty() => roles.iter().cloned().collect(),
            _ => vec![DEFAULT_ROLE.to_string()],
        }
    }

    /// Union of the permissions granted by the user's roles, sorted
    #[must_use]
    pub fn user_permissions(&self, user_id: &str) -> Vec<String> {
        self.user_roles(user_id)
            .iter()
            .filter_map(|name| self.roles.get(name))
            .flat_map(|role| role.permissions.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether any of the user's roles grants `permission`
    #[must_use]
    pub fn has_permission(&self, user_id: &str, permission: &str) -> bool {
        let Ok((action, resource)) = parse_permission(permission) else {
            return false;
        };
        let candidates = [
            permission.to_string(),
            format!("{action}:{WILDCARD}"),
            format!("{WILDCARD}:{resource}"),
            format!("{WILDCARD}:{WILDCARD}"),
        ];
        self.user_roles(user_id)
            .iter()
            .filter_map(|name| self.roles.get(name))
            .any(|role| candidates.iter().any(|c| role.permissions.contains(c)))
    }
}

impl Feature for RbacState {
    const NAME: &'static str = "rbac";
}

/// Create or replace a role
#[derive(Debug, Clone)]
pub struct CreateRole {
    /// Role name
    pub name: String,
    /// Granted permissions
    pub permissions: Vec<String>,
}

impl Operation<RbacState> for CreateRole {
    type Output = Role;
    const NAME: &'static str = "create_role";

    fn apply(self, state: &mut RbacState, env: &Environment) -> Result<Applied<Role>, LifecycleError> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::validation("role name must not be empty"));
        }
        validate_all(&self.permissions)?;
        let role = state
            .roles
            .insert(Role {
                name: self.name,
                permissions: self.permissions.into_iter().collect(),
                created_at: env.now(),
            })
            .clone();
        let event = TelemetryEvent::new("role_created")
            .with("role", role.name.as_str())
            .with("permissions", role.permissions.len());
        Ok(Applied::new(role).with_event(event))
    }
}

/// Give a user a role
#[derive(Debug, Clone)]
pub struct AssignRole {
    /// User ID
    pub user_id: String,
    /// Role name
    pub role: String,
}

impl Operation<RbacState> for AssignRole {
    type Output = Vec<String>;
    const NAME: &'static str = "assign_role";

    fn apply(self, state: &mut RbacState, _env: &Environment) -> Result<Applied<Vec<String>>, LifecycleError> {
        state.roles.require(&self.role)?;
        if !state.assignments.contains(&self.user_id) {
            state.assignments.put(self.user_id.clone(), BTreeSet::new());
        }
        let added = state
            .assignments
            .update(&self.user_id, |roles| roles.insert(self.role.clone()))?;
        let roles = state.user_roles(&self.user_id);
        Ok(Applied::new(roles).with_event_if(added, || {
            TelemetryEvent::new("role_assigned")
                .with("user_id", self.user_id.as_str())
                .with("role", self.role.as_str())
        }))
    }
}

/// Take a role away from a user; returns whether the user held it
#[derive(Debug, Clone)]
pub struct RemoveRole {
    /// User ID
    pub user_id: String,
    /// Role name
    pub role: String,
}

impl Operation<RbacState> for RemoveRole {
    type Output = bool;
    const NAME: &'static str = "remove_role";

    fn apply(self, state: &mut RbacState, _env: &Environment) -> Result<Applied<bool>, LifecycleError> {
        let removed = state
            .assignments
            .update(&self.user_id, |roles| roles.remove(&self.role))
            .unwrap_or(false);
        Ok(Applied::new(removed).with_event_if(removed, || {
            TelemetryEvent::new("role_removed")
                .with("user_id", self.user_id.as_str())
                .with("role", self.role.as_str())
        }))
    }
}

/// Grant one more permission to a role
#[derive(Debug, Clone)]
pub struct AddPermission {
    /// Role name
    pub role: String,
    /// Permission to grant
    pub permission: String,
}

impl Operation<RbacState> for AddPermission {
    type Output = Role;
    const NAME: &'static str = "add_permission";

    fn apply(self, state: &mut RbacState, _env: &Environment) -> Result<Applied<Role>, LifecycleError> {
        parse_permission(&self.permission)?;
        let role = state.roles.require_mut(&self.role)?;
        let added = role.permissions.insert(self.permission.clone());
        let role = role.clone();
        Ok(Applied::new(role).with_event_if(added, || {
            TelemetryEvent::new("permission_added")
                .with("role", self.role.as_str())
                .with("permission", self.permission.as_str())
        }))
    }
}

/// Revoke a permission from a role; returns whether the role had it
#[derive(Debug, Clone)]
pub struct RemovePermission {
    /// Role name
    pub role: String,
    /// Permission to revoke
    pub permission: String,
}

impl Operation<RbacState> for RemovePermission {
    type Output = bool;
    const NAME: &'static str = "remove_permission";

    fn apply(self, state: &mut RbacState, _env: &Environment) -> Result<Applied<bool>, LifecycleError> {
        let removed = state
            .roles
            .update(&self.role, |role| role.permissions.remove(&self.permission))?;
        Ok(Applied::new(removed).with_event_if(removed, || {
            TelemetryEvent::new("permission_removed")
                .with("role", self.role.as_str())
                .with("permission", self.permission.as_str())
        }))
    }
}

/// RBAC service
#[derive(Debug, Clone)]
pub struct RbacService {
    dispatcher: Dispatcher<RbacState>,
}

impl RbacService {
    /// Service seeded with the default roles
    #[must_use]
    pub fn new(env: Environment) -> Self {
        let state = RbacState::with_default_roles(env.now());
        Self {
            dispatcher: Dispatcher::new(state, env),
        }
    }

    /// Create or replace a role.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty name or a malformed permission.
    pub async fn create_role(
        &self,
        name: impl Into<String>,
        permissions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Role, LifecycleError> {
        self.dispatcher
            .send(CreateRole {
                name: name.into(),
                permissions: permissions.into_iter().map(Into::into).collect(),
            })
            .await
    }

    /// Give a user a role; returns the user's roles afterwards.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown role.
    pub async fn assign_role(
        &self,
        user_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<Vec<String>, LifecycleError> {
        self.dispatcher
            .send(AssignRole {
                user_id: user_id.into(),
                role: role.into(),
            })
            .await
    }

    /// Take a role away; returns whether the user held it.
    ///
    /// # Errors
    ///
    /// Does not fail today; the signature matches the other lifecycle operations.
    pub async fn remove_role(&self, user_id: impl Into<String>, role: impl Into<String>) -> Result<bool, LifecycleError> {
        self.dispatcher
            .send(RemoveRole {
                user_id: user_id.into(),
                role: role.into(),
            })
            .await
    }

    /// Grant a permission to a role.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown role and a validation error for a malformed
    /// permission.
    pub async fn add_permission(
        &self,
        role: impl Into<String>,
        permission: impl Into<String>,
    ) -> Result<Role, LifecycleError> {
        self.dispatcher
            .send(AddPermission {
                role: role.into(),
                permission: permission.into(),
            })
            .await
    }

    /// Revoke a permission from a role.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown role.
    pub async fn remove_permission(
        &self,
        role: impl Into<String>,
        permission: impl Into<String>,
    ) -> Result<bool, LifecycleError> {
        self.dispatcher
            .send(RemovePermission {
                role: role.into(),
                permission: permission.into(),
            })
            .await
    }

    /// Whether the user may perform `permission`
    pub async fn has_permission(&self, user_id: &str, permission: &str) -> bool {
        let allowed = self.dispatcher.state(|s| s.has_permission(user_id, permission)).await;
        tracing::trace!(user_id, permission, allowed, "Permission check");
        allowed
    }

    /// Roles held by the user
    pub async fn user_roles(&self, user_id: &str) -> Vec<String> {
        self.dispatcher.state(|s| s.user_roles(user_id)).await
    }

    /// Permissions granted to the user
    pub async fn user_permissions(&self, user_id: &str) -> Vec<String> {
        self.dispatcher.state(|s| s.user_permissions(user_id)).await
    }

    /// Look up a role
    pub async fn get_role(&self, name: &str) -> Option<Role> {
        self.dispatcher.state(|s| s.roles.get_cloned(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starport_testing::{assertions, test_clock, test_environment, LifecycleTest};
    use starport_core::environment::Clock;

    #[tokio::test]
    async fn test_users_without_roles_get_the_default_role() {
        let rbac = RbacService::new(test_environment());
        assert_eq!(rbac.user_roles("anon").await, vec![DEFAULT_ROLE]);
        assert!(rbac.has_permission("anon", "read:public").await);
        assert!(!rbac.has_permission("anon", "read:secrets").await);
    }

    #[tokio::test]
    async fn test_wildcards() {
        let rbac = RbacService::new(test_environment());
        rbac.assign_role("mod", "moderator").await.unwrap();
        rbac.create_role("auditor", ["*:audit-log"]).await.unwrap();
        rbac.create_role("root", ["*:*"]).await.unwrap();
        rbac.assign_role("aud", "auditor").await.unwrap();
        rbac.assign_role("su", "root").await.unwrap();

        assert!(rbac.has_permission("mod", "read:anything").await);
        assert!(!rbac.has_permission("mod", "write:settings").await);
        assert!(rbac.has_permission("aud", "delete:audit-log").await);
        assert!(!rbac.has_permission("aud", "delete:content").await);
        assert!(rbac.has_permission("su", "manage:settings").await);
        assert!(!rbac.has_permission("su", "not-a-permission").await);
    }

    #[tokio::test]
    async fn test_assign_unknown_role_fails() {
        let rbac = RbacService::new(test_environment());
        let err = rbac.assign_role("u1", "pilot").await.unwrap_err();
        assertions::assert_not_found(&err, "Role", "pilot");
        assert_eq!(rbac.user_roles("u1").await, vec![DEFAULT_ROLE]);
    }

    #[tokio::test]
    async fn test_remove_role_reports_whether_held() {
        let rbac = RbacService::new(test_environment());
        rbac.assign_role("u1", "admin").await.unwrap();
        assert!(rbac.has_permission("u1", "manage:users").await);

        assert!(rbac.remove_role("u1", "admin").await.unwrap());
        assert!(!rbac.remove_role("u1", "admin").await.unwrap());
        assert!(!rbac.remove_role("nobody", "admin").await.unwrap());
        assert!(!rbac.has_permission("u1", "manage:users").await);
        assert_eq!(rbac.user_roles("u1").await, vec![DEFAULT_ROLE]);
    }

    #[tokio::test]
    async fn test_user_permissions_union_is_sorted() {
        let rbac = RbacService::new(test_environment());
        rbac.assign_role("u1", "moderator").await.unwrap();
        rbac.assign_role("u1", "user").await.unwrap();

        let permissions = rbac.user_permissions("u1").await;
        let mut sorted = permissions.clone();
        sorted.sort();
        assert_eq!(permissions, sorted);
        assert!(permissions.contains(&"manage:comments".to_string()));
        assert!(permissions.contains(&"read:public".to_string()));
        assert_eq!(permissions.iter().filter(|p| *p == "read:*").count(), 1);
    }

    #[tokio::test]
    async fn test_permission_edits() {
        let rbac = RbacService::new(test_environment());
        let role = rbac.add_permission("user", "write:comments").await.unwrap();
        assert!(role.permissions.contains("write:comments"));
        assert!(rbac.has_permission("anyone", "write:comments").await);

        assert!(rbac.remove_permission("user", "write:comments").await.unwrap());
        assert!(!rbac.has_permission("anyone", "write:comments").await);

        let err = rbac.add_permission("ghost", "read:x").await.unwrap_err();
        assertions::assert_not_found(&err, "Role", "ghost");
    }

    #[test]
    fn test_malformed_permission_is_rejected_without_mutation() {
        LifecycleTest::new(test_environment())
            .given_state(RbacState::with_default_roles(test_clock().now()))
            .when(AddPermission {
                role: "user".to_string(),
                permission: "launch".to_string(),
            })
            .then_error(|error| assert!(matches!(error, LifecycleError::Validation(_))))
            .then_state(|state| assert_eq!(state.roles.get("user").unwrap().permissions.len(), 3))
            .run();
    }

    #[test]
    fn test_parse_permission() {
        assert_eq!(parse_permission("read:public").unwrap(), ("read", "public"));
        assert!(parse_permission(":public").is_err());
        assert!(parse_permission("read:").is_err());
        assert!(parse_permission("a:b:c").is_err());
    }
}
