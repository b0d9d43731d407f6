use std::sync::Arc;

use crate::config_db::ConfigDb;
use crate::error::ApiError;

/// Effective permission, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    None,
    View,
    Edit,
    Admin,
}

impl Permission {
    fn parse(s: &str) -> Self {
        match s {
            "view" => Self::View,
            "edit" => Self::Edit,
            "admin" => Self::Admin,
            _ => Self::None,
        }
    }
}

/// Org-level role from the membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Self::Viewer),
            "editor" => Some(Self::Editor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Fallback permission when a resource carries no ACL rows.
    fn implied_permission(self) -> Permission {
        match self {
            Self::Admin => Permission::Admin,
            Self::Editor => Permission::Edit,
            Self::Viewer => Permission::View,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Datasource,
    Dashboard,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datasource => "datasource",
            Self::Dashboard => "dashboard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Administer,
}

impl Action {
    fn min_required(self) -> Permission {
        match self {
            Self::Read => Permission::View,
            Self::Write => Permission::Edit,
            Self::Administer => Permission::Admin,
        }
    }
}

/// Resolves effective permissions from membership roles and resource ACLs.
/// Every precondition that cannot be positively verified resolves to
/// `Permission::None`.
#[derive(Clone)]
pub struct Authz {
    db: Arc<ConfigDb>,
}

impl Authz {
    pub fn new(db: Arc<ConfigDb>) -> Self {
        Self { db }
    }

    /// Effective permission of `user` on `(org, resource_type, resource_id)`.
    ///
    /// Order: membership role, resource-in-org check, org-admin bypass, then
    /// ACL rows (max over direct user grants and same-org group grants) with
    /// the role map as fallback when no rows exist.
    pub fn resolve_permission(
        &self,
        user_id: &str,
        org_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Permission, ApiError> {
        let Some(role_raw) = self
            .db
            .membership_role(user_id, org_id)
            .map_err(ApiError::from_db)?
        else {
            return Ok(Permission::None);
        };
        let Some(role) = Role::parse(&role_raw) else {
            return Ok(Permission::None);
        };

        let owner_org = self
            .db
            .resource_org(resource_type.as_str(), resource_id)
            .map_err(ApiError::from_db)?;
        if owner_org.as_deref() != Some(org_id) {
            return Ok(Permission::None);
        }

        if role == Role::Admin {
            return Ok(Permission::Admin);
        }

        let rows = self
            .db
            .acl_rows(org_id, resource_type.as_str(), resource_id)
            .map_err(ApiError::from_db)?;
        if rows.is_empty() {
            return Ok(role.implied_permission());
        }

        let group_ids = self
            .db
            .group_ids_for_user(user_id, org_id)
            .map_err(ApiError::from_db)?;

        let mut effective = Permission::None;
        for row in rows {
            let applies = match row.principal_type.as_str() {
                "user" => row.principal_id == user_id,
                "group" => group_ids.iter().any(|g| g == &row.principal_id),
                _ => false,
            };
            if applies {
                effective = effective.max(Permission::parse(&row.permission));
            }
        }
        Ok(effective)
    }

    pub fn can(
        &self,
        user_id: &str,
        org_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        action: Action,
    ) -> Result<bool, ApiError> {
        let permission = self.resolve_permission(user_id, org_id, resource_type, resource_id)?;
        Ok(permission >= action.min_required())
    }

    /// Whether the user is an admin of the org at all (used for create/list,
    /// where no resource exists yet).
    pub fn is_org_admin(&self, user_id: &str, org_id: &str) -> Result<bool, ApiError> {
        let role = self.db.membership_role(user_id, org_id).map_err(ApiError::from_db)?;
        Ok(role.as_deref() == Some("admin"))
    }

    /// Whether the user belongs to the org in any role.
    pub fn is_org_member(&self, user_id: &str, org_id: &str) -> Result<bool, ApiError> {
        let role = self.db.membership_role(user_id, org_id).map_err(ApiError::from_db)?;
        Ok(role.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        authz: Authz,
        db: Arc<ConfigDb>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(ConfigDb::open_in_memory().unwrap());
        db.create_organization("org1", "acme").unwrap();
        db.create_organization("org2", "other").unwrap();
        for (id, email) in [("admin", "a@x"), ("editor", "e@x"), ("viewer", "v@x"), ("outsider", "o@x")] {
            db.create_user(id, email).unwrap();
        }
        db.upsert_membership("admin", "org1", "admin").unwrap();
        db.upsert_membership("editor", "org1", "editor").unwrap();
        db.upsert_membership("viewer", "org1", "viewer").unwrap();
        db.upsert_membership("outsider", "org2", "admin").unwrap();
        db.create_dashboard("dash1", "org1", "overview").unwrap();
        db.create_dashboard("dash2", "org2", "other-org").unwrap();
        Fixture { authz: Authz::new(db.clone()), db }
    }

    #[test]
    fn role_fallback_without_acl_rows() {
        let f = fixture();
        let p = |user| {
            f.authz
                .resolve_permission(user, "org1", ResourceType::Dashboard, "dash1")
                .unwrap()
        };
        assert_eq!(p("admin"), Permission::Admin);
        assert_eq!(p("editor"), Permission::Edit);
        assert_eq!(p("viewer"), Permission::View);
    }

    #[test]
    fn no_membership_means_none() {
        let f = fixture();
        let p = f
            .authz
            .resolve_permission("outsider", "org1", ResourceType::Dashboard, "dash1")
            .unwrap();
        assert_eq!(p, Permission::None);
    }

    #[test]
    fn fail_closed_when_resource_is_in_another_org() {
        let f = fixture();
        // dash2 belongs to org2; even org1's admin resolves to none, and ACL
        // rows cannot resurrect access.
        f.db.add_acl_entry("a1", "org1", "dashboard", "dash2", "user", "viewer", "admin")
            .unwrap();
        for user in ["admin", "editor", "viewer"] {
            let p = f
                .authz
                .resolve_permission(user, "org1", ResourceType::Dashboard, "dash2")
                .unwrap();
            assert_eq!(p, Permission::None, "user {user} must be denied");
        }
    }

    #[test]
    fn acl_rows_replace_role_fallback() {
        let f = fixture();
        // Dashboard restricted to one specific user; the viewer role no
        // longer grants anything.
        f.db.add_acl_entry("a1", "org1", "dashboard", "dash1", "user", "editor", "edit")
            .unwrap();
        let viewer = f
            .authz
            .resolve_permission("viewer", "org1", ResourceType::Dashboard, "dash1")
            .unwrap();
        assert_eq!(viewer, Permission::None);
        let editor = f
            .authz
            .resolve_permission("editor", "org1", ResourceType::Dashboard, "dash1")
            .unwrap();
        assert_eq!(editor, Permission::Edit);
        assert!(!f.authz.can("viewer", "org1", ResourceType::Dashboard, "dash1", Action::Read).unwrap());
    }

    #[test]
    fn org_admin_bypasses_acls() {
        let f = fixture();
        f.db.add_acl_entry("a1", "org1", "dashboard", "dash1", "user", "editor", "view")
            .unwrap();
        let p = f
            .authz
            .resolve_permission("admin", "org1", ResourceType::Dashboard, "dash1")
            .unwrap();
        assert_eq!(p, Permission::Admin);
    }

    #[test]
    fn group_grants_take_the_maximum() {
        let f = fixture();
        f.db.create_group("g1", "org1", "eng").unwrap();
        f.db.add_group_member("g1", "viewer").unwrap();
        f.db.add_acl_entry("a1", "org1", "dashboard", "dash1", "group", "g1", "edit")
            .unwrap();
        f.db.add_acl_entry("a2", "org1", "dashboard", "dash1", "user", "viewer", "view")
            .unwrap();
        let p = f
            .authz
            .resolve_permission("viewer", "org1", ResourceType::Dashboard, "dash1")
            .unwrap();
        assert_eq!(p, Permission::Edit);
    }

    #[test]
    fn permission_order() {
        assert!(Permission::Admin > Permission::Edit);
        assert!(Permission::Edit > Permission::View);
        assert!(Permission::View > Permission::None);
    }
}
