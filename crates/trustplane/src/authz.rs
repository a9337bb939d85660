//! Team-boundary and role-hierarchy authorization.
//!
//! Checks run at query time against the membership table — never cached.
//! A role can change between requests, and a cached permission would let a
//! demoted user keep acting until the cache expired. Role and membership
//! changes revoke the affected user's sessions inside the same transaction
//! as the change, so the new privileges only apply after re-authentication.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use crate::audit::{ActorType, AuditLog, EventType, NewEvent};
use crate::error::{CoreError, StoreError};
use crate::session::{RevocationReason, SessionStore};
use crate::store::{Store, TxOptions};

/// Team roles in ascending privilege order. Ordering follows the integer
/// weights, so `role >= Role::Admin` is the hierarchy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn weight(&self) -> u8 {
        match self {
            Role::Viewer => 1,
            Role::Member => 2,
            Role::Admin => 3,
            Role::Owner => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "viewer" => Some(Role::Viewer),
            "member" => Some(Role::Member),
            "admin" => Some(Role::Admin),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }
}

/// A membership row. Soft-removed members stay with `is_active = false` so
/// audit references remain resolvable; hard deletes are forbidden.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TeamMembership {
    pub id: String,
    pub team_id: String,
    pub user_id: String,
    pub role: Role,
    pub is_active: bool,
    pub invited_by: Option<String>,
    pub created_at: i64,
}

impl serde::Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Authorization context for one request: the caller's standing in the team
/// at the moment of the check.
#[derive(Debug, Clone)]
pub struct AuthzContext {
    pub user_id: String,
    pub team_id: String,
    pub role: Role,
    pub is_active: bool,
}

impl AuthzContext {
    pub fn has_role(&self, required: Role) -> bool {
        self.is_active && self.role.weight() >= required.weight()
    }

    pub fn is_owner(&self) -> bool {
        self.is_active && self.role == Role::Owner
    }

    pub fn can_manage_members(&self) -> bool {
        self.has_role(Role::Admin)
    }
}

/// Membership lookups and member management.
pub struct Authorizer {
    store: Arc<Store>,
    audit: Arc<AuditLog>,
}

impl Authorizer {
    pub fn new(store: Arc<Store>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Create a team with its initial owner.
    pub fn create_team(&self, name: &str, owner_user_id: &str) -> Result<String, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("team name must not be empty".to_string()));
        }
        let team_id = uuid::Uuid::new_v4().to_string();
        let membership_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        self.store.transaction(TxOptions::read_committed(), |tx| {
            tx.execute(
                "INSERT INTO teams (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![team_id, name, now],
            )
            .map_err(StoreError::from)?;
            tx.execute(
                "INSERT INTO team_memberships (id, team_id, user_id, role, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'owner', 1, ?4, ?4)",
                params![membership_id, team_id, owner_user_id, now],
            )
            .map_err(StoreError::from)?;

            self.audit.append_with(
                tx,
                &NewEvent::new(EventType::StateCreate, "Team created")
                    .actor(ActorType::User, Some(owner_user_id))
                    .resource("team", team_id.as_str()),
            )?;
            Ok(())
        })?;

        tracing::info!(team_id = %team_id, owner = owner_user_id, "team created");
        Ok(team_id)
    }

    /// Membership lookup for `user` in `team`, fresh from the store.
    pub fn context(&self, user_id: &str, team_id: &str) -> Result<Option<AuthzContext>, CoreError> {
        let ctx = self.store.with_conn(None, |conn| {
            context_stmt(conn, user_id, team_id)
        })?;
        if ctx.is_none() {
            tracing::warn!(user_id, team_id, "user not a member of team");
        }
        Ok(ctx)
    }

    /// Fail-closed access check: no membership or inactive membership is a
    /// team-boundary violation, insufficient weight is a role denial.
    pub fn require(
        &self,
        user_id: &str,
        team_id: &str,
        required_role: Option<Role>,
    ) -> Result<AuthzContext, CoreError> {
        let Some(ctx) = self.context(user_id, team_id)? else {
            return Err(CoreError::TeamBoundary {
                user_id: user_id.to_string(),
                team_id: team_id.to_string(),
            });
        };
        if !ctx.is_active {
            return Err(CoreError::TeamBoundary {
                user_id: user_id.to_string(),
                team_id: team_id.to_string(),
            });
        }
        if let Some(required) = required_role {
            if !ctx.has_role(required) {
                return Err(CoreError::RoleDenied { required });
            }
        }
        Ok(ctx)
    }

    /// All teams a user belongs to.
    pub fn list_teams(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<TeamMembership>, CoreError> {
        let memberships = self.store.with_conn(None, |conn| {
            let mut stmt = conn.prepare(
                "SELECT tm.id, tm.team_id, tm.user_id, tm.role, tm.is_active, tm.invited_by, tm.created_at
                 FROM team_memberships tm
                 JOIN teams t ON tm.team_id = t.id
                 WHERE tm.user_id = ?1 AND t.deleted_at IS NULL
                   AND (?2 = 0 OR tm.is_active = 1)
                 ORDER BY tm.created_at",
            )?;
            let rows = stmt
                .query_map(params![user_id, active_only as i64], membership_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(memberships)
    }

    /// Add (or reactivate) a member. Requires the inviter to hold ADMIN;
    /// only an OWNER may add another OWNER.
    pub fn add_member(
        &self,
        team_id: &str,
        user_id: &str,
        role: Role,
        invited_by: &str,
    ) -> Result<TeamMembership, CoreError> {
        let inviter = self.require(invited_by, team_id, Some(Role::Admin))?;
        if role == Role::Owner && !inviter.is_owner() {
            return Err(CoreError::RoleDenied {
                required: Role::Owner,
            });
        }

        let membership_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        let membership = self.store.transaction(TxOptions::read_committed(), |tx| {
            tx.execute(
                "INSERT INTO team_memberships (id, team_id, user_id, role, is_active, invited_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)
                 ON CONFLICT (team_id, user_id) DO UPDATE SET
                     role = excluded.role,
                     is_active = 1,
                     updated_at = excluded.updated_at",
                params![membership_id, team_id, user_id, role.as_str(), invited_by, now],
            )
            .map_err(StoreError::from)?;

            self.audit.append_with(
                tx,
                &NewEvent::new(EventType::StateCreate, "Team member added")
                    .actor(ActorType::User, Some(invited_by))
                    .resource("team_membership", format!("{team_id}:{user_id}"))
                    .details(serde_json::json!({"role": role.as_str()})),
            )?;

            membership_stmt(tx, team_id, user_id)
                .map_err(CoreError::from)?
                .ok_or(CoreError::NotFound("team membership"))
        })?;

        tracing::info!(team_id, user_id, role = role.as_str(), invited_by, "team member added");
        Ok(membership)
    }

    /// Change a member's role. Requires ADMIN; owner roles can only be
    /// granted or taken by an OWNER. The affected user's sessions are
    /// revoked in the same transaction — the change is not reported
    /// successful until the revocation is durable.
    pub fn change_role(
        &self,
        team_id: &str,
        user_id: &str,
        new_role: Role,
        changed_by: &str,
    ) -> Result<(), CoreError> {
        let changer = self.require(changed_by, team_id, Some(Role::Admin))?;
        let now = Utc::now().timestamp();

        self.store.transaction(TxOptions::serializable(), |tx| {
            let target = context_stmt(tx, user_id, team_id).map_err(CoreError::from)?;
            let Some(target) = target else {
                return Err(CoreError::TeamBoundary {
                    user_id: user_id.to_string(),
                    team_id: team_id.to_string(),
                });
            };
            if target.role == Role::Owner && !changer.is_owner() {
                return Err(CoreError::RoleDenied {
                    required: Role::Owner,
                });
            }
            if new_role == Role::Owner && !changer.is_owner() {
                return Err(CoreError::RoleDenied {
                    required: Role::Owner,
                });
            }

            tx.execute(
                "UPDATE team_memberships SET role = ?1, updated_at = ?2
                 WHERE team_id = ?3 AND user_id = ?4",
                params![new_role.as_str(), now, team_id, user_id],
            )
            .map_err(StoreError::from)?;

            let revoked =
                SessionStore::revoke_all_user_in(tx, user_id, RevocationReason::RoleChange)?;

            self.audit.append_with(
                tx,
                &NewEvent::new(EventType::AuthzRoleChange, "Member role changed")
                    .actor(ActorType::User, Some(changed_by))
                    .resource("team_membership", format!("{team_id}:{user_id}"))
                    .details(serde_json::json!({
                        "from": target.role.as_str(),
                        "to": new_role.as_str(),
                        "sessions_revoked": revoked,
                    })),
            )?;

            tracing::info!(
                team_id,
                user_id,
                new_role = new_role.as_str(),
                changed_by,
                sessions_revoked = revoked,
                "member role changed, sessions revoked"
            );
            Ok(())
        })
    }

    /// Soft-deactivate a member and revoke their sessions in the same
    /// transaction.
    pub fn remove_member(
        &self,
        team_id: &str,
        user_id: &str,
        removed_by: &str,
    ) -> Result<(), CoreError> {
        let remover = self.require(removed_by, team_id, Some(Role::Admin))?;
        let now = Utc::now().timestamp();

        self.store.transaction(TxOptions::serializable(), |tx| {
            let target = context_stmt(tx, user_id, team_id).map_err(CoreError::from)?;
            if let Some(ref target) = target {
                if target.role == Role::Owner && !remover.is_owner() {
                    return Err(CoreError::RoleDenied {
                        required: Role::Owner,
                    });
                }
            }

            let n = tx
                .execute(
                    "UPDATE team_memberships SET is_active = 0, updated_at = ?1
                     WHERE team_id = ?2 AND user_id = ?3",
                    params![now, team_id, user_id],
                )
                .map_err(StoreError::from)?;
            if n == 0 {
                return Err(CoreError::TeamBoundary {
                    user_id: user_id.to_string(),
                    team_id: team_id.to_string(),
                });
            }

            let revoked =
                SessionStore::revoke_all_user_in(tx, user_id, RevocationReason::TeamChange)?;

            self.audit.append_with(
                tx,
                &NewEvent::new(EventType::StateUpdate, "Team member removed")
                    .actor(ActorType::User, Some(removed_by))
                    .resource("team_membership", format!("{team_id}:{user_id}"))
                    .details(serde_json::json!({"sessions_revoked": revoked})),
            )?;

            tracing::info!(team_id, user_id, removed_by, "member removed from team");
            Ok(())
        })
    }
}

fn context_stmt(
    conn: &rusqlite::Connection,
    user_id: &str,
    team_id: &str,
) -> Result<Option<AuthzContext>, StoreError> {
    let row = conn
        .query_row(
            "SELECT tm.user_id, tm.team_id, tm.role, tm.is_active
             FROM team_memberships tm
             JOIN teams t ON tm.team_id = t.id
             WHERE tm.user_id = ?1 AND tm.team_id = ?2 AND t.deleted_at IS NULL",
            params![user_id, team_id],
            |row| {
                let role: String = row.get(2)?;
                Ok(AuthzContext {
                    user_id: row.get(0)?,
                    team_id: row.get(1)?,
                    role: Role::parse(&role).unwrap_or(Role::Viewer),
                    is_active: row.get::<_, i64>(3)? == 1,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn membership_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TeamMembership> {
    let role: String = row.get(3)?;
    Ok(TeamMembership {
        id: row.get(0)?,
        team_id: row.get(1)?,
        user_id: row.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::Viewer),
        is_active: row.get::<_, i64>(4)? == 1,
        invited_by: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn membership_stmt(
    conn: &rusqlite::Connection,
    team_id: &str,
    user_id: &str,
) -> Result<Option<TeamMembership>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, team_id, user_id, role, is_active, invited_by, created_at
             FROM team_memberships WHERE team_id = ?1 AND user_id = ?2",
            params![team_id, user_id],
            membership_from_row,
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        sessions: SessionStore,
        authz: Authorizer,
        audit: Arc<AuditLog>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let audit = Arc::new(AuditLog::new(Arc::clone(&store), b"secret".to_vec(), 90));
        Fixture {
            sessions: SessionStore::new(Arc::clone(&store), Arc::clone(&audit)),
            authz: Authorizer::new(store, Arc::clone(&audit)),
            audit,
        }
    }

    #[test]
    fn test_role_hierarchy() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Admin > Role::Member);
        assert!(Role::Member > Role::Viewer);
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("bogus"), None);
    }

    #[test]
    fn test_create_team_makes_owner() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        let ctx = f.authz.require("u-owner", &team, Some(Role::Owner)).unwrap();
        assert!(ctx.is_owner());
    }

    #[test]
    fn test_require_rejects_non_member() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        let result = f.authz.require("u-stranger", &team, None);
        assert!(matches!(result, Err(CoreError::TeamBoundary { .. })));
    }

    #[test]
    fn test_require_enforces_role_weight() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        f.authz
            .add_member(&team, "u-viewer", Role::Viewer, "u-owner")
            .unwrap();

        assert!(f.authz.require("u-viewer", &team, Some(Role::Viewer)).is_ok());
        let result = f.authz.require("u-viewer", &team, Some(Role::Admin));
        assert!(matches!(
            result,
            Err(CoreError::RoleDenied {
                required: Role::Admin
            })
        ));
    }

    #[test]
    fn test_add_member_requires_admin() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        f.authz
            .add_member(&team, "u-member", Role::Member, "u-owner")
            .unwrap();

        let result = f.authz.add_member(&team, "u-new", Role::Member, "u-member");
        assert!(matches!(result, Err(CoreError::RoleDenied { .. })));
    }

    #[test]
    fn test_only_owner_adds_owner() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        f.authz
            .add_member(&team, "u-admin", Role::Admin, "u-owner")
            .unwrap();

        let result = f.authz.add_member(&team, "u-new", Role::Owner, "u-admin");
        assert!(matches!(result, Err(CoreError::RoleDenied { .. })));
        assert!(f
            .authz
            .add_member(&team, "u-new", Role::Owner, "u-owner")
            .is_ok());
    }

    #[test]
    fn test_change_role_revokes_sessions() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        f.authz
            .add_member(&team, "u-admin", Role::Admin, "u-owner")
            .unwrap();
        f.sessions.create("u-admin", "tok-1", None, None, None).unwrap();
        f.sessions.create("u-admin", "tok-2", None, None, None).unwrap();

        f.authz
            .change_role(&team, "u-admin", Role::Member, "u-owner")
            .unwrap();

        for token in ["tok-1", "tok-2"] {
            let session = f.sessions.get_by_token(token).unwrap().unwrap();
            assert!(session.revoked_at.is_some());
            assert_eq!(session.revocation_reason.as_deref(), Some("role_change"));
        }

        let resource = format!("{team}:u-admin");
        let events = f
            .audit
            .find(EventType::AuthzRoleChange, Some(resource.as_str()), 10)
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_admin_cannot_demote_owner() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        f.authz
            .add_member(&team, "u-admin", Role::Admin, "u-owner")
            .unwrap();

        let result = f.authz.change_role(&team, "u-owner", Role::Member, "u-admin");
        assert!(matches!(result, Err(CoreError::RoleDenied { .. })));
    }

    #[test]
    fn test_remove_member_soft_deactivates_and_revokes() {
        let f = fixture();
        let team = f.authz.create_team("alpha", "u-owner").unwrap();
        f.authz
            .add_member(&team, "u-member", Role::Member, "u-owner")
            .unwrap();
        f.sessions.create("u-member", "tok", None, None, None).unwrap();

        f.authz.remove_member(&team, "u-member", "u-owner").unwrap();

        // Membership row survives as inactive; access is denied.
        let ctx = f.authz.context("u-member", &team).unwrap().unwrap();
        assert!(!ctx.is_active);
        let result = f.authz.require("u-member", &team, None);
        assert!(matches!(result, Err(CoreError::TeamBoundary { .. })));

        let session = f.sessions.get_by_token("tok").unwrap().unwrap();
        assert_eq!(session.revocation_reason.as_deref(), Some("team_change"));
    }

    #[test]
    fn test_list_teams_filters_inactive() {
        let f = fixture();
        let team_a = f.authz.create_team("alpha", "u-1").unwrap();
        let team_b = f.authz.create_team("beta", "u-other").unwrap();
        f.authz.add_member(&team_b, "u-1", Role::Member, "u-other").unwrap();
        f.authz.remove_member(&team_b, "u-1", "u-other").unwrap();

        let active = f.authz.list_teams("u-1", true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].team_id, team_a);

        let all = f.authz.list_teams("u-1", false).unwrap();
        assert_eq!(all.len(), 2);
    }
}
