//! Posting permission checks.
//!
//! Ban state is read from storage on every call — never cached on the
//! session — so an admin's mute takes effect on the subject's very next
//! message, even for clients that are already connected.

use std::sync::Arc;

use parley_shared::types::{GroupId, UserId};
use parley_store::User;

use crate::error::ServerError;
use crate::storage::Storage;

pub struct PermissionGate {
    storage: Arc<dyn Storage>,
    /// The AI participant has no personal ban state; only the group check
    /// applies to it.
    ai_user: UserId,
}

impl PermissionGate {
    pub fn new(storage: Arc<dyn Storage>, ai_user: UserId) -> Self {
        Self { storage, ai_user }
    }

    /// May `user` post into `group_id` right now?
    ///
    /// Policy, in order: admins always may; a muted group rejects
    /// everyone else; a muted user is rejected everywhere.
    pub fn can_post(&self, user: &User, group_id: GroupId) -> Result<(), ServerError> {
        if user.is_admin {
            return Ok(());
        }

        if self.storage.is_group_banned(group_id)? {
            return Err(ServerError::Permission("group is muted".to_string()));
        }

        if user.id != self.ai_user && self.storage.is_user_banned(user.id)? {
            return Err(ServerError::Permission("user is muted".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use parley_store::Database;

    struct Fixture {
        storage: Arc<dyn Storage>,
        gate: PermissionGate,
        user: User,
        admin: User,
        ai: User,
        group: GroupId,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()));
        let user = storage.create_user("alice", "h", false).unwrap();
        let admin = storage.create_user("root", "h", true).unwrap();
        let ai = storage.create_user("assistant", "!", false).unwrap();
        let group = storage.create_group("lobby").unwrap().id;
        let gate = PermissionGate::new(Arc::clone(&storage), ai.id);
        Fixture {
            storage,
            gate,
            user,
            admin,
            ai,
            group,
        }
    }

    #[test]
    fn unbanned_user_may_post() {
        let f = fixture();
        assert!(f.gate.can_post(&f.user, f.group).is_ok());
    }

    #[test]
    fn banned_user_is_rejected_everywhere() {
        let f = fixture();
        let other = f.storage.create_group("side-room").unwrap().id;
        f.storage.set_user_ban(f.user.id, true).unwrap();

        for group in [f.group, other] {
            let err = f.gate.can_post(&f.user, group).unwrap_err();
            assert!(err.to_string().contains("user is muted"));
        }
    }

    #[test]
    fn unban_takes_effect_immediately() {
        let f = fixture();
        f.storage.set_user_ban(f.user.id, true).unwrap();
        assert!(f.gate.can_post(&f.user, f.group).is_err());

        // No caching lag: the very next check after un-banning succeeds,
        // even though `f.user` is the same stale snapshot.
        f.storage.set_user_ban(f.user.id, false).unwrap();
        assert!(f.gate.can_post(&f.user, f.group).is_ok());
    }

    #[test]
    fn banned_group_rejects_non_admins() {
        let f = fixture();
        f.storage.set_group_ban(f.group, true).unwrap();

        let err = f.gate.can_post(&f.user, f.group).unwrap_err();
        assert!(err.to_string().contains("group is muted"));
        assert!(f.gate.can_post(&f.admin, f.group).is_ok());
    }

    #[test]
    fn admin_bypasses_user_ban() {
        let f = fixture();
        f.storage.set_user_ban(f.admin.id, true).unwrap();
        assert!(f.gate.can_post(&f.admin, f.group).is_ok());
    }

    #[test]
    fn ai_ignores_user_ban_but_not_group_ban() {
        let f = fixture();
        // A user-namespace ban on the AI id has no effect.
        f.storage.set_user_ban(f.ai.id, true).unwrap();
        assert!(f.gate.can_post(&f.ai, f.group).is_ok());

        // The group check still applies.
        f.storage.set_group_ban(f.group, true).unwrap();
        assert!(f.gate.can_post(&f.ai, f.group).is_err());
    }
}
