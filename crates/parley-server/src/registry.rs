//! In-memory view of which live sessions belong to which groups.
//!
//! The persisted membership relation is the source of truth; this
//! registry is a derived, rebuildable cache used for fast fan-out.
//! Callers validate group existence and membership against storage
//! before joining. A session appears here iff the persisted pair exists
//! and the connection is still open: [`GroupRegistry::remove_session`]
//! runs on every disconnect.
//!
//! Lock discipline: all three maps sit behind one `RwLock`, and no lock
//! is ever held across an await point or a network write. `members`
//! returns a snapshot so a member disconnecting mid-broadcast cannot
//! invalidate iteration.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use thiserror::Error;

use parley_shared::types::{GroupId, UserId};

use crate::session::{SessionHandle, SessionId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session is already a member of group {0}")]
    AlreadyMember(GroupId),
}

#[derive(Default)]
struct Inner {
    /// group -> live member sessions
    groups: HashMap<GroupId, HashMap<SessionId, SessionHandle>>,
    /// session -> groups it is in (for O(groups) removal on disconnect)
    sessions: HashMap<SessionId, HashSet<GroupId>>,
    /// user -> that user's live sessions (a user may be connected twice)
    users: HashMap<UserId, HashMap<SessionId, SessionHandle>>,
}

#[derive(Default)]
pub struct GroupRegistry {
    inner: RwLock<Inner>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authenticated session in the user directory.
    pub fn register_user_session(&self, user_id: UserId, handle: SessionHandle) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner
            .users
            .entry(user_id)
            .or_default()
            .insert(handle.id(), handle);
    }

    /// Add a live session to a group's member set.
    pub fn join(&self, group_id: GroupId, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        let inner = &mut *guard;
        let members = inner.groups.entry(group_id).or_default();
        if members.contains_key(&handle.id()) {
            return Err(RegistryError::AlreadyMember(group_id));
        }
        let session_id = handle.id();
        members.insert(session_id, handle);
        inner.sessions.entry(session_id).or_default().insert(group_id);
        Ok(())
    }

    /// Remove a session from one group.
    pub fn leave(&self, group_id: GroupId, session_id: SessionId) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut now_empty = false;
        if let Some(members) = inner.groups.get_mut(&group_id) {
            members.remove(&session_id);
            now_empty = members.is_empty();
        }
        if now_empty {
            inner.groups.remove(&group_id);
        }
        if let Some(groups) = inner.sessions.get_mut(&session_id) {
            groups.remove(&group_id);
        }
    }

    /// Snapshot of a group's live members. The lock is released before
    /// the caller performs any I/O with the handles.
    pub fn members(&self, group_id: GroupId) -> Vec<SessionHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .groups
            .get(&group_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a user's live sessions.
    pub fn sessions_for_user(&self, user_id: UserId) -> Vec<SessionHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .users
            .get(&user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the session is currently in the group's live member set.
    pub fn is_live_member(&self, group_id: GroupId, session_id: SessionId) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .groups
            .get(&group_id)
            .is_some_and(|members| members.contains_key(&session_id))
    }

    /// Remove a session from every group and the user directory.
    /// Called on disconnect; O(number of that session's groups).
    pub fn remove_session(&self, session_id: SessionId) {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        if let Some(group_ids) = inner.sessions.remove(&session_id) {
            for group_id in group_ids {
                let mut now_empty = false;
                if let Some(members) = inner.groups.get_mut(&group_id) {
                    members.remove(&session_id);
                    now_empty = members.is_empty();
                }
                if now_empty {
                    inner.groups.remove(&group_id);
                }
            }
        }

        inner.users.retain(|_, sessions| {
            sessions.remove(&session_id);
            !sessions.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::loopback_handle;

    #[test]
    fn join_then_members_contains_session() {
        let registry = GroupRegistry::new();
        let (handle, _rx) = loopback_handle();
        let group = GroupId(1);

        registry.join(group, handle.clone()).unwrap();
        let members = registry.members(group);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id(), handle.id());
        assert!(registry.is_live_member(group, handle.id()));
    }

    #[test]
    fn double_join_is_already_member() {
        let registry = GroupRegistry::new();
        let (handle, _rx) = loopback_handle();
        let group = GroupId(1);

        registry.join(group, handle.clone()).unwrap();
        assert_eq!(
            registry.join(group, handle),
            Err(RegistryError::AlreadyMember(group))
        );
    }

    #[test]
    fn remove_session_clears_every_group() {
        let registry = GroupRegistry::new();
        let (handle, _rx) = loopback_handle();
        let (other, _rx2) = loopback_handle();

        for id in [1, 2, 3] {
            registry.join(GroupId(id), handle.clone()).unwrap();
        }
        registry.join(GroupId(2), other.clone()).unwrap();
        registry.register_user_session(UserId(7), handle.clone());

        registry.remove_session(handle.id());

        for id in [1, 2, 3] {
            assert!(!registry.is_live_member(GroupId(id), handle.id()));
        }
        // Other sessions are untouched.
        assert!(registry.is_live_member(GroupId(2), other.id()));
        assert!(registry.sessions_for_user(UserId(7)).is_empty());
    }

    #[test]
    fn leave_only_affects_one_group() {
        let registry = GroupRegistry::new();
        let (handle, _rx) = loopback_handle();

        registry.join(GroupId(1), handle.clone()).unwrap();
        registry.join(GroupId(2), handle.clone()).unwrap();

        registry.leave(GroupId(1), handle.id());

        assert!(!registry.is_live_member(GroupId(1), handle.id()));
        assert!(registry.is_live_member(GroupId(2), handle.id()));
    }

    #[test]
    fn members_is_a_snapshot() {
        let registry = GroupRegistry::new();
        let (handle, _rx) = loopback_handle();
        let group = GroupId(1);
        registry.join(group, handle.clone()).unwrap();

        let snapshot = registry.members(group);
        registry.remove_session(handle.id());

        // The snapshot taken before removal still holds the handle.
        assert_eq!(snapshot.len(), 1);
        assert!(registry.members(group).is_empty());
    }

    #[test]
    fn user_directory_tracks_multiple_sessions() {
        let registry = GroupRegistry::new();
        let (a, _rxa) = loopback_handle();
        let (b, _rxb) = loopback_handle();
        let user = UserId(1);

        registry.register_user_session(user, a.clone());
        registry.register_user_session(user, b);
        assert_eq!(registry.sessions_for_user(user).len(), 2);

        registry.remove_session(a.id());
        assert_eq!(registry.sessions_for_user(user).len(), 1);
    }
}
