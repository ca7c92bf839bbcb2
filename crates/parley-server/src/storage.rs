//! The persistence collaborator consumed by the router and coordinator.
//!
//! The server only ever talks to [`Storage`]; the default implementation
//! wraps a [`parley_store::Database`]. Every method returns an explicit
//! `Result` — the router treats each call as fallible.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use parley_shared::types::{FileId, GroupId, MessageId, UserId};
use parley_store::models::BanSubjectKind;
use parley_store::{Database, FileRecord, Group, StoreError, StoredMessage, User};

pub trait Storage: Send + Sync {
    fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<User, StoreError>;
    fn get_user_by_name(&self, username: &str) -> Result<User, StoreError>;
    fn get_user_by_id(&self, id: UserId) -> Result<User, StoreError>;
    fn list_users(&self) -> Result<Vec<User>, StoreError>;

    fn set_user_ban(&self, user: UserId, banned: bool) -> Result<(), StoreError>;
    fn set_group_ban(&self, group: GroupId, banned: bool) -> Result<(), StoreError>;
    fn is_user_banned(&self, user: UserId) -> Result<bool, StoreError>;
    fn is_group_banned(&self, group: GroupId) -> Result<bool, StoreError>;

    fn create_group(&self, name: &str) -> Result<Group, StoreError>;
    fn get_group(&self, id: GroupId) -> Result<Group, StoreError>;
    fn get_group_by_name(&self, name: &str) -> Result<Group, StoreError>;
    fn add_member(&self, group: GroupId, user: UserId) -> Result<(), StoreError>;
    fn remove_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError>;
    fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError>;
    fn list_groups_for_user(&self, user: UserId) -> Result<Vec<Group>, StoreError>;
    fn member_count(&self, group: GroupId) -> Result<u32, StoreError>;

    /// Persist a message and return its assigned sequence number.
    fn save_message(
        &self,
        id: MessageId,
        group: GroupId,
        sender: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
    fn get_history(&self, group: GroupId, limit: u32) -> Result<Vec<StoredMessage>, StoreError>;

    fn record_file(&self, record: &FileRecord) -> Result<(), StoreError>;
    fn get_file(&self, id: FileId) -> Result<FileRecord, StoreError>;
}

/// SQLite-backed storage. `rusqlite` connections are not `Sync`, so the
/// database sits behind a mutex; individual queries are short.
pub struct SqliteStorage {
    db: Mutex<Database>,
}

impl SqliteStorage {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let db = self.db.lock().expect("storage mutex poisoned");
        f(&db)
    }
}

impl Storage for SqliteStorage {
    fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<User, StoreError> {
        self.with_db(|db| db.create_user(username, password_hash, is_admin))
    }

    fn get_user_by_name(&self, username: &str) -> Result<User, StoreError> {
        self.with_db(|db| db.get_user_by_name(username))
    }

    fn get_user_by_id(&self, id: UserId) -> Result<User, StoreError> {
        self.with_db(|db| db.get_user_by_id(id))
    }

    fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.with_db(|db| db.list_users())
    }

    fn set_user_ban(&self, user: UserId, banned: bool) -> Result<(), StoreError> {
        self.with_db(|db| db.set_ban(BanSubjectKind::User, user.0, banned))
    }

    fn set_group_ban(&self, group: GroupId, banned: bool) -> Result<(), StoreError> {
        self.with_db(|db| db.set_ban(BanSubjectKind::Group, group.0, banned))
    }

    fn is_user_banned(&self, user: UserId) -> Result<bool, StoreError> {
        self.with_db(|db| db.is_banned(BanSubjectKind::User, user.0))
    }

    fn is_group_banned(&self, group: GroupId) -> Result<bool, StoreError> {
        self.with_db(|db| db.is_banned(BanSubjectKind::Group, group.0))
    }

    fn create_group(&self, name: &str) -> Result<Group, StoreError> {
        self.with_db(|db| db.create_group(name))
    }

    fn get_group(&self, id: GroupId) -> Result<Group, StoreError> {
        self.with_db(|db| db.get_group(id))
    }

    fn get_group_by_name(&self, name: &str) -> Result<Group, StoreError> {
        self.with_db(|db| db.get_group_by_name(name))
    }

    fn add_member(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
        self.with_db(|db| db.add_member(group, user))
    }

    fn remove_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        self.with_db(|db| db.remove_member(group, user))
    }

    fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        self.with_db(|db| db.is_member(group, user))
    }

    fn list_groups_for_user(&self, user: UserId) -> Result<Vec<Group>, StoreError> {
        self.with_db(|db| db.list_groups_for_user(user))
    }

    fn member_count(&self, group: GroupId) -> Result<u32, StoreError> {
        self.with_db(|db| db.member_count(group))
    }

    fn save_message(
        &self,
        id: MessageId,
        group: GroupId,
        sender: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.with_db(|db| db.insert_message(id, group, sender, content, sent_at))
    }

    fn get_history(&self, group: GroupId, limit: u32) -> Result<Vec<StoredMessage>, StoreError> {
        self.with_db(|db| db.get_history(group, limit))
    }

    fn record_file(&self, record: &FileRecord) -> Result<(), StoreError> {
        self.with_db(|db| db.insert_file(record))
    }

    fn get_file(&self, id: FileId) -> Result<FileRecord, StoreError> {
        self.with_db(|db| db.get_file(id))
    }
}
