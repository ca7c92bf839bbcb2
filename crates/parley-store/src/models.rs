//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be mapped
//! onto wire summaries without intermediate types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::types::{FileId, GroupId, MessageId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account. `is_banned` is resolved against the bans table at
/// load time and is never cached by callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Opaque credential hash; never leaves the store/auth boundary.
    pub password_hash: String,
    pub is_admin: bool,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A chat group. A group with exactly two members functions as a private
/// chat; that property is derived from membership, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single persisted chat message.
///
/// `seq` is assigned by SQLite on insert and establishes the per-group
/// delivery order recorded by the router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub seq: i64,
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    /// Sender's username, joined in at query time for history replies.
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ban
// ---------------------------------------------------------------------------

/// What kind of subject a ban record applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BanSubjectKind {
    User,
    Group,
}

impl BanSubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BanSubjectKind::User => "user",
            BanSubjectKind::Group => "group",
        }
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Metadata for a fully uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: FileId,
    pub group_id: GroupId,
    pub uploader_id: UserId,
    pub file_name: String,
    pub size_bytes: i64,
    /// BLAKE3 content hash (hex string).
    pub blake3_hex: String,
    pub created_at: DateTime<Utc>,
}
