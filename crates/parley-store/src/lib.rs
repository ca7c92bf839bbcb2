//! # parley-store
//!
//! SQLite persistence for the Parley chat server: users, groups and
//! their membership relation, message history, ban records, and file
//! metadata. The live group registry in the server is a rebuildable view;
//! the tables here are the source of truth.

pub mod bans;
pub mod database;
pub mod error;
pub mod files;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::{BanSubjectKind, FileRecord, Group, StoredMessage, User};
