//! Ban records: explicit, non-expiring mute flags on users and groups.
//!
//! A ban is a set-membership check; the gate re-reads it for every message
//! so an admin action takes effect on the subject's very next post.

use chrono::Utc;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::BanSubjectKind;

impl Database {
    /// Set or clear a ban. Both directions are idempotent.
    pub fn set_ban(&self, kind: BanSubjectKind, subject_id: i64, banned: bool) -> Result<()> {
        if banned {
            self.conn().execute(
                "INSERT OR IGNORE INTO bans (subject_type, subject_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![kind.as_str(), subject_id, Utc::now().to_rfc3339()],
            )?;
        } else {
            self.conn().execute(
                "DELETE FROM bans WHERE subject_type = ?1 AND subject_id = ?2",
                params![kind.as_str(), subject_id],
            )?;
        }
        Ok(())
    }

    /// Whether the subject is currently banned.
    pub fn is_banned(&self, kind: BanSubjectKind, subject_id: i64) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM bans WHERE subject_type = ?1 AND subject_id = ?2",
            params![kind.as_str(), subject_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
