//! CRUD operations for [`Group`] records and the membership relation.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::types::{GroupId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Group;

const GROUP_COLUMNS: &str = "g.id, g.name, g.created_at,
     EXISTS (SELECT 1 FROM bans b WHERE b.subject_type = 'group' AND b.subject_id = g.id)";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new group and return the stored record.
    pub fn create_group(&self, name: &str) -> Result<Group> {
        let created_at = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO groups (name, created_at) VALUES (?1, ?2)",
                params![name, created_at.to_rfc3339()],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::AlreadyExists
                }
                other => StoreError::Sqlite(other),
            })?;

        Ok(Group {
            id: GroupId(self.conn().last_insert_rowid()),
            name: name.to_string(),
            is_banned: false,
            created_at,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single group by id.
    pub fn get_group(&self, id: GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM groups g WHERE g.id = ?1"),
                params![id.0],
                row_to_group,
            )
            .map_err(not_found)
    }

    /// Fetch a single group by name.
    pub fn get_group_by_name(&self, name: &str) -> Result<Group> {
        self.conn()
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM groups g WHERE g.name = ?1"),
                params![name],
                row_to_group,
            )
            .map_err(not_found)
    }

    /// List the groups a user is a member of, ordered by name.
    pub fn list_groups_for_user(&self, user_id: UserId) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups g
             JOIN memberships m ON m.group_id = g.id
             WHERE m.user_id = ?1
             ORDER BY g.name ASC"
        ))?;

        let rows = stmt.query_map(params![user_id.0], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add a user to a group. Inserting an existing pair is a no-op.
    pub fn add_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO memberships (group_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![group_id.0, user_id.0, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Remove a user from a group. Returns `true` if a row was deleted.
    pub fn remove_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM memberships WHERE group_id = ?1 AND user_id = ?2",
            params![group_id.0, user_id.0],
        )?;
        Ok(affected > 0)
    }

    /// Whether the membership pair exists.
    pub fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM memberships WHERE group_id = ?1 AND user_id = ?2",
            params![group_id.0, user_id.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of members in a group.
    pub fn member_count(&self, group_id: GroupId) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM memberships WHERE group_id = ?1",
            params![group_id.0],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Ids of all members of a group.
    pub fn list_members(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM memberships WHERE group_id = ?1 ORDER BY user_id")?;

        let rows = stmt.query_map(params![group_id.0], |row| row.get::<_, i64>(0))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(UserId(row?));
        }
        Ok(members)
    }
}

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

/// Map a `rusqlite::Row` to a [`Group`].
fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let created_str: String = row.get(2)?;
    let is_banned: bool = row.get(3)?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Group {
        id: GroupId(id),
        name,
        is_banned,
        created_at,
    })
}
