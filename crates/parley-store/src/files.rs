//! Metadata for uploaded files. The bytes themselves live in the server's
//! file store; this table records what exists and where it belongs.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_shared::types::{FileId, GroupId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::FileRecord;

impl Database {
    /// Record a completed upload.
    pub fn insert_file(&self, file: &FileRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO files (id, group_id, uploader_id, file_name, size_bytes, blake3_hex, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                file.id.to_string(),
                file.group_id.0,
                file.uploader_id.0,
                file.file_name,
                file.size_bytes,
                file.blake3_hex,
                file.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch file metadata by id.
    pub fn get_file(&self, id: FileId) -> Result<FileRecord> {
        self.conn()
            .query_row(
                "SELECT id, group_id, uploader_id, file_name, size_bytes, blake3_hex, created_at
                 FROM files WHERE id = ?1",
                params![id.to_string()],
                row_to_file,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List files uploaded to a group, newest first.
    pub fn list_files_for_group(&self, group_id: GroupId) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, group_id, uploader_id, file_name, size_bytes, blake3_hex, created_at
             FROM files WHERE group_id = ?1
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map(params![group_id.0], row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }
}

/// Map a `rusqlite::Row` to a [`FileRecord`].
fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let id_str: String = row.get(0)?;
    let group_id: i64 = row.get(1)?;
    let uploader_id: i64 = row.get(2)?;
    let file_name: String = row.get(3)?;
    let size_bytes: i64 = row.get(4)?;
    let blake3_hex: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(FileRecord {
        id: FileId(id),
        group_id: GroupId(group_id),
        uploader_id: UserId(uploader_id),
        file_name,
        size_bytes,
        blake3_hex,
        created_at,
    })
}
