//! Group repository.

use chrono::{DateTime, Utc};
use commlog_core::Group;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::event::{decode_remotes, encode_remotes, row_id, timestamp};
use crate::errors::{Result, StoreError};

/// Group repository: stateless, every method takes `&Connection`.
pub struct GroupRepo;

impl GroupRepo {
    /// Insert a new group. Returns the assigned id.
    pub fn insert(conn: &Connection, group: &Group) -> Result<i32> {
        let _ = conn.execute(
            "INSERT INTO groups (local_uid, remote_uids, chat_name, last_event_id, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.local_uid,
                encode_remotes(&group.recipients)?,
                group.chat_name,
                group.last_event_id,
                group.last_modified.timestamp(),
            ],
        )?;
        row_id(conn)
    }

    /// Overwrite every column of a stored group.
    pub fn update(conn: &Connection, group: &Group) -> Result<()> {
        let changed = conn.execute(
            "UPDATE groups SET local_uid = ?1, remote_uids = ?2, chat_name = ?3,
             last_event_id = ?4, last_modified = ?5 WHERE id = ?6",
            params![
                group.local_uid,
                encode_remotes(&group.recipients)?,
                group.chat_name,
                group.last_event_id,
                group.last_modified.timestamp(),
                group.id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::GroupNotFound(group.id));
        }
        Ok(())
    }

    /// Record a new newest event on a group.
    pub fn touch(conn: &Connection, id: i32, last_event_id: i32, at: DateTime<Utc>) -> Result<()> {
        let changed = conn.execute(
            "UPDATE groups SET last_event_id = ?1, last_modified = ?2 WHERE id = ?3",
            params![last_event_id, at.timestamp(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::GroupNotFound(id));
        }
        Ok(())
    }

    /// Delete a group and, through the foreign key, its events.
    pub fn delete(conn: &Connection, id: i32) -> Result<bool> {
        let changed = conn.execute("DELETE FROM groups WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Get a group by id.
    pub fn get_by_id(conn: &Connection, id: i32) -> Result<Option<Group>> {
        let group = conn
            .query_row(
                "SELECT id, local_uid, remote_uids, chat_name, last_event_id, last_modified
                 FROM groups WHERE id = ?1",
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(group)
    }

    /// All groups, most recently modified first.
    pub fn list(conn: &Connection) -> Result<Vec<Group>> {
        let mut stmt = conn.prepare(
            "SELECT id, local_uid, remote_uids, chat_name, last_event_id, last_modified
             FROM groups ORDER BY last_modified DESC, id DESC",
        )?;
        let rows = stmt.query_map([], Self::map_row)?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Group> {
        let local_uid: String = row.get(1)?;
        let remotes: String = row.get(2)?;
        let recipients = decode_remotes(&local_uid, &remotes).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let mut group = Group::new(local_uid, recipients);
        group.id = row.get(0)?;
        group.chat_name = row.get(3)?;
        group.last_event_id = row.get(4)?;
        group.last_modified = timestamp(row.get(5)?);
        Ok(group)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
