//! Event repository: CRUD, filtered queries and duplicate detection.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use commlog_core::{
    Direction, Event, EventFilter, EventStatus, EventType, Property, RecipientList, INVALID_ID,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::errors::{Result, StoreError};

const COLUMNS: &str = "id, type, start_time, end_time, direction, is_draft, is_read,
     is_missed_call, is_video_call, status, local_uid, remote_uids, free_text, subject,
     group_id, message_token";

/// Event repository: stateless, every method takes `&Connection`.
pub struct EventRepo;

impl EventRepo {
    /// Insert a new event. Returns the assigned id.
    pub fn insert(conn: &Connection, event: &Event) -> Result<i32> {
        let remote_uids = encode_remotes(event.recipients())?;
        let _ = conn.execute(
            "INSERT INTO events (type, start_time, end_time, direction, is_draft, is_read,
             is_missed_call, is_video_call, status, local_uid, remote_uids, free_text, subject,
             group_id, message_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                event.event_type().as_i32(),
                event.start_time().timestamp(),
                event.end_time().timestamp(),
                event.direction().as_i32(),
                event.is_draft(),
                event.is_read(),
                event.is_missed_call(),
                event.is_video_call(),
                event.status().as_i32(),
                event.local_uid(),
                remote_uids,
                event.free_text(),
                event.subject(),
                group_column(event.group_id()),
                event.message_token(),
            ],
        )?;
        row_id(conn)
    }

    /// Write the event's modified properties.
    ///
    /// Returns `false` when no stored column was modified. Fails with
    /// [`StoreError::EventNotFound`] if the row does not exist.
    pub fn update(conn: &Connection, event: &Event) -> Result<bool> {
        let mut assignments = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        for property in event.modified_properties().iter() {
            let (column, value) = match property {
                Property::Id | Property::EventCount => continue,
                Property::Type => ("type", Value::from(event.event_type().as_i32())),
                Property::StartTime => ("start_time", Value::from(event.start_time().timestamp())),
                Property::EndTime => ("end_time", Value::from(event.end_time().timestamp())),
                Property::Direction => ("direction", Value::from(event.direction().as_i32())),
                Property::IsDraft => ("is_draft", Value::from(event.is_draft())),
                Property::IsRead => ("is_read", Value::from(event.is_read())),
                Property::IsMissedCall => ("is_missed_call", Value::from(event.is_missed_call())),
                Property::IsVideoCall => ("is_video_call", Value::from(event.is_video_call())),
                Property::Status => ("status", Value::from(event.status().as_i32())),
                Property::LocalUid => ("local_uid", Value::from(event.local_uid().to_string())),
                Property::Recipients => {
                    ("remote_uids", Value::from(encode_remotes(event.recipients())?))
                }
                Property::FreeText => ("free_text", Value::from(event.free_text().to_string())),
                Property::Subject => ("subject", Value::from(event.subject().to_string())),
                Property::GroupId => (
                    "group_id",
                    group_column(event.group_id()).map_or(Value::Null, Value::from),
                ),
                Property::MessageToken => {
                    ("message_token", Value::from(event.message_token().to_string()))
                }
            };
            values.push(value);
            assignments.push(format!("{column} = ?{}", values.len()));
        }
        if assignments.is_empty() {
            return Ok(false);
        }

        values.push(Value::from(event.id()));
        let sql = format!(
            "UPDATE events SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len()
        );
        let changed = conn.execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::EventNotFound(event.id()));
        }
        Ok(true)
    }

    /// Delete an event. Returns whether a row was removed.
    pub fn delete(conn: &Connection, id: i32) -> Result<bool> {
        let changed = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Get a single event by id.
    pub fn get_by_id(conn: &Connection, id: i32) -> Result<Option<Event>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Run a filtered query, newest first.
    ///
    /// The remote-address predicate is phone aware and cannot be expressed in
    /// SQL, so when present it is applied after the fetch together with the
    /// row window.
    pub fn query(conn: &Connection, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut sql = format!("SELECT {COLUMNS} FROM events WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if !filter.event_types.is_empty() {
            let placeholders: Vec<String> = filter
                .event_types
                .iter()
                .map(|t| {
                    values.push(Value::from(t.as_i32()));
                    format!("?{}", values.len())
                })
                .collect();
            let _ = write!(sql, " AND type IN ({})", placeholders.join(", "));
        }
        if let Some(local_uid) = &filter.local_uid {
            values.push(Value::from(local_uid.clone()));
            let _ = write!(sql, " AND local_uid = ?{}", values.len());
        }
        if let Some(direction) = filter.direction {
            values.push(Value::from(direction.as_i32()));
            let _ = write!(sql, " AND direction = ?{}", values.len());
        }
        if let Some(group_id) = filter.group_id {
            values.push(Value::from(group_id));
            let _ = write!(sql, " AND group_id = ?{}", values.len());
        }
        for (column, flag) in [
            ("is_missed_call", filter.is_missed_call),
            ("is_draft", filter.is_draft),
            ("is_read", filter.is_read),
        ] {
            if let Some(flag) = flag {
                values.push(Value::from(flag));
                let _ = write!(sql, " AND {column} = ?{}", values.len());
            }
        }
        if let Some(after) = filter.start_after {
            values.push(Value::from(after.timestamp()));
            let _ = write!(sql, " AND start_time > ?{}", values.len());
        }
        if let Some(before) = filter.start_before {
            values.push(Value::from(before.timestamp()));
            let _ = write!(sql, " AND start_time < ?{}", values.len());
        }
        sql.push_str(" ORDER BY start_time DESC, id DESC");

        let post_filter = filter.remote_uid.is_some();
        if !post_filter {
            // SQLite needs a LIMIT for OFFSET; -1 means unbounded.
            match (filter.limit, filter.offset) {
                (Some(limit), offset) => {
                    let _ = write!(sql, " LIMIT {limit} OFFSET {}", offset.unwrap_or(0));
                }
                (None, Some(offset)) => {
                    let _ = write!(sql, " LIMIT -1 OFFSET {offset}");
                }
                (None, None) => {}
            }
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::map_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }

        if post_filter {
            events = events
                .into_iter()
                .filter(|e| filter.matches(e))
                .skip(filter.offset.unwrap_or(0))
                .take(filter.limit.unwrap_or(usize::MAX))
                .collect();
        }
        Ok(events)
    }

    /// Find a stored event that `event` duplicates.
    ///
    /// A duplicate has the same type, account, start time, direction, body
    /// and recipients; when `event` carries a message token the token must
    /// match as well.
    pub fn find_duplicate(conn: &Connection, event: &Event) -> Result<Option<i32>> {
        let mut sql = String::from(
            "SELECT id, local_uid, remote_uids FROM events
             WHERE type = ?1 AND local_uid = ?2 AND start_time = ?3
               AND direction = ?4 AND free_text = ?5",
        );
        let mut values = vec![
            Value::from(event.event_type().as_i32()),
            Value::from(event.local_uid().to_string()),
            Value::from(event.start_time().timestamp()),
            Value::from(event.direction().as_i32()),
            Value::from(event.free_text().to_string()),
        ];
        if !event.message_token().is_empty() {
            values.push(Value::from(event.message_token().to_string()));
            let _ = write!(sql, " AND message_token = ?{}", values.len());
        }
        if event.is_valid() {
            values.push(Value::from(event.id()));
            let _ = write!(sql, " AND id != ?{}", values.len());
        }

        let mut stmt = conn.prepare(&sql)?;
        let candidates = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for candidate in candidates {
            let (id, local_uid, remotes) = candidate?;
            if decode_remotes(&local_uid, &remotes)?.matches(event.recipients()) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Set the read flag on a batch of events. Returns rows changed.
    pub fn mark_read(conn: &Connection, ids: &[i32], read: bool) -> Result<usize> {
        let mut stmt = conn.prepare_cached("UPDATE events SET is_read = ?1 WHERE id = ?2")?;
        let mut changed = 0;
        for id in ids {
            changed += stmt.execute(params![read, id])?;
        }
        Ok(changed)
    }

    /// Number of stored events.
    pub fn count(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Event> {
        let local_uid: String = row.get(10)?;
        let remotes: String = row.get(11)?;
        let recipients = decode_remotes(&local_uid, &remotes).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                11,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;

        let mut event = Event::new(EventType::from_i32(row.get(1)?));
        event.set_id(row.get(0)?);
        event.set_start_time(timestamp(row.get(2)?));
        event.set_end_time(timestamp(row.get(3)?));
        event.set_direction(Direction::from_i32(row.get(4)?));
        event.set_is_draft(row.get(5)?);
        event.set_is_read(row.get(6)?);
        event.set_is_missed_call(row.get(7)?);
        event.set_is_video_call(row.get(8)?);
        event.set_status(EventStatus::from_i32(row.get(9)?));
        event.set_local_uid(local_uid);
        event.set_recipients(recipients);
        event.set_free_text(row.get::<_, String>(12)?);
        event.set_subject(row.get::<_, String>(13)?);
        event.set_group_id(row.get::<_, Option<i32>>(14)?.unwrap_or(INVALID_ID));
        event.set_message_token(row.get::<_, String>(15)?);
        event.reset_modified();
        Ok(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Column helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn encode_remotes(recipients: &RecipientList) -> Result<String> {
    Ok(serde_json::to_string(&recipients.remote_uids())?)
}

pub(crate) fn decode_remotes(
    local_uid: &str,
    json: &str,
) -> std::result::Result<RecipientList, serde_json::Error> {
    let remotes: Vec<String> = serde_json::from_str(json)?;
    Ok(RecipientList::from_remotes(local_uid, remotes))
}

pub(crate) fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn row_id(conn: &Connection) -> Result<i32> {
    i32::try_from(conn.last_insert_rowid())
        .map_err(|_| StoreError::InvalidOperation("row id exceeds i32 range".into()))
}

fn group_column(group_id: i32) -> Option<i32> {
    (group_id >= 0).then_some(group_id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;
    use chrono::TimeZone;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, min, 0).unwrap()
    }

    fn call(remote: &str, time: DateTime<Utc>, missed: bool) -> Event {
        let mut event = Event::new(EventType::Call);
        event.set_local_uid("ring/tel/account0");
        event.set_recipients(RecipientList::from_remotes("ring/tel/account0", [remote]));
        event.set_direction(Direction::Inbound);
        event.set_is_missed_call(missed);
        event.set_start_time(time);
        event.set_end_time(time);
        event
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let conn = setup();
        let mut event = call("+15550100", at(10, 0), true);
        event.set_free_text("hello");
        let id = EventRepo::insert(&conn, &event).unwrap();

        let stored = EventRepo::get_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(stored.id(), id);
        assert_eq!(stored.event_type(), EventType::Call);
        assert_eq!(stored.start_time(), at(10, 0));
        assert!(stored.is_missed_call());
        assert_eq!(stored.free_text(), "hello");
        assert_eq!(stored.group_id(), INVALID_ID);
        assert_eq!(stored.recipients().remote_uids(), vec!["+15550100"]);
        assert!(stored.modified_properties().is_empty());
    }

    #[test]
    fn get_missing_is_none() {
        let conn = setup();
        assert!(EventRepo::get_by_id(&conn, 99).unwrap().is_none());
    }

    #[test]
    fn update_writes_only_modified_columns() {
        let conn = setup();
        let id = EventRepo::insert(&conn, &call("5550100", at(10, 0), false)).unwrap();

        let mut patch = Event::default();
        patch.set_id(id);
        patch.set_is_read(true);
        assert!(EventRepo::update(&conn, &patch).unwrap());

        let stored = EventRepo::get_by_id(&conn, id).unwrap().unwrap();
        assert!(stored.is_read());
        assert_eq!(stored.event_type(), EventType::Call);
        assert_eq!(stored.start_time(), at(10, 0));
    }

    #[test]
    fn update_without_changes_is_false() {
        let conn = setup();
        let id = EventRepo::insert(&conn, &call("5550100", at(10, 0), false)).unwrap();
        let mut stored = EventRepo::get_by_id(&conn, id).unwrap().unwrap();
        stored.set_event_count(4);
        assert!(!EventRepo::update(&conn, &stored).unwrap());
    }

    #[test]
    fn update_missing_row_fails() {
        let conn = setup();
        let mut patch = Event::default();
        patch.set_id(42);
        patch.set_is_read(true);
        let err = EventRepo::update(&conn, &patch).unwrap_err();
        assert!(matches!(err, StoreError::EventNotFound(42)));
    }

    #[test]
    fn query_orders_newest_first() {
        let conn = setup();
        let _ = EventRepo::insert(&conn, &call("5550100", at(9, 0), false)).unwrap();
        let _ = EventRepo::insert(&conn, &call("5550100", at(11, 0), false)).unwrap();
        let _ = EventRepo::insert(&conn, &call("5550100", at(10, 0), false)).unwrap();

        let events = EventRepo::query(&conn, &EventFilter::default()).unwrap();
        let times: Vec<_> = events.iter().map(Event::start_time).collect();
        assert_eq!(times, vec![at(11, 0), at(10, 0), at(9, 0)]);
    }

    #[test]
    fn query_same_time_orders_by_id_desc() {
        let conn = setup();
        let a = EventRepo::insert(&conn, &call("5550100", at(9, 0), false)).unwrap();
        let b = EventRepo::insert(&conn, &call("5550199", at(9, 0), false)).unwrap();
        let ids: Vec<_> = EventRepo::query(&conn, &EventFilter::default())
            .unwrap()
            .iter()
            .map(Event::id)
            .collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn query_applies_predicates_and_window() {
        let conn = setup();
        for minute in 0..5 {
            let _ = EventRepo::insert(&conn, &call("5550100", at(10, minute), minute % 2 == 0))
                .unwrap();
        }
        let mut sms = Event::new(EventType::Sms);
        sms.set_start_time(at(12, 0));
        let _ = EventRepo::insert(&conn, &sms).unwrap();

        let missed = EventFilter {
            event_types: vec![EventType::Call],
            is_missed_call: Some(true),
            ..EventFilter::default()
        };
        assert_eq!(EventRepo::query(&conn, &missed).unwrap().len(), 3);

        let window = EventFilter::types([EventType::Call]).with_window(Some(2), Some(1));
        let events = EventRepo::query(&conn, &window).unwrap();
        let times: Vec<_> = events.iter().map(Event::start_time).collect();
        assert_eq!(times, vec![at(10, 3), at(10, 2)]);

        let offset_only = EventFilter::default().with_window(None, Some(4));
        assert_eq!(EventRepo::query(&conn, &offset_only).unwrap().len(), 2);
    }

    #[test]
    fn query_remote_is_phone_aware() {
        let conn = setup();
        let _ = EventRepo::insert(&conn, &call("+358401234567", at(10, 0), false)).unwrap();
        let _ = EventRepo::insert(&conn, &call("+358409999999", at(10, 1), false)).unwrap();
        let filter = EventFilter {
            remote_uid: Some("040 123 4567".into()),
            ..EventFilter::default()
        };
        let events = EventRepo::query(&conn, &filter).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].start_time(), at(10, 0));
    }

    #[test]
    fn duplicate_detection() {
        let conn = setup();
        let original = call("+15550100", at(10, 0), false);
        let id = EventRepo::insert(&conn, &original).unwrap();

        let same = call("555-0100", at(10, 0), false);
        assert_eq!(EventRepo::find_duplicate(&conn, &same).unwrap(), Some(id));

        let later = call("+15550100", at(10, 1), false);
        assert_eq!(EventRepo::find_duplicate(&conn, &later).unwrap(), None);

        let other_remote = call("+15550199", at(10, 0), false);
        assert_eq!(EventRepo::find_duplicate(&conn, &other_remote).unwrap(), None);
    }

    #[test]
    fn duplicate_requires_matching_token() {
        let conn = setup();
        let mut original = call("5550100", at(10, 0), false);
        original.set_message_token("tok-1");
        let _ = EventRepo::insert(&conn, &original).unwrap();

        let mut other = call("5550100", at(10, 0), false);
        other.set_message_token("tok-2");
        assert_eq!(EventRepo::find_duplicate(&conn, &other).unwrap(), None);
    }

    #[test]
    fn mark_read_and_delete() {
        let conn = setup();
        let a = EventRepo::insert(&conn, &call("5550100", at(10, 0), false)).unwrap();
        let b = EventRepo::insert(&conn, &call("5550100", at(10, 1), false)).unwrap();
        assert_eq!(EventRepo::mark_read(&conn, &[a, b], true).unwrap(), 2);
        assert!(EventRepo::get_by_id(&conn, b).unwrap().unwrap().is_read());

        assert!(EventRepo::delete(&conn, a).unwrap());
        assert!(!EventRepo::delete(&conn, a).unwrap());
        assert_eq!(EventRepo::count(&conn).unwrap(), 1);
    }
}
