//! The storage gateway: the only way the cache reads or writes events.
//!
//! [`StorageGateway`] is object safe so the cache can hold an
//! `Arc<dyn StorageGateway>` and tests can substitute a fake. Every
//! operation is atomic: a bulk write either commits completely or leaves
//! the database untouched.

use std::path::Path;

use commlog_core::{Event, EventFilter, Group};
use commlog_settings::DatabaseSettings;
use rusqlite::Connection;
use tracing::{debug, instrument, warn};

use crate::errors::{Result, StoreError};
use crate::sqlite::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::{EventRepo, GroupRepo};

/// Persistent event and group storage.
pub trait StorageGateway: Send + Sync {
    /// Events matching `filter`, newest first.
    fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    /// One event by id.
    fn get_event(&self, id: i32) -> Result<Option<Event>>;

    /// Store new events, assigning their ids.
    ///
    /// Fails with [`StoreError::DuplicateEvent`] if any event is already
    /// stored; in that case nothing is committed and no id is assigned.
    fn add_events(&self, events: &mut [Event]) -> Result<()>;

    /// Write the modified properties of stored events.
    fn modify_events(&self, events: &[Event]) -> Result<()>;

    /// Delete events by id.
    fn delete_events(&self, ids: &[i32]) -> Result<()>;

    /// Set the read flag on a batch of events.
    fn mark_read(&self, ids: &[i32], read: bool) -> Result<()>;

    /// Store a new group, assigning its id.
    fn add_group(&self, group: &mut Group) -> Result<()>;

    /// Overwrite a stored group.
    fn modify_group(&self, group: &Group) -> Result<()>;

    /// Delete groups and their events.
    fn delete_groups(&self, ids: &[i32]) -> Result<()>;

    /// One group by id.
    fn get_group(&self, id: i32) -> Result<Option<Group>>;

    /// Every group, most recently modified first.
    fn list_groups(&self) -> Result<Vec<Group>>;
}

/// [`StorageGateway`] over a pooled `SQLite` database.
pub struct SqliteGateway {
    pool: ConnectionPool,
}

impl SqliteGateway {
    /// Wrap a pool, bringing its schema up to date.
    pub fn new(pool: ConnectionPool) -> Result<Self> {
        let conn = pool.get()?;
        let _ = run_migrations(&conn)?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Open (creating if needed) the database named in `settings`.
    pub fn open(settings: &DatabaseSettings) -> Result<Self> {
        if let Some(parent) = Path::new(&settings.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidOperation(format!(
                        "cannot create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let pool = connection::new_file(&settings.path, &ConnectionConfig::from(settings))?;
        Self::new(pool)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::new(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    /// Underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls back.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl StorageGateway for SqliteGateway {
    fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        EventRepo::query(&conn, filter)
    }

    fn get_event(&self, id: i32) -> Result<Option<Event>> {
        let conn = self.conn()?;
        EventRepo::get_by_id(&conn, id)
    }

    #[instrument(skip_all, fields(count = events.len()))]
    fn add_events(&self, events: &mut [Event]) -> Result<()> {
        let ids = self.with_transaction(|tx| {
            let mut ids = Vec::with_capacity(events.len());
            for event in events.iter() {
                if let Some(existing_id) = EventRepo::find_duplicate(tx, event)? {
                    warn!(existing_id, "duplicate event in bulk add, rolling back");
                    return Err(StoreError::DuplicateEvent { existing_id });
                }
                let id = EventRepo::insert(tx, event)?;
                if event.group_id() >= 0 {
                    GroupRepo::touch(tx, event.group_id(), id, event.start_time())?;
                }
                ids.push(id);
            }
            Ok(ids)
        })?;

        for (event, id) in events.iter_mut().zip(ids) {
            event.set_id(id);
            event.reset_modified();
        }
        debug!("events added");
        Ok(())
    }

    #[instrument(skip_all, fields(count = events.len()))]
    fn modify_events(&self, events: &[Event]) -> Result<()> {
        self.with_transaction(|tx| {
            for event in events {
                if !event.is_valid() {
                    return Err(StoreError::InvalidOperation(
                        "cannot modify an unstored event".into(),
                    ));
                }
                let _ = EventRepo::update(tx, event)?;
            }
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn delete_events(&self, ids: &[i32]) -> Result<()> {
        self.with_transaction(|tx| {
            for &id in ids {
                if !EventRepo::delete(tx, id)? {
                    return Err(StoreError::EventNotFound(id));
                }
            }
            Ok(())
        })
    }

    #[instrument(skip(self))]
    fn mark_read(&self, ids: &[i32], read: bool) -> Result<()> {
        let changed = self.with_transaction(|tx| EventRepo::mark_read(tx, ids, read))?;
        debug!(changed, "read flags updated");
        Ok(())
    }

    fn add_group(&self, group: &mut Group) -> Result<()> {
        let id = self.with_transaction(|tx| GroupRepo::insert(tx, &*group))?;
        group.id = id;
        Ok(())
    }

    fn modify_group(&self, group: &Group) -> Result<()> {
        if !group.is_valid() {
            return Err(StoreError::InvalidOperation(
                "cannot modify an unstored group".into(),
            ));
        }
        self.with_transaction(|tx| GroupRepo::update(tx, group))
    }

    #[instrument(skip(self))]
    fn delete_groups(&self, ids: &[i32]) -> Result<()> {
        self.with_transaction(|tx| {
            for &id in ids {
                if !GroupRepo::delete(tx, id)? {
                    return Err(StoreError::GroupNotFound(id));
                }
            }
            Ok(())
        })
    }

    fn get_group(&self, id: i32) -> Result<Option<Group>> {
        let conn = self.conn()?;
        GroupRepo::get_by_id(&conn, id)
    }

    fn list_groups(&self) -> Result<Vec<Group>> {
        let conn = self.conn()?;
        GroupRepo::list(&conn)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
