//! SQLite-backed implementation of `StorageArea`
//!
//! Items live in a single table, one row per key, with the value stored as
//! JSON text. Every successful write is announced on the area's own change
//! feed.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use syncstores::storage::CHANGE_FEED_CAPACITY;
use syncstores::{Change, ChangeEvent, Items, KeySelector, StorageArea, StorageError};
use tokio::sync::broadcast;

/// Persistent storage area
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    on_changed: broadcast::Sender<ChangeEvent>,
}

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl SqliteStorage {
    /// Open the database at the given path
    ///
    /// Creates the database and table if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or table creation fails.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    ///
    /// Returns error if table creation fails.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS items (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        let (on_changed, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            on_changed,
        })
    }

    fn load_one(conn: &Connection, key: &str) -> Result<Option<Value>, StorageError> {
        let text = conn
            .query_row("SELECT value FROM items WHERE key = ?", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(backend)?;
        text.map(|text| serde_json::from_str(&text).map_err(backend))
            .transpose()
    }

    fn load_all(conn: &Connection) -> Result<Items, StorageError> {
        let mut stmt = conn
            .prepare("SELECT key, value FROM items ORDER BY key")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(key, text)| {
                let value = serde_json::from_str(&text).map_err(backend)?;
                Ok((key, value))
            })
            .collect()
    }

    fn load(&self, keys: &KeySelector) -> Result<Items, StorageError> {
        let conn = self.conn.lock();
        let wanted: &[String] = match keys {
            KeySelector::All => return Self::load_all(&conn),
            KeySelector::One(key) => std::slice::from_ref(key),
            KeySelector::Many(keys) => keys,
        };
        let mut items = Items::new();
        for key in wanted {
            if let Some(value) = Self::load_one(&conn, key)? {
                items.insert(key.clone(), value);
            }
        }
        Ok(items)
    }

    fn save(&self, items: &Items) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        for (key, value) in items {
            tx.execute(
                "INSERT OR REPLACE INTO items (key, value) VALUES (?, ?)",
                params![key, value.to_string()],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM items WHERE key = ?", params![key])
            .map_err(backend)?;
        Ok(deleted > 0)
    }

    fn emit(&self, changes: BTreeMap<String, Change>) {
        if changes.is_empty() {
            return;
        }
        if self
            .on_changed
            .send(ChangeEvent {
                changes,
                area: None,
            })
            .is_err()
        {
            tracing::trace!("no change listeners");
        }
    }
}

impl StorageArea for SqliteStorage {
    fn get<'a>(&'a self, keys: &'a KeySelector) -> BoxFuture<'a, Result<Items, StorageError>> {
        async move { self.load(keys) }.boxed()
    }

    fn set(&self, items: Items) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            self.save(&items)?;
            tracing::debug!(count = items.len(), "items saved");
            let changes = items
                .into_iter()
                .map(|(key, value)| (key, Change::set(value)))
                .collect();
            self.emit(changes);
            Ok(())
        }
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            if self.delete(key)? {
                self.emit(BTreeMap::from([(key.to_string(), Change::removed())]));
            }
            Ok(())
        }
        .boxed()
    }

    fn on_changed(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.on_changed.subscribe())
    }
}
